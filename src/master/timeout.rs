use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::master::reconciler::JobEvent;

#[derive(Debug, Default)]
struct Watches {
    queue: HashMap<i64, Instant>,
    tasks: HashMap<(i64, u32), Instant>,
}

/// Wall-clock watchdog over two timer streams: admission-to-start bounds
/// per job and per-task bounds per dispatched task. One monotonic sweep
/// every second; accuracy is one second either way.
#[derive(Debug)]
pub struct TimeoutManager {
    watches: Mutex<Watches>,
    expired_tx: mpsc::UnboundedSender<JobEvent>,
}

impl TimeoutManager {
    pub fn new(expired_tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            watches: Mutex::new(Watches::default()),
            expired_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Watches> {
        self.watches.lock().expect("timeout lock poisoned")
    }

    pub fn watch_queue(&self, job_id: i64, timeout: Duration) {
        self.lock().queue.insert(job_id, Instant::now() + timeout);
    }

    pub fn unwatch_queue(&self, job_id: i64) {
        self.lock().queue.remove(&job_id);
    }

    pub fn watch_task(&self, job_id: i64, task_id: u32, timeout: Duration) {
        self.lock()
            .tasks
            .insert((job_id, task_id), Instant::now() + timeout);
    }

    pub fn unwatch_task(&self, job_id: i64, task_id: u32) {
        self.lock().tasks.remove(&(job_id, task_id));
    }

    /// Drop every watch belonging to a job that reached a terminal outcome.
    pub fn unwatch_job(&self, job_id: i64) {
        let mut watches = self.lock();
        watches.queue.remove(&job_id);
        watches.tasks.retain(|(id, _), _| *id != job_id);
    }

    /// Collect expired watches and surface them to the reconciler as
    /// failures. Returns the number of expirations delivered.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        {
            let mut watches = self.lock();
            watches.queue.retain(|&job_id, &mut deadline| {
                if now >= deadline {
                    expired.push(JobEvent::QueueExpired { job_id });
                    false
                } else {
                    true
                }
            });
            watches.tasks.retain(|&(job_id, task_id), &mut deadline| {
                if now >= deadline {
                    expired.push(JobEvent::TaskExpired { job_id, task_id });
                    false
                } else {
                    true
                }
            });
        }

        let count = expired.len();
        for event in expired {
            let _ = self.expired_tx.send(event);
        }
        count
    }

    pub async fn run(self: std::sync::Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(Instant::now());
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
