use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{PrexdError, Result};
use crate::master::job::{Job, JobQueue};
use crate::master::reconciler::{JobEvent, RunTable};
use crate::master::registry::WorkerRegistry;
use crate::master::timeout::TimeoutManager;
use crate::protocol::{frame, ErrResponse, TaskRequest};

/// Matches ready jobs with available workers and pushes tasks over TCP.
///
/// The loop sleeps on a wake signal raised by job pushes, retries, worker
/// completions and recovered pings; a semaphore caps concurrent dispatches.
pub struct JobSender {
    config: Config,
    queue: Arc<Mutex<JobQueue>>,
    table: Arc<Mutex<RunTable>>,
    registry: Arc<WorkerRegistry>,
    timeouts: Arc<TimeoutManager>,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    wake: Arc<Notify>,
    send_slots: Arc<Semaphore>,
}

impl JobSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        queue: Arc<Mutex<JobQueue>>,
        table: Arc<Mutex<RunTable>>,
        registry: Arc<WorkerRegistry>,
        timeouts: Arc<TimeoutManager>,
        events_tx: mpsc::UnboundedSender<JobEvent>,
        wake: Arc<Notify>,
    ) -> Self {
        let send_slots = Arc::new(Semaphore::new(config.max_simult_sending_jobs));
        Self {
            config,
            queue,
            table,
            registry,
            timeouts,
            events_tx,
            wake,
            send_slots,
        }
    }

    /// Reserve the next (worker, job, task) triple, or None when either
    /// side has nothing to offer right now.
    fn reserve(&self) -> Option<(String, Arc<Job>, u32)> {
        let mut queue = self.queue.lock().expect("job queue lock poisoned");
        loop {
            let job = queue.top()?;
            let worker = self.registry.select()?;

            let mut table = self.table.lock().expect("run table lock poisoned");
            match table.begin_dispatch(job.id) {
                Some((task_id, drained)) => {
                    if drained {
                        queue.pop();
                        if let Some(run) = table.get_mut(job.id) {
                            if !run.fully_dispatched {
                                run.fully_dispatched = true;
                                self.timeouts.unwatch_queue(job.id);
                            }
                        }
                    }
                    self.registry.on_assign(&worker);
                    self.timeouts
                        .watch_task(job.id, task_id, Duration::from_secs(job.task_timeout));
                    return Some((worker, job, task_id));
                }
                None if table.get(job.id).is_some() => {
                    // Live job with nothing pending surfaced at the head (a
                    // retry raced its own requeue); drop the fifo entry only.
                    queue.pop();
                }
                None => {
                    // The run is gone (terminal raced us); drop the stale head.
                    queue.delete(job.id);
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            while let Some((worker, job, task_id)) = self.reserve() {
                let permit = match self.send_slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let sender = Arc::clone(&self);
                tokio::spawn(async move {
                    sender.send_job(&worker, &job, task_id).await;
                    drop(permit);
                });
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// One dispatch: connect, framed request, framed `{err}` response.
    /// Every outcome ends as a reconciler event and frees the worker.
    async fn send_job(&self, worker: &str, job: &Arc<Job>, task_id: u32) {
        tracing::debug!(job_id = job.id, task_id, worker, "dispatching task");

        let event = match self.exchange(worker, job, task_id).await {
            Ok(response) => {
                self.registry.on_complete(worker);
                JobEvent::TaskDone {
                    worker: worker.to_string(),
                    job_id: job.id,
                    task_id,
                    err: response.err,
                }
            }
            Err(error) => {
                tracing::warn!(job_id = job.id, task_id, worker, %error, "dispatch failed");
                self.registry.on_complete(worker);
                self.registry.on_ping_failure(worker);
                JobEvent::SendFailed {
                    worker: worker.to_string(),
                    job_id: job.id,
                    task_id,
                }
            }
        };

        let _ = self.events_tx.send(event);
        // The worker slot is free again; there may be more to dispatch.
        self.wake.notify_one();
    }

    async fn exchange(&self, worker: &str, job: &Arc<Job>, task_id: u32) -> Result<ErrResponse> {
        let mut stream = self.connect(worker).await?;

        let request = TaskRequest {
            id: job.id,
            len: job.script_len() as u32,
            lang: job.lang,
            task_id,
            num_tasks: job.num_nodes,
            timeout: job.task_timeout,
        };
        let payload = serde_json::to_vec(&request)?;
        frame::write_frame(&mut stream, &payload).await?;

        let response = frame::read_frame(&mut stream).await?;
        let response: ErrResponse = serde_json::from_slice(&response)
            .map_err(|e| PrexdError::MalformedPayload(e.to_string()))?;
        Ok(response)
    }

    async fn connect(&self, worker: &str) -> Result<TcpStream> {
        let addr = format!("{}:{}", worker, self.config.worker_port);
        let addr = lookup_host(addr.as_str())
            .await?
            .next()
            .ok_or_else(|| PrexdError::Config(format!("cannot resolve {}", addr)))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(self.config.send_buffer_size as u32)?;
        Ok(socket.connect(addr).await?)
    }
}
