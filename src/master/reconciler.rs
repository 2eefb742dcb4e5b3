use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::ErrorCode;
use crate::master::cron::CronManager;
use crate::master::history::JobHistory;
use crate::master::job::{Job, JobQueue};
use crate::master::registry::WorkerRegistry;
use crate::master::timeout::TimeoutManager;
use crate::protocol::{JobSummary, TaskOutcome};
use crate::shmem::SlotLease;

/// Task-level outcomes flowing into the reconciler.
#[derive(Debug)]
pub enum JobEvent {
    /// A worker answered the dispatch with an error code (0 = success).
    TaskDone {
        worker: String,
        job_id: i64,
        task_id: u32,
        err: i32,
    },
    /// The dispatch connection itself failed.
    SendFailed {
        worker: String,
        job_id: i64,
        task_id: u32,
    },
    QueueExpired {
        job_id: i64,
    },
    TaskExpired {
        job_id: i64,
        task_id: u32,
    },
}

/// Mutable execution state for one live job. The `Job` itself stays
/// immutable; everything that moves lives here.
#[derive(Debug)]
pub struct JobRun {
    pub job: Arc<Job>,
    /// Task ids awaiting dispatch, in monotonic order; retries re-enter at
    /// the back.
    pub pending: VecDeque<u32>,
    pub in_flight: HashSet<u32>,
    pub executed: u32,
    pub failed: u32,
    /// Tasks that already reconciled successfully; duplicate completions
    /// for these are dropped.
    pub done_tasks: HashSet<u32>,
    pub per_task: BTreeMap<u32, i32>,
    /// Set once the last initial task left the queue; a stale queue-timeout
    /// after this point is ignored.
    pub fully_dispatched: bool,
    pub lease: SlotLease,
    pub callback: Option<oneshot::Sender<JobSummary>>,
}

impl JobRun {
    pub fn new(job: Arc<Job>, lease: SlotLease, callback: Option<oneshot::Sender<JobSummary>>) -> Self {
        let pending = (0..job.num_nodes).collect();
        Self {
            job,
            pending,
            in_flight: HashSet::new(),
            executed: 0,
            failed: 0,
            done_tasks: HashSet::new(),
            per_task: BTreeMap::new(),
            fully_dispatched: false,
            lease,
            callback,
        }
    }
}

/// Arena of live job runs, keyed by job id. Owned jointly by the sender
/// (dispatch side) and the reconciler (completion side).
#[derive(Debug, Default)]
pub struct RunTable {
    runs: HashMap<i64, JobRun>,
}

impl RunTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, run: JobRun) {
        self.runs.insert(run.job.id, run);
    }

    pub fn get(&self, job_id: i64) -> Option<&JobRun> {
        self.runs.get(&job_id)
    }

    pub fn get_mut(&mut self, job_id: i64) -> Option<&mut JobRun> {
        self.runs.get_mut(&job_id)
    }

    pub fn remove(&mut self, job_id: i64) -> Option<JobRun> {
        self.runs.remove(&job_id)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Reserve the next task of a job for dispatch. Returns the task id and
    /// whether that drained the pending set.
    pub fn begin_dispatch(&mut self, job_id: i64) -> Option<(u32, bool)> {
        let run = self.runs.get_mut(&job_id)?;
        let task_id = run.pending.pop_front()?;
        run.in_flight.insert(task_id);
        Some((task_id, run.pending.is_empty()))
    }
}

/// Counts per-job successes and failures, schedules retries within the
/// declared tolerance and drives jobs to their terminal outcome.
pub struct Reconciler {
    queue: Arc<Mutex<JobQueue>>,
    table: Arc<Mutex<RunTable>>,
    registry: Arc<WorkerRegistry>,
    timeouts: Arc<TimeoutManager>,
    cron: Arc<CronManager>,
    history: Arc<dyn JobHistory>,
    sender_wake: Arc<Notify>,
}

enum Outcome {
    Done,
    Failed(ErrorCode),
}

impl Reconciler {
    pub fn new(
        queue: Arc<Mutex<JobQueue>>,
        table: Arc<Mutex<RunTable>>,
        registry: Arc<WorkerRegistry>,
        timeouts: Arc<TimeoutManager>,
        cron: Arc<CronManager>,
        history: Arc<dyn JobHistory>,
        sender_wake: Arc<Notify>,
    ) -> Self {
        Self {
            queue,
            table,
            registry,
            timeouts,
            cron,
            history,
            sender_wake,
        }
    }

    pub fn handle_event(&self, event: JobEvent) {
        match event {
            JobEvent::TaskDone {
                worker,
                job_id,
                task_id,
                err,
            } => {
                tracing::debug!(job_id, task_id, %worker, err, "task reconciled");
                self.on_task_outcome(job_id, task_id, err, false);
            }
            JobEvent::SendFailed {
                worker,
                job_id,
                task_id,
            } => {
                tracing::warn!(job_id, task_id, %worker, "worker unreachable");
                self.on_task_outcome(
                    job_id,
                    task_id,
                    ErrorCode::WorkerUnreachable.as_i32(),
                    true,
                );
            }
            JobEvent::TaskExpired { job_id, task_id } => {
                tracing::warn!(job_id, task_id, "task timed out");
                self.on_task_outcome(job_id, task_id, ErrorCode::TaskTimeout.as_i32(), false);
            }
            JobEvent::QueueExpired { job_id } => {
                self.on_queue_expired(job_id);
            }
        }
    }

    fn on_task_outcome(&self, job_id: i64, task_id: u32, err: i32, unreachable: bool) {
        enum After {
            Drop,
            Retry,
            Terminal(JobRun, Outcome),
        }

        // The queue lock is never taken while the table lock is held; the
        // sender acquires them in queue-then-table order.
        let after = {
            let mut table = self.table.lock().expect("run table lock poisoned");
            let Some(run) = table.get_mut(job_id) else {
                // Terminal already; a late completion after stop or
                // reconciliation is dropped.
                return;
            };
            if run.done_tasks.contains(&task_id) || !run.in_flight.remove(&task_id) {
                return;
            }
            self.timeouts.unwatch_task(job_id, task_id);
            run.per_task.insert(task_id, err);

            let terminal = if err == 0 {
                run.executed += 1;
                run.done_tasks.insert(task_id);
                (run.executed == run.job.num_nodes).then_some(Outcome::Done)
            } else {
                // An unreachable worker is charged to the worker, not the
                // job's tolerance, as long as the fleet can still replace it.
                let charge_budget = !unreachable || self.registry.available_count() == 0;
                if charge_budget {
                    run.failed += 1;
                }
                if run.failed > run.job.max_failed_nodes {
                    Some(Outcome::Failed(ErrorCode::RetriesExhausted))
                } else {
                    run.pending.push_back(task_id);
                    None
                }
            };

            match terminal {
                Some(outcome) => {
                    let run = table.remove(job_id).expect("run present");
                    After::Terminal(run, outcome)
                }
                None if err != 0 => After::Retry,
                None => After::Drop,
            }
        };

        match after {
            After::Terminal(run, outcome) => self.finish(run, outcome),
            After::Retry => {
                // Retry goes back through the dispatch queue.
                self.queue
                    .lock()
                    .expect("job queue lock poisoned")
                    .requeue(job_id);
                self.sender_wake.notify_one();
            }
            After::Drop => {}
        }
    }

    fn on_queue_expired(&self, job_id: i64) {
        let terminal = {
            let mut table = self.table.lock().expect("run table lock poisoned");
            match table.get(job_id) {
                Some(run) if !run.fully_dispatched => table.remove(job_id),
                _ => None,
            }
        };
        if let Some(run) = terminal {
            tracing::warn!(job_id, "queue timeout");
            self.finish(run, Outcome::Failed(ErrorCode::QueueTimeout));
        }
    }

    /// Terminal bookkeeping. Runs outside the table lock; the callback must
    /// never observe the reconciler mid-update.
    fn finish(&self, mut run: JobRun, outcome: Outcome) {
        let job = Arc::clone(&run.job);

        {
            let mut queue = self.queue.lock().expect("job queue lock poisoned");
            queue.delete(job.id);
        }
        self.timeouts.unwatch_job(job.id);
        self.history.delete(job.id);

        let (outcome_str, err) = match outcome {
            Outcome::Done => ("done", ErrorCode::Ok),
            Outcome::Failed(code) => ("failed", code),
        };
        let summary = JobSummary {
            job_id: job.id,
            outcome: outcome_str.to_string(),
            err: err.as_i32(),
            per_task: run
                .per_task
                .iter()
                .map(|(&task_id, &err)| TaskOutcome { task_id, err })
                .collect(),
        };

        match err {
            ErrorCode::Ok => {
                tracing::info!(job_id = job.id, executed = run.executed, "job done")
            }
            code => {
                tracing::warn!(job_id = job.id, failed = run.failed, %code, "job failed");
                if !job.no_reschedule() {
                    if let Some(name) = job.name.as_deref() {
                        if self.cron.has_handler(name) {
                            // The recurring schedule covers the next attempt.
                            tracing::info!(job_id = job.id, name, "next cron fire will retry");
                        }
                    }
                }
            }
        }

        if let Some(callback) = run.callback.take() {
            let _ = callback.send(summary);
        }
        // Dropping the run releases the shared-memory slot lease.
    }

    /// Consume completion events until shutdown. Events arriving after
    /// cancellation are dropped.
    pub async fn run(
        self,
        mut events_rx: mpsc::UnboundedReceiver<JobEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
