use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use crate::error::{PrexdError, Result};
use crate::master::cron::CronManager;
use crate::master::history::JobHistory;
use crate::master::job::{Job, JobQueue};
use crate::master::reconciler::{JobRun, RunTable};
use crate::master::timeout::TimeoutManager;
use crate::protocol::{JobSubmission, JobSummary, Submission};
use crate::shmem::{ShmemPool, MAX_SCRIPT_SIZE};

/// Unique names for active recurring jobs. A name stays claimed from the
/// initial push until the job is stopped.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: Mutex<HashSet<String>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) -> Result<()> {
        let mut names = self.names.lock().expect("name registry lock poisoned");
        if !names.insert(name.to_string()) {
            return Err(PrexdError::NameTaken(name.to_string()));
        }
        Ok(())
    }

    pub fn release(&self, name: &str) {
        self.names
            .lock()
            .expect("name registry lock poisoned")
            .remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names
            .lock()
            .expect("name registry lock poisoned")
            .contains(name)
    }
}

/// Turns job descriptions into scheduled work: allocates ids, resolves
/// script bodies, takes shared-memory leases, routes recurring
/// descriptions through the cron manager and one-shot jobs into the
/// dispatch queue.
pub struct JobManager {
    exe_dir: PathBuf,
    next_id: AtomicI64,
    names: Arc<NameRegistry>,
    queue: Arc<Mutex<JobQueue>>,
    table: Arc<Mutex<RunTable>>,
    timeouts: Arc<TimeoutManager>,
    history: Arc<dyn JobHistory>,
    shmem: Arc<ShmemPool>,
    cron: Arc<CronManager>,
    sender_wake: Arc<Notify>,
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exe_dir: PathBuf,
        names: Arc<NameRegistry>,
        queue: Arc<Mutex<JobQueue>>,
        table: Arc<Mutex<RunTable>>,
        timeouts: Arc<TimeoutManager>,
        history: Arc<dyn JobHistory>,
        shmem: Arc<ShmemPool>,
        cron: Arc<CronManager>,
        sender_wake: Arc<Notify>,
    ) -> Self {
        Self {
            exe_dir,
            next_id: AtomicI64::new(0),
            names,
            queue,
            table,
            timeouts,
            history,
            shmem,
            cron,
            sender_wake,
        }
    }

    pub fn names(&self) -> &Arc<NameRegistry> {
        &self.names
    }

    /// Parse a raw submission payload and push the work it describes.
    pub fn submit(&self, payload: &[u8]) -> Result<Vec<i64>> {
        let submission: Submission = serde_json::from_slice(payload)
            .map_err(|e| PrexdError::MalformedPayload(e.to_string()))?;
        self.build_and_push(submission, false, None)
    }

    /// Compile a submission into jobs. Recurring descriptions are armed in
    /// the cron manager on first sight and both pushed and re-armed when
    /// resubmitted by a cron firing (`after_execution`). Returns the ids of
    /// the jobs actually queued.
    pub fn build_and_push(
        &self,
        submission: Submission,
        after_execution: bool,
        callback: Option<oneshot::Sender<JobSummary>>,
    ) -> Result<Vec<i64>> {
        match submission {
            Submission::Single(job) => {
                if job.cron.is_some() {
                    self.cron.push_job(&job, after_execution)?;
                    if !after_execution {
                        return Ok(Vec::new());
                    }
                }
                Ok(vec![self.push_one(&job, callback)?])
            }
            Submission::Group(group) => {
                if group.cron.is_some() {
                    self.cron.push_meta_job(&group, after_execution)?;
                    if !after_execution {
                        return Ok(Vec::new());
                    }
                }
                let mut ids = Vec::with_capacity(group.jobs.len());
                for job in &group.jobs {
                    ids.push(self.push_one(job, None)?);
                }
                Ok(ids)
            }
        }
    }

    /// Queue one job: lease its shared-memory slot, index the run, arm the
    /// queue timeout and wake the sender.
    pub fn push_one(
        &self,
        submission: &JobSubmission,
        callback: Option<oneshot::Sender<JobSummary>>,
    ) -> Result<i64> {
        if submission.num_nodes == 0 {
            return Err(PrexdError::MalformedPayload("num_nodes must be > 0".into()));
        }
        let script = self.resolve_script(submission)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let lease = self.shmem.lease(id, &script)?;
        let job = Arc::new(Job::new(id, submission, script));

        self.history.put(id, serde_json::to_string(submission)?);

        // The run must be visible before the job can surface at the queue
        // head; the sender locks queue then table.
        {
            let mut table = self.table.lock().expect("run table lock poisoned");
            table.insert(JobRun::new(Arc::clone(&job), lease, callback));
        }
        {
            let mut queue = self.queue.lock().expect("job queue lock poisoned");
            queue.push(Arc::clone(&job));
        }
        self.timeouts
            .watch_queue(id, Duration::from_secs(job.queue_timeout));
        self.sender_wake.notify_one();

        tracing::info!(
            job_id = id,
            lang = %job.lang,
            num_nodes = job.num_nodes,
            "job queued"
        );
        Ok(id)
    }

    fn resolve_script(&self, submission: &JobSubmission) -> Result<Vec<u8>> {
        let script = match (&submission.script, &submission.script_ref) {
            (Some(script), None) => script.clone().into_bytes(),
            (None, Some(path)) => std::fs::read(self.exe_dir.join(path))?,
            _ => {
                return Err(PrexdError::MalformedPayload(
                    "exactly one of script / script_ref required".into(),
                ))
            }
        };
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(PrexdError::ScriptTooLarge(script.len()));
        }
        Ok(script)
    }

    /// Tombstone a recurring job by name.
    pub fn stop_job(&self, name: &str) {
        self.cron.stop_job(name);
    }

    pub fn stop_all_jobs(&self) {
        self.cron.stop_all_jobs();
    }
}
