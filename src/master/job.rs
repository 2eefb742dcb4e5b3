use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::lang::Lang;
use crate::protocol::JobSubmission;

/// Skip cron re-arming for this job after a terminal failure.
pub const JOB_FLAG_NO_RESCHEDULE: u32 = 1;

/// One unit of user-declared work. Immutable after creation; mutable
/// execution state lives in the reconciler's run table.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub script: Vec<u8>,
    pub lang: Lang,
    pub num_nodes: u32,
    pub max_failed_nodes: u32,
    /// Whole-job bound, seconds.
    pub timeout: u64,
    /// Admission-to-start bound, seconds.
    pub queue_timeout: u64,
    /// Per-task bound, seconds.
    pub task_timeout: u64,
    pub flags: u32,
    pub name: Option<String>,
    pub cron: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: i64, submission: &JobSubmission, script: Vec<u8>) -> Self {
        let mut flags = 0;
        if submission.no_reschedule {
            flags |= JOB_FLAG_NO_RESCHEDULE;
        }
        Self {
            id,
            script,
            lang: submission.lang,
            num_nodes: submission.num_nodes,
            max_failed_nodes: submission.max_failed_nodes,
            timeout: submission.timeout,
            queue_timeout: submission.queue_timeout,
            task_timeout: submission.task_timeout,
            flags,
            name: submission.name.clone(),
            cron: submission.cron.clone(),
            submitted_at: Utc::now(),
        }
    }

    pub fn script_len(&self) -> usize {
        self.script.len()
    }

    pub fn no_reschedule(&self) -> bool {
        self.flags & JOB_FLAG_NO_RESCHEDULE != 0
    }
}

/// An ordered list of jobs sharing one schedule and a name.
#[derive(Debug, Clone)]
pub struct JobGroup {
    pub name: String,
    pub cron: Option<String>,
    pub jobs: Vec<Arc<Job>>,
}

/// FIFO dispatch queue with O(1) lookup by id.
///
/// The FIFO holds jobs not yet fully dispatched; the id index holds every
/// live job until its terminal outcome deletes it. `pop` order is push
/// order, earlier push winning ties.
#[derive(Debug, Default)]
pub struct JobQueue {
    fifo: VecDeque<i64>,
    id_to_job: HashMap<i64, Arc<Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Arc<Job>) {
        self.fifo.push_back(job.id);
        self.id_to_job.insert(job.id, job);
    }

    /// Re-enter an already-live job at the back of the FIFO (task retry).
    pub fn requeue(&mut self, job_id: i64) {
        if self.id_to_job.contains_key(&job_id) && !self.fifo.contains(&job_id) {
            self.fifo.push_back(job_id);
        }
    }

    /// Remove the head job from the FIFO. The job stays live (indexed by
    /// id) until `delete` on its terminal outcome.
    pub fn pop(&mut self) -> Option<Arc<Job>> {
        let id = self.fifo.pop_front()?;
        self.id_to_job.get(&id).cloned()
    }

    /// Inspect the head without removing it.
    pub fn top(&self) -> Option<Arc<Job>> {
        let id = self.fifo.front()?;
        self.id_to_job.get(id).cloned()
    }

    pub fn get(&self, job_id: i64) -> Option<Arc<Job>> {
        self.id_to_job.get(&job_id).cloned()
    }

    pub fn delete(&mut self, job_id: i64) -> bool {
        self.fifo.retain(|&id| id != job_id);
        self.id_to_job.remove(&job_id).is_some()
    }

    pub fn clear(&mut self) {
        self.fifo.clear();
        self.id_to_job.clear();
    }

    /// Number of live jobs (dispatched or not).
    pub fn num_jobs(&self) -> usize {
        self.id_to_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_job.is_empty()
    }

    /// Jobs still waiting for dispatch, in pop order.
    pub fn pending(&self) -> usize {
        self.fifo.len()
    }
}
