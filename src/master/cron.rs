use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{PrexdError, Result};
use crate::master::manager::NameRegistry;
use crate::protocol::{GroupSubmission, JobSubmission, Submission};

/// Deferred re-submission keyed by a future deadline.
///
/// Once `removed` is set the handler is a tombstone: it stays in the
/// deadline map until the sweep garbage-collects it, but it can no longer
/// fire and it is gone from the name map.
#[derive(Debug)]
pub struct CronHandler {
    pub job_name: String,
    pub deadline: DateTime<Utc>,
    pub description: Submission,
    pub child_names: Vec<String>,
    removed: AtomicBool,
}

impl CronHandler {
    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronJobInfo {
    pub job_name: String,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CronState {
    /// Deadline-ordered multimap; the sequence number disambiguates equal
    /// deadlines.
    jobs: BTreeMap<(DateTime<Utc>, u64), Arc<CronHandler>>,
    names: HashMap<String, Arc<CronHandler>>,
    seq: u64,
}

/// Recurring-job scheduler. Fired handlers re-submit their job description
/// through the resubmission channel; the job manager pushes the resulting
/// jobs and re-arms the schedule.
#[derive(Debug)]
pub struct CronManager {
    state: Mutex<CronState>,
    names_service: Arc<NameRegistry>,
    resubmit_tx: mpsc::UnboundedSender<Submission>,
}

impl CronManager {
    pub fn new(
        names_service: Arc<NameRegistry>,
        resubmit_tx: mpsc::UnboundedSender<Submission>,
    ) -> Self {
        Self {
            state: Mutex::new(CronState::default()),
            names_service,
            resubmit_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CronState> {
        self.state.lock().expect("cron lock poisoned")
    }

    fn next_deadline(expr: &str, after_execution: bool) -> Result<DateTime<Utc>> {
        let schedule = cron::Schedule::from_str(expr)
            .map_err(|_| PrexdError::InvalidCron(expr.to_string()))?;
        let now = Utc::now();
        let mut deadline = schedule
            .after(&now)
            .next()
            .ok_or_else(|| PrexdError::InvalidCron(expr.to_string()))?;
        // A schedule that has already fired this instant must not re-fire
        // in a tight loop.
        if after_execution && deadline <= now {
            deadline += chrono::Duration::minutes(1);
        }
        Ok(deadline)
    }

    fn insert(&self, handler: Arc<CronHandler>) {
        let mut state = self.lock();
        state.seq += 1;
        let key = (handler.deadline, state.seq);
        state.names
            .insert(handler.job_name.clone(), Arc::clone(&handler));
        state.jobs.insert(key, handler);
    }

    /// Register a recurring single job. The initial push also claims the
    /// job's name with the name service; re-arms after a firing skip that.
    pub fn push_job(&self, job: &JobSubmission, after_execution: bool) -> Result<()> {
        let name = job
            .name
            .clone()
            .ok_or_else(|| PrexdError::MalformedPayload("cron job requires a name".into()))?;
        let expr = job
            .cron
            .as_deref()
            .ok_or_else(|| PrexdError::MalformedPayload("missing cron expression".into()))?;
        let deadline = Self::next_deadline(expr, after_execution)?;

        if !after_execution {
            self.names_service.register(&name)?;
        }

        self.insert(Arc::new(CronHandler {
            job_name: name.clone(),
            deadline,
            description: Submission::Single(job.clone()),
            child_names: Vec::new(),
            removed: AtomicBool::new(false),
        }));
        tracing::info!(%name, %deadline, "cron job armed");
        Ok(())
    }

    /// Register a recurring meta-job. The initial push claims the group
    /// name and every named child.
    pub fn push_meta_job(&self, group: &GroupSubmission, after_execution: bool) -> Result<()> {
        let expr = group
            .cron
            .as_deref()
            .ok_or_else(|| PrexdError::MalformedPayload("missing cron expression".into()))?;
        let deadline = Self::next_deadline(expr, after_execution)?;

        let child_names: Vec<String> = group
            .jobs
            .iter()
            .filter_map(|job| job.name.clone())
            .collect();

        if !after_execution {
            self.names_service.register(&group.name)?;
            for child in &child_names {
                self.names_service.register(child)?;
            }
        }

        self.insert(Arc::new(CronHandler {
            job_name: group.name.clone(),
            deadline,
            description: Submission::Group(group.clone()),
            child_names,
            removed: AtomicBool::new(false),
        }));
        tracing::info!(name = %group.name, %deadline, "cron meta-job armed");
        Ok(())
    }

    /// Collect and fire every non-tombstoned handler whose deadline has
    /// passed. Tombstones in the ready range are garbage-collected without
    /// firing. Firing happens outside the lock.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> usize {
        let ready: Vec<Arc<CronHandler>> = {
            let mut state = self.lock();
            let expired: Vec<(DateTime<Utc>, u64)> = state
                .jobs
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect();

            let mut ready = Vec::new();
            for key in expired {
                if let Some(handler) = state.jobs.remove(&key) {
                    if !handler.is_removed() {
                        state.names.remove(&handler.job_name);
                        ready.push(handler);
                    }
                }
            }
            ready
        };

        let mut fired = 0;
        for handler in ready {
            // A stop can land between collection and invocation; the
            // tombstone wins.
            if handler.is_removed() {
                continue;
            }
            tracing::debug!(name = %handler.job_name, "cron handler fired");
            if self.resubmit_tx.send(handler.description.clone()).is_err() {
                tracing::warn!(name = %handler.job_name, "resubmission channel closed");
            }
            fired += 1;
        }
        fired
    }

    /// Tombstone one handler by name and release every name it claimed.
    pub fn stop_job(&self, job_name: &str) {
        let handler = {
            let mut state = self.lock();
            state.names.remove(job_name)
        };
        if let Some(handler) = handler {
            self.release(&handler);
        }
    }

    /// Tombstone everything and clear both maps.
    pub fn stop_all_jobs(&self) {
        let mut state = self.lock();
        for handler in state.jobs.values() {
            self.release(handler);
        }
        state.jobs.clear();
        state.names.clear();
    }

    fn release(&self, handler: &Arc<CronHandler>) {
        handler.removed.store(true, Ordering::Release);
        for child in &handler.child_names {
            self.names_service.release(child);
        }
        self.names_service.release(&handler.job_name);
        tracing::info!(name = %handler.job_name, "cron job stopped");
    }

    /// Read-only view over the active entries.
    pub fn jobs_info(&self) -> Vec<CronJobInfo> {
        let state = self.lock();
        state
            .names
            .values()
            .filter(|handler| !handler.is_removed())
            .map(|handler| CronJobInfo {
                job_name: handler.job_name.clone(),
                deadline: handler.deadline,
            })
            .collect()
    }

    pub fn has_handler(&self, job_name: &str) -> bool {
        let state = self.lock();
        state
            .names
            .get(job_name)
            .map(|handler| !handler.is_removed())
            .unwrap_or(false)
    }

    /// The one-second deadline sweep.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_timeouts(Utc::now());
                }
                _ = shutdown.cancelled() => {
                    self.stop_all_jobs();
                    break;
                }
            }
        }
    }
}
