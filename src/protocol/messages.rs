use serde::{Deserialize, Serialize};

use crate::lang::Lang;

fn default_num_nodes() -> u32 {
    1
}

fn default_timeout() -> u64 {
    1800
}

/// One job description as submitted to the master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSubmission {
    /// Inline script body. Exactly one of `script` / `script_ref` must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Path to a script file, resolved relative to the master's exe dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_ref: Option<String>,
    pub lang: Lang,
    #[serde(default = "default_num_nodes")]
    pub num_nodes: u32,
    #[serde(default)]
    pub max_failed_nodes: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_timeout")]
    pub queue_timeout: u64,
    #[serde(default = "default_timeout")]
    pub task_timeout: u64,
    #[serde(default)]
    pub no_reschedule: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

/// A named set of jobs sharing one schedule (a meta-job).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSubmission {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    pub jobs: Vec<JobSubmission>,
}

/// Anything the admission endpoint accepts. Group payloads are recognized
/// by their `jobs` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Submission {
    Group(GroupSubmission),
    Single(JobSubmission),
}

impl Submission {
    pub fn name(&self) -> Option<&str> {
        match self {
            Submission::Group(group) => Some(&group.name),
            Submission::Single(job) => job.name.as_deref(),
        }
    }

    pub fn cron(&self) -> Option<&str> {
        match self {
            Submission::Group(group) => group.cron.as_deref(),
            Submission::Single(job) => job.cron.as_deref(),
        }
    }
}

/// Task dispatch payload, master to worker. The script body travels through
/// the shared-memory slot for `id`, not the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub id: i64,
    pub len: u32,
    pub lang: Lang,
    pub task_id: u32,
    pub num_tasks: u32,
    pub timeout: u64,
}

/// The universal response frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ErrResponse {
    pub err: i32,
}

/// Per-task outcome inside a terminal job summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub task_id: u32,
    pub err: i32,
}

/// Terminal outcome delivered to the job's callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: i64,
    pub outcome: String,
    pub err: i32,
    pub per_task: Vec<TaskOutcome>,
}
