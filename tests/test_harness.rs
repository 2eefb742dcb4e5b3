//! Shared fixtures for master-side integration tests.
//!
//! Wires a full master pipeline (queue, run table, registry, cron,
//! timeouts, sender, reconciler) against stub workers speaking the framed
//! wire protocol on localhost.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use prexd::config::Config;
use prexd::master::cron::CronManager;
use prexd::master::history::{JobHistory, MemHistory};
use prexd::master::job::JobQueue;
use prexd::master::manager::{JobManager, NameRegistry};
use prexd::master::reconciler::{Reconciler, RunTable};
use prexd::master::registry::WorkerRegistry;
use prexd::master::sender::JobSender;
use prexd::master::timeout::TimeoutManager;
use prexd::protocol::{frame, ErrResponse, JobSubmission, JobSummary, Submission, TaskRequest};
use prexd::shmem::ShmemPool;

static NEXT_SHMEM_ID: AtomicI64 = AtomicI64::new(0);

/// A fully wired master pipeline bound to stub workers.
pub struct TestMaster {
    pub config: Config,
    pub queue: Arc<Mutex<JobQueue>>,
    pub table: Arc<Mutex<RunTable>>,
    pub registry: Arc<WorkerRegistry>,
    pub cron: Arc<CronManager>,
    pub history: Arc<dyn JobHistory>,
    pub manager: Arc<JobManager>,
    pub token: CancellationToken,
}

impl TestMaster {
    /// Spin up the pipeline. `hosts` are marked available immediately; the
    /// ping loop is not started, tests control liveness by hand.
    pub async fn start(worker_port: u16, hosts: Vec<String>, worker_capacity: usize) -> Self {
        let shmem_name = format!(
            "prexd_it_{}_{}",
            std::process::id(),
            NEXT_SHMEM_ID.fetch_add(1, Ordering::SeqCst)
        );
        let shmem = ShmemPool::create(&shmem_name, 16).unwrap();

        let config = Config {
            worker_port,
            worker_capacity,
            ..Config::default()
        };

        let registry = Arc::new(WorkerRegistry::from_hosts(hosts.clone(), worker_capacity, 3));
        for host in &hosts {
            registry.on_ping_ok(host);
        }

        let queue = Arc::new(Mutex::new(JobQueue::new()));
        let table = Arc::new(Mutex::new(RunTable::new()));
        let history: Arc<dyn JobHistory> = Arc::new(MemHistory::new());
        let names = Arc::new(NameRegistry::new());
        let sender_wake = Arc::new(Notify::new());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (resubmit_tx, mut resubmit_rx) = mpsc::unbounded_channel::<Submission>();

        let timeouts = Arc::new(TimeoutManager::new(events_tx.clone()));
        let cron = Arc::new(CronManager::new(Arc::clone(&names), resubmit_tx));

        let manager = Arc::new(JobManager::new(
            std::env::temp_dir(),
            names,
            Arc::clone(&queue),
            Arc::clone(&table),
            Arc::clone(&timeouts),
            Arc::clone(&history),
            shmem,
            Arc::clone(&cron),
            Arc::clone(&sender_wake),
        ));

        let sender = Arc::new(JobSender::new(
            config.clone(),
            Arc::clone(&queue),
            Arc::clone(&table),
            Arc::clone(&registry),
            Arc::clone(&timeouts),
            events_tx,
            Arc::clone(&sender_wake),
        ));

        let reconciler = Reconciler::new(
            Arc::clone(&queue),
            Arc::clone(&table),
            Arc::clone(&registry),
            Arc::clone(&timeouts),
            Arc::clone(&cron),
            Arc::clone(&history),
            Arc::clone(&sender_wake),
        );

        let token = CancellationToken::new();
        tokio::spawn(sender.run(token.clone()));
        tokio::spawn(reconciler.run(events_rx, token.clone()));
        tokio::spawn(Arc::clone(&timeouts).run(token.clone()));
        tokio::spawn(Arc::clone(&cron).run(token.clone()));

        let resubmit_manager = Arc::clone(&manager);
        let resubmit_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    submission = resubmit_rx.recv() => {
                        let Some(submission) = submission else { break };
                        let _ = resubmit_manager.build_and_push(submission, true, None);
                    }
                    _ = resubmit_token.cancelled() => break,
                }
            }
        });

        Self {
            config,
            queue,
            table,
            registry,
            cron,
            history,
            manager,
            token,
        }
    }

    /// Submit one job with a terminal-outcome callback.
    pub fn submit(&self, submission: JobSubmission) -> (Vec<i64>, oneshot::Receiver<JobSummary>) {
        let (tx, rx) = oneshot::channel();
        let ids = self
            .manager
            .build_and_push(Submission::Single(submission), false, Some(tx))
            .unwrap();
        (ids, rx)
    }
}

impl Drop for TestMaster {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// A minimal job description for tests.
pub fn shell_job(script: &str, num_nodes: u32, max_failed_nodes: u32) -> JobSubmission {
    JobSubmission {
        script: Some(script.to_string()),
        script_ref: None,
        lang: prexd::lang::Lang::Shell,
        num_nodes,
        max_failed_nodes,
        timeout: 60,
        queue_timeout: 60,
        task_timeout: 60,
        no_reschedule: false,
        name: None,
        cron: None,
    }
}

/// Start a stub worker: accepts framed task requests and answers each with
/// the code produced by `respond_with`. Returns the bound port.
pub async fn spawn_stub_worker<F>(respond_with: F) -> u16
where
    F: Fn(&TaskRequest) -> i32 + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let respond_with = Arc::new(respond_with);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let respond_with = Arc::clone(&respond_with);
            tokio::spawn(async move {
                while let Ok(payload) = frame::read_frame(&mut stream).await {
                    let task: TaskRequest = match serde_json::from_slice(&payload) {
                        Ok(task) => task,
                        Err(_) => break,
                    };
                    let err = respond_with(&task);
                    let response = serde_json::to_vec(&ErrResponse { err }).unwrap();
                    if frame::write_frame(&mut stream, &response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    port
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
