//! Master-side job lifecycle engine.
//!
//! Components, wired by [`Master`]: the job queue and manager, the cron
//! manager for recurring work, the dispatch sender, the completion
//! reconciler, the timeout watchdog and the worker registry. Job
//! descriptions arrive over the admission socket as length-prefixed JSON
//! frames and are answered with `{err}` frames.

pub mod cron;
pub mod history;
pub mod job;
pub mod manager;
pub mod reconciler;
pub mod registry;
pub mod sender;
pub mod timeout;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ErrorCode, PrexdError, Result};
use crate::master::cron::CronManager;
use crate::master::history::{JobHistory, MemHistory};
use crate::master::job::JobQueue;
use crate::master::manager::{JobManager, NameRegistry};
use crate::master::reconciler::{Reconciler, RunTable};
use crate::master::registry::{ping_loop, read_hosts, WorkerRegistry};
use crate::master::sender::JobSender;
use crate::master::timeout::TimeoutManager;
use crate::protocol::{frame, ErrResponse, Submission};
use crate::shmem::{ShmemPool, SHMEM_NAME};

/// The fully wired master node. Construction builds every component with
/// explicit context; `run` spawns the long-lived loops and serves the
/// admission socket until shutdown.
pub struct Master {
    config: Config,
    manager: Arc<JobManager>,
    queue: Arc<Mutex<JobQueue>>,
    table: Arc<Mutex<RunTable>>,
    registry: Arc<WorkerRegistry>,
    cron: Arc<CronManager>,
    timeouts: Arc<TimeoutManager>,
    sender: Arc<JobSender>,
    sender_wake: Arc<Notify>,
    reconciler: Option<Reconciler>,
    events_rx: Option<mpsc::UnboundedReceiver<reconciler::JobEvent>>,
    resubmit_rx: Option<mpsc::UnboundedReceiver<Submission>>,
}

impl Master {
    pub fn new(config: Config, exe_dir: PathBuf) -> Result<Self> {
        let shmem = ShmemPool::create(SHMEM_NAME, config.shmem_slots)?;

        let hosts = match &config.hosts_path {
            Some(path) => read_hosts(path)?,
            None => {
                tracing::warn!("no host list configured, fleet starts empty");
                Vec::new()
            }
        };
        let registry = Arc::new(WorkerRegistry::from_hosts(
            hosts,
            config.worker_capacity,
            config.max_ping_failures,
        ));

        let queue = Arc::new(Mutex::new(JobQueue::new()));
        let table = Arc::new(Mutex::new(RunTable::new()));
        let history: Arc<dyn JobHistory> = Arc::new(MemHistory::new());
        let names = Arc::new(NameRegistry::new());
        let sender_wake = Arc::new(Notify::new());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (resubmit_tx, resubmit_rx) = mpsc::unbounded_channel();

        let timeouts = Arc::new(TimeoutManager::new(events_tx.clone()));
        let cron = Arc::new(CronManager::new(Arc::clone(&names), resubmit_tx));

        let manager = Arc::new(JobManager::new(
            exe_dir,
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
            history,
            Arc::clone(&sender_wake),
        );

        Ok(Self {
            config,
            manager,
            queue,
            table,
            registry,
            cron,
            timeouts,
            sender,
            sender_wake,
            reconciler: Some(reconciler),
            events_rx: Some(events_rx),
            resubmit_rx: Some(resubmit_rx),
        })
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn queue(&self) -> &Arc<Mutex<JobQueue>> {
        &self.queue
    }

    pub fn run_table(&self) -> &Arc<Mutex<RunTable>> {
        &self.table
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn cron(&self) -> &Arc<CronManager> {
        &self.cron
    }

    /// Serve until the shutdown token fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let reconciler = self.reconciler.take().expect("run called once");
        let events_rx = self.events_rx.take().expect("run called once");
        let mut resubmit_rx = self.resubmit_rx.take().expect("run called once");

        tokio::spawn(Arc::clone(&self.cron).run(shutdown.clone()));
        tokio::spawn(Arc::clone(&self.timeouts).run(shutdown.clone()));
        tokio::spawn(Arc::clone(&self.sender).run(shutdown.clone()));
        tokio::spawn(reconciler.run(events_rx, shutdown.clone()));
        tokio::spawn(ping_loop(
            Arc::clone(&self.registry),
            self.config.clone(),
            Arc::clone(&self.sender_wake),
            shutdown.clone(),
        ));

        // Cron firings come back as fresh submissions.
        let resubmit_manager = Arc::clone(&self.manager);
        let resubmit_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    submission = resubmit_rx.recv() => {
                        let Some(submission) = submission else { break };
                        if let Err(error) =
                            resubmit_manager.build_and_push(submission, true, None)
                        {
                            tracing::warn!(%error, "cron resubmission failed");
                        }
                    }
                    _ = resubmit_shutdown.cancelled() => break,
                }
            }
        });

        let addr = format!("0.0.0.0:{}", self.config.master_port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "master accepting submissions");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!(%peer, "submission connection accepted");
                    let manager = Arc::clone(&self.manager);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(error) = serve_submissions(stream, manager, shutdown).await {
                            tracing::debug!(%peer, %error, "submission connection closed");
                        }
                    });
                }
                _ = shutdown.cancelled() => break,
            }
        }

        self.manager.stop_all_jobs();
        tracing::info!("master stopped");
        Ok(())
    }
}

/// One admission connection: framed JSON submissions in, framed `{err}`
/// acks out, reused until the client hangs up.
async fn serve_submissions(
    mut stream: TcpStream,
    manager: Arc<JobManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let payload = tokio::select! {
            payload = frame::read_frame(&mut stream) => payload,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let err = match payload {
            Ok(payload) => match manager.submit(&payload) {
                Ok(_) => ErrorCode::Ok,
                Err(error) => {
                    tracing::warn!(%error, "submission rejected");
                    admission_code(&error)
                }
            },
            Err(PrexdError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(PrexdError::MalformedHeader) => {
                // Framing is broken; answer once and drop the connection.
                respond(&mut stream, ErrorCode::MalformedHeader).await?;
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        respond(&mut stream, err).await?;
    }
}

async fn respond(stream: &mut TcpStream, err: ErrorCode) -> Result<()> {
    let payload = serde_json::to_vec(&ErrResponse { err: err.as_i32() })?;
    frame::write_frame(stream, &payload).await
}

/// Map an admission failure onto its wire code.
fn admission_code(error: &PrexdError) -> ErrorCode {
    match error {
        PrexdError::MalformedHeader => ErrorCode::MalformedHeader,
        PrexdError::LanguageNotSupported(_) => ErrorCode::LanguageNotSupported,
        PrexdError::MalformedPayload(_)
        | PrexdError::ScriptTooLarge(_)
        | PrexdError::InvalidCron(_)
        | PrexdError::NameTaken(_)
        | PrexdError::Json(_) => ErrorCode::MalformedPayload,
        _ => ErrorCode::FatalNode,
    }
}
