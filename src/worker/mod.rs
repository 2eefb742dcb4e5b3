//! Worker-side execution server.
//!
//! Accepts task dispatches over TCP, runs each script under the fork-exec
//! sandbox and answers with a framed `{err}` response. Script bodies come
//! out of the shared-memory pool; per-execution I/O goes through a
//! pre-created FIFO pair.

pub mod fifo;
pub mod lang;
pub mod sandbox;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ErrorCode, PrexdError, Result};
use crate::protocol::{frame, ErrResponse, TaskRequest};
use crate::shmem::{ShmemPool, SHMEM_NAME};
use crate::shutdown;
use crate::worker::fifo::{FifoPair, FifoPool};
use crate::worker::sandbox::Sandbox;

/// Where each execution gets its FIFO pair from: the fixed startup pool,
/// or a fresh pair per request (`-f`).
enum Fifos {
    Pool(FifoPool),
    PerRequest { next: AtomicUsize, uid: Option<u32> },
}

impl Fifos {
    async fn acquire(&self) -> Result<FifoPair> {
        match self {
            Fifos::Pool(pool) => pool
                .acquire()
                .await
                .ok_or_else(|| PrexdError::Config("fifo pool closed".into())),
            Fifos::PerRequest { next, uid } => {
                // High indices keep ephemeral pairs clear of the pool's.
                let index = 100_000 + next.fetch_add(1, Ordering::Relaxed);
                FifoPair::create(index, *uid)
            }
        }
    }

    fn release(&self, pair: FifoPair) {
        match self {
            Fifos::Pool(pool) => pool.release(pair),
            Fifos::PerRequest { .. } => drop(pair),
        }
    }
}

pub struct Worker {
    config: Arc<Config>,
    exe_dir: PathBuf,
    num_threads: usize,
    uid: Option<u32>,
    fork_per_request: bool,
}

impl Worker {
    pub fn new(
        config: Config,
        exe_dir: PathBuf,
        num_threads: usize,
        uid: Option<u32>,
        fork_per_request: bool,
    ) -> Self {
        Self {
            config: Arc::new(config),
            exe_dir,
            num_threads: num_threads.max(1),
            uid,
            fork_per_request,
        }
    }

    /// Serve task dispatches until shutdown. Fails fast when the shared
    /// memory pool is absent; a worker without scripts to read is useless.
    pub async fn run(self, shutdown_token: CancellationToken) -> Result<()> {
        let shmem = ShmemPool::open(SHMEM_NAME, self.config.shmem_slots)?;

        let fifos = Arc::new(if self.fork_per_request {
            Fifos::PerRequest {
                next: AtomicUsize::new(0),
                uid: self.uid,
            }
        } else {
            Fifos::Pool(FifoPool::new(self.num_threads, 0, self.uid)?)
        });

        compile_java_node(&self.config, &self.exe_dir).await;

        let addr = format!("0.0.0.0:{}", self.config.worker_port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "worker accepting tasks");

        shutdown::spawn_sigchld_reaper(shutdown_token.clone());
        shutdown::notify_parent_ready();

        if let Some(uid) = self.uid {
            shutdown::impersonate(uid)?;
        }

        let sandbox = Arc::new(Sandbox::new(
            Arc::clone(&self.config),
            self.exe_dir.clone(),
            shmem,
        ));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!(%peer, "task connection accepted");
                    let sandbox = Arc::clone(&sandbox);
                    let fifos = Arc::clone(&fifos);
                    let shutdown_token = shutdown_token.clone();
                    tokio::spawn(async move {
                        if let Err(error) =
                            serve_tasks(stream, sandbox, fifos, shutdown_token).await
                        {
                            tracing::debug!(%peer, %error, "task connection closed");
                        }
                    });
                }
                _ = shutdown_token.cancelled() => break,
            }
        }

        tracing::info!("worker stopped");
        Ok(())
    }
}

/// One dispatch connection: framed task requests in, framed `{err}`
/// responses out, reused until the master hangs up.
async fn serve_tasks(
    mut stream: TcpStream,
    sandbox: Arc<Sandbox>,
    fifos: Arc<Fifos>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let payload = tokio::select! {
            payload = frame::read_frame(&mut stream) => payload,
            _ = shutdown.cancelled() => return Ok(()),
        };

        let err = match payload {
            Ok(payload) => match serde_json::from_slice::<TaskRequest>(&payload) {
                Ok(task) => execute_task(&sandbox, &fifos, task).await?,
                Err(error) => {
                    tracing::warn!(%error, "task payload rejected");
                    ErrorCode::MalformedPayload.as_i32()
                }
            },
            Err(PrexdError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(PrexdError::MalformedHeader) => {
                respond(&mut stream, ErrorCode::MalformedHeader.as_i32()).await?;
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        respond(&mut stream, err).await?;
    }
}

async fn execute_task(sandbox: &Arc<Sandbox>, fifos: &Arc<Fifos>, task: TaskRequest) -> Result<i32> {
    let fifo = fifos.acquire().await?;
    let sandbox = Arc::clone(sandbox);

    let (code, fifo) = tokio::task::spawn_blocking(move || {
        let code = sandbox.execute(&task, &fifo);
        (code, fifo)
    })
    .await
    .map_err(|e| PrexdError::Config(format!("executor thread panicked: {}", e)))?;

    fifos.release(fifo);
    Ok(code)
}

async fn respond(stream: &mut TcpStream, err: i32) -> Result<()> {
    let payload = serde_json::to_vec(&ErrResponse { err })?;
    frame::write_frame(stream, &payload).await
}

/// Ahead-of-time compile the Java driver so `java -cp` finds its class.
/// Best effort: a fleet without Java jobs does not need javac installed.
async fn compile_java_node(config: &Config, exe_dir: &std::path::Path) {
    let javac = &config.interpreters.javac;
    if !javac.exists() {
        tracing::debug!(javac = %javac.display(), "javac not found, skipping java setup");
        return;
    }
    let source = exe_dir.join("node/node.java");
    match tokio::process::Command::new(javac).arg(&source).status().await {
        Ok(status) if status.success() => {
            tracing::info!("java driver compiled");
        }
        Ok(status) => {
            tracing::warn!(%status, "javac failed");
        }
        Err(error) => {
            tracing::warn!(%error, "javac could not run");
        }
    }
}
