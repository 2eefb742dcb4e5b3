use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getppid, setuid, Pid, Uid};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. All long-lived loops monitor this token and drain gracefully.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                    break;
                }
                _ = sighup.recv() => {
                    tracing::info!("ignoring SIGHUP");
                }
            }
        }

        token_clone.cancel();
    });

    token
}

/// Reap interpreter children as they exit. Multiple exits may be
/// compressed into a single SIGCHLD, so every delivery drains the zombie
/// list non-blocking.
pub fn spawn_sigchld_reaper(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigchld = signal(SignalKind::child()).expect("failed to install SIGCHLD handler");
        loop {
            tokio::select! {
                _ = sigchld.recv() => {
                    loop {
                        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                            Ok(WaitStatus::StillAlive) | Err(_) => break,
                            Ok(status) => {
                                tracing::trace!(?status, "child reaped");
                            }
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

/// Announce readiness to the supervising process.
pub fn notify_parent_ready() {
    let parent = getppid();
    if let Err(error) = kill(parent, Signal::SIGUSR1) {
        tracing::debug!(%parent, %error, "readiness signal not delivered");
    }
}

/// Drop privileges to the configured uid.
pub fn impersonate(uid: u32) -> Result<()> {
    setuid(Uid::from_raw(uid))?;
    tracing::info!(uid, "impersonated");
    Ok(())
}
