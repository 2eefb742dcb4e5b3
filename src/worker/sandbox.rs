use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{execv, fork, ForkResult, Pid};

use crate::config::Config;
use crate::error::ErrorCode;
use crate::protocol::TaskRequest;
use crate::shmem::ShmemPool;
use crate::worker::fifo::FifoPair;
use crate::worker::lang::LangRuntime;

/// Per-task execution states. Every terminal state carries an error code;
/// there is no in-progress-with-unknown-outcome exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecPhase {
    WritingScript,
    WaitingResult,
    Done,
    Killed,
}

/// Fork-exec sandbox around one interpreter process per task.
///
/// The parent feeds the script from the shared-memory slot through the
/// write FIFO and reads an `i32` result code from the read FIFO, both
/// bounded by the task's wall-clock timeout; on expiry the child gets
/// SIGTERM. The child turns into the interpreter via exec, with its
/// parent-death signal set so orphans die with the worker.
pub struct Sandbox {
    config: Arc<Config>,
    exe_dir: PathBuf,
    shmem: Arc<ShmemPool>,
}

impl Sandbox {
    pub fn new(config: Arc<Config>, exe_dir: PathBuf, shmem: Arc<ShmemPool>) -> Self {
        Self {
            config,
            exe_dir,
            shmem,
        }
    }

    /// Run one task to a terminal state. Blocking; callers drive it from a
    /// blocking-friendly thread.
    pub fn execute(&self, task: &TaskRequest, fifo: &FifoPair) -> i32 {
        let runtime = match LangRuntime::resolve(task.lang, &self.config, &self.exe_dir) {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::warn!(job_id = task.id, %error, "interpreter resolution failed");
                return ErrorCode::LanguageNotSupported.as_i32();
            }
        };

        let script = match self.shmem.read_slot(task.id, task.len as usize) {
            Ok(script) => script,
            Err(error) => {
                tracing::error!(job_id = task.id, %error, "script slot read failed");
                return ErrorCode::FatalNode.as_i32();
            }
        };

        // Exec arguments must exist before the fork; allocation in the
        // child is off the table.
        let exe = match runtime.exe_cstring() {
            Ok(exe) => exe,
            Err(_) => return ErrorCode::FatalNode.as_i32(),
        };
        let argv = match runtime.argv(
            &fifo.read_path,
            &fifo.write_path,
            task.len,
            task.task_id,
            task.num_tasks,
        ) {
            Ok(argv) => argv,
            Err(_) => return ErrorCode::FatalNode.as_i32(),
        };

        let child = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => {
                // Orphaned interpreters must exit when the worker dies.
                #[cfg(target_os = "linux")]
                let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGHUP);
                let _ = execv(&exe, &argv);
                unsafe { nix::libc::_exit(1) }
            }
            Err(error) => {
                tracing::error!(job_id = task.id, %error, "fork failed");
                return ErrorCode::FatalNode.as_i32();
            }
        };

        self.supervise(task, fifo, child, &script)
    }

    /// Parent side of a forked task: script out, result code in, SIGTERM
    /// on either deadline.
    fn supervise(&self, task: &TaskRequest, fifo: &FifoPair, child: Pid, script: &[u8]) -> i32 {
        // Child exits must not interrupt the FIFO exchange; the reaper
        // collects them once the mask is restored.
        let mut sigchld = SigSet::empty();
        sigchld.add(Signal::SIGCHLD);
        let mut old_mask = SigSet::empty();
        if let Err(error) = sigprocmask(
            SigmaskHow::SIG_BLOCK,
            Some(&sigchld),
            Some(&mut old_mask),
        ) {
            tracing::error!(%error, "sigprocmask failed");
            return ErrorCode::FatalNode.as_i32();
        }

        let deadline = Instant::now() + Duration::from_secs(task.timeout);
        let mut phase = ExecPhase::WritingScript;
        let mut code = ErrorCode::Ok.as_i32();

        if let Err(err) = self.write_script(fifo, script, deadline) {
            code = err.as_i32();
            phase = self.fail(fifo, child, err);
        }

        if phase == ExecPhase::WritingScript {
            phase = ExecPhase::WaitingResult;
            match self.read_result(fifo, deadline) {
                Ok(result) => {
                    code = result;
                    phase = ExecPhase::Done;
                }
                Err(err) => {
                    code = err.as_i32();
                    phase = self.fail(fifo, child, err);
                }
            }
        }

        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);
        tracing::debug!(
            job_id = task.id,
            task_id = task.task_id,
            ?phase,
            code,
            "task finished"
        );
        code
    }

    /// Timeout failures kill the child; every failure drains the pipes so
    /// the pair comes back clean for the next task.
    fn fail(&self, fifo: &FifoPair, child: Pid, err: ErrorCode) -> ExecPhase {
        if err == ErrorCode::TaskTimeout {
            tracing::warn!(pid = child.as_raw(), "poll timed out, killing interpreter");
            if let Err(error) = kill(child, Signal::SIGTERM) {
                tracing::warn!(pid = child.as_raw(), %error, "kill failed");
            }
        }
        drain(&fifo.read_file);
        drain(&fifo.write_file);
        ExecPhase::Killed
    }

    fn write_script(
        &self,
        fifo: &FifoPair,
        script: &[u8],
        deadline: Instant,
    ) -> Result<(), ErrorCode> {
        let mut written = 0;
        while written < script.len() {
            wait_ready(&fifo.write_file, PollFlags::POLLOUT, deadline)?;
            match (&fifo.write_file).write(&script[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(error) => {
                    tracing::warn!(%error, "write fifo failed");
                    return Err(ErrorCode::FatalNode);
                }
            }
        }
        Ok(())
    }

    fn read_result(&self, fifo: &FifoPair, deadline: Instant) -> Result<i32, ErrorCode> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            wait_ready(&fifo.read_file, PollFlags::POLLIN, deadline)?;
            match (&fifo.read_file).read(&mut buf[filled..]) {
                Ok(0) => return Err(ErrorCode::FatalNode),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(error) => {
                    tracing::warn!(%error, "read fifo failed");
                    return Err(ErrorCode::FatalNode);
                }
            }
        }
        Ok(i32::from_ne_bytes(buf))
    }
}

/// Poll one FIFO end until it is ready or the task deadline passes.
fn wait_ready(file: &std::fs::File, flags: PollFlags, deadline: Instant) -> Result<(), ErrorCode> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(ErrorCode::TaskTimeout);
    }
    let timeout = poll_timeout(remaining.as_millis());
    let mut fds = [PollFd::new(file.as_fd(), flags)];
    match poll(&mut fds, timeout) {
        Ok(0) => Err(ErrorCode::TaskTimeout),
        Ok(_) => Ok(()),
        Err(error) => {
            tracing::warn!(%error, "poll failed");
            Err(ErrorCode::FatalNode)
        }
    }
}

fn poll_timeout(ms: u128) -> PollTimeout {
    i32::try_from(ms)
        .ok()
        .and_then(|ms| PollTimeout::try_from(ms).ok())
        .unwrap_or(PollTimeout::MAX)
}

/// Discard whatever is buffered in a FIFO end.
fn drain(file: &std::fs::File) {
    let mut reader = file;
    let mut sink = [0u8; 4096];
    loop {
        match reader.read(&mut sink) {
            Ok(n) if n > 0 => continue,
            _ => break,
        }
    }
}
