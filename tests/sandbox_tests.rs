//! Fork-exec sandbox tests against real interpreter processes.
//!
//! `/bin/sh` stands in for the interpreter; a tiny driver script speaks
//! the FIFO protocol: read the script off the write pipe, answer four
//! result bytes on the read pipe.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use prexd::config::Config;
use prexd::error::ErrorCode;
use prexd::lang::Lang;
use prexd::protocol::TaskRequest;
use prexd::shmem::ShmemPool;
use prexd::worker::fifo::FifoPair;
use prexd::worker::sandbox::Sandbox;

static NEXT_FIFO: AtomicUsize = AtomicUsize::new(0);

fn unique_fifo() -> FifoPair {
    let index = 50_000
        + (std::process::id() as usize % 1000) * 16
        + NEXT_FIFO.fetch_add(1, Ordering::SeqCst);
    FifoPair::create(index, None).unwrap()
}

fn write_driver(exe_dir: &Path, body: &str) {
    let node_dir = exe_dir.join("node");
    std::fs::create_dir_all(&node_dir).unwrap();
    std::fs::write(node_dir.join("node.sh"), body).unwrap();
}

/// Driver that consumes the script and reports success.
const ECHO_DRIVER: &str = "#!/bin/sh\n\
    head -c \"$3\" \"$2\" > /dev/null\n\
    printf '\\0\\0\\0\\0' > \"$1\"\n";

/// Driver that hangs without ever answering.
const HANG_DRIVER: &str = "#!/bin/sh\nsleep 30\n";

fn sandbox_with_driver(tag: &str, driver: &str) -> (Sandbox, Arc<ShmemPool>, tempfile::TempDir) {
    let exe_dir = tempfile::tempdir().unwrap();
    write_driver(exe_dir.path(), driver);

    let shmem_name = format!("prexd_sbx_{}_{}", tag, std::process::id());
    let shmem = ShmemPool::create(&shmem_name, 8).unwrap();

    let sandbox = Sandbox::new(
        Arc::new(Config::default()),
        exe_dir.path().to_path_buf(),
        Arc::clone(&shmem),
    );
    (sandbox, shmem, exe_dir)
}

fn task(job_id: i64, script_len: usize, timeout: u64) -> TaskRequest {
    TaskRequest {
        id: job_id,
        len: script_len as u32,
        lang: Lang::Shell,
        task_id: 0,
        num_tasks: 1,
        timeout,
    }
}

#[test]
fn script_executes_and_reports_success() {
    let (sandbox, shmem, _exe_dir) = sandbox_with_driver("ok", ECHO_DRIVER);
    let script = b"echo hello";
    let _lease = shmem.lease(1, script).unwrap();
    let fifo = unique_fifo();

    let code = sandbox.execute(&task(1, script.len(), 10), &fifo);
    assert_eq!(code, 0);
}

#[test]
fn hung_interpreter_is_killed_on_timeout() {
    let (sandbox, shmem, _exe_dir) = sandbox_with_driver("hang", HANG_DRIVER);
    let script = b"never runs";
    let _lease = shmem.lease(2, script).unwrap();
    let fifo = unique_fifo();

    let start = Instant::now();
    let code = sandbox.execute(&task(2, script.len(), 1), &fifo);
    assert_eq!(code, ErrorCode::TaskTimeout.as_i32());
    // The one-second deadline must actually bound the wait.
    assert!(start.elapsed().as_secs() < 10);
}

#[test]
fn missing_interpreter_reports_language_not_supported() {
    let exe_dir = tempfile::tempdir().unwrap();
    write_driver(exe_dir.path(), ECHO_DRIVER);

    let shmem_name = format!("prexd_sbx_lang_{}", std::process::id());
    let shmem = ShmemPool::create(&shmem_name, 8).unwrap();
    let _lease = shmem.lease(3, b"puts 1").unwrap();

    let mut config = Config::default();
    config.interpreters.ruby = "/nonexistent/ruby".into();
    let sandbox = Sandbox::new(
        Arc::new(config),
        exe_dir.path().to_path_buf(),
        Arc::clone(&shmem),
    );

    let request = TaskRequest {
        id: 3,
        len: 6,
        lang: Lang::Ruby,
        task_id: 0,
        num_tasks: 1,
        timeout: 5,
    };
    let fifo = unique_fifo();
    assert_eq!(
        sandbox.execute(&request, &fifo),
        ErrorCode::LanguageNotSupported.as_i32()
    );
}

#[test]
fn fifo_pair_survives_consecutive_tasks() {
    let (sandbox, shmem, _exe_dir) = sandbox_with_driver("reuse", ECHO_DRIVER);
    let fifo = unique_fifo();

    for job_id in 4..7 {
        let script = format!("echo {}", job_id).into_bytes();
        let lease = shmem.lease(job_id, &script).unwrap();
        let code = sandbox.execute(&task(job_id, script.len(), 10), &fifo);
        assert_eq!(code, 0, "task for job {} should succeed", job_id);
        drop(lease);
    }
}
