use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::{chown, mkfifo, Uid};
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;

/// Path template for the named pipes: `/tmp/.prexec{r|w}{index}`.
pub const FIFO_NAME: &str = "/tmp/.prexec";

/// One pre-created pair of named pipes, owned by a single execution at a
/// time. `write` carries the script to the interpreter; `read` carries the
/// result code back. Both ends are held open O_RDWR | O_NONBLOCK so the
/// owner can poll them.
#[derive(Debug)]
pub struct FifoPair {
    pub index: usize,
    pub read_path: PathBuf,
    pub write_path: PathBuf,
    pub read_file: File,
    pub write_file: File,
}

impl FifoPair {
    pub fn create(index: usize, uid: Option<u32>) -> Result<Self> {
        let read_path = PathBuf::from(format!("{}r{}", FIFO_NAME, index));
        let write_path = PathBuf::from(format!("{}w{}", FIFO_NAME, index));
        let read_file = create_fifo(&read_path, uid)?;
        let write_file = create_fifo(&write_path, uid)?;
        Ok(Self {
            index,
            read_path,
            write_path,
            read_file,
            write_file,
        })
    }
}

impl Drop for FifoPair {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.read_path);
        let _ = std::fs::remove_file(&self.write_path);
    }
}

fn create_fifo(path: &PathBuf, uid: Option<u32>) -> Result<File> {
    // A leftover pipe from a previous run would carry stale permissions.
    let _ = std::fs::remove_file(path);
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)?;
    if let Some(uid) = uid {
        if let Err(error) = chown(path, Some(Uid::from_raw(uid)), None) {
            tracing::warn!(path = %path.display(), %error, "fifo chown failed");
        }
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    Ok(file)
}

/// Fixed set of FIFO pairs created at startup, one per executor slot,
/// handed out to executions and returned afterwards.
#[derive(Debug)]
pub struct FifoPool {
    tx: mpsc::Sender<FifoPair>,
    rx: Mutex<mpsc::Receiver<FifoPair>>,
}

impl FifoPool {
    /// Create `count` pairs starting at `first_index`.
    pub fn new(count: usize, first_index: usize, uid: Option<u32>) -> Result<Self> {
        let count = count.max(1);
        let (tx, rx) = mpsc::channel(count);
        for index in first_index..first_index + count {
            let pair = FifoPair::create(index, uid)?;
            tx.try_send(pair).expect("pool channel sized to count");
        }
        Ok(Self {
            tx,
            rx: Mutex::new(rx),
        })
    }

    /// Wait for a free pair. Returns None only when the pool is shutting
    /// down.
    pub async fn acquire(&self) -> Option<FifoPair> {
        self.rx.lock().await.recv().await
    }

    pub fn release(&self, pair: FifoPair) {
        let _ = self.tx.try_send(pair);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_cleanup() {
        let index = 9000 + std::process::id() as usize % 1000;
        let pair = FifoPair::create(index, None).unwrap();
        assert!(pair.read_path.exists());
        assert!(pair.write_path.exists());
        let read_path = pair.read_path.clone();
        let write_path = pair.write_path.clone();
        drop(pair);
        assert!(!read_path.exists());
        assert!(!write_path.exists());
    }

    #[tokio::test]
    async fn pool_hands_out_and_takes_back() {
        let base = 10_000 + (std::process::id() as usize % 1000) * 10;
        let pool = FifoPool::new(2, base, None).unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.index, b.index);
        let first = a.index;
        pool.release(a);
        let c = pool.acquire().await.unwrap();
        assert_eq!(c.index, first);
        pool.release(b);
        pool.release(c);
    }
}
