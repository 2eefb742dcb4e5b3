use std::collections::BTreeMap;
use std::io::BufRead;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotAvail,
    Avail,
    Executing,
    Disabled,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::NotAvail => write!(f, "not_avail"),
            WorkerState::Avail => write!(f, "avail"),
            WorkerState::Executing => write!(f, "executing"),
            WorkerState::Disabled => write!(f, "disabled"),
        }
    }
}

/// Per-worker bookkeeping.
#[derive(Debug, Clone)]
pub struct Worker {
    pub host: String,
    pub state: WorkerState,
    pub running_tasks: usize,
    pub last_seen: Instant,
    pub ping_failures: u32,
}

impl Worker {
    fn new(host: String) -> Self {
        Self {
            host,
            state: WorkerState::NotAvail,
            running_tasks: 0,
            last_seen: Instant::now(),
            ping_failures: 0,
        }
    }
}

/// Read the host list: blank lines skipped; lines starting with a digit
/// must be IPv4 literals; anything else is kept verbatim as a host name.
pub fn read_hosts(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let mut hosts = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let host = line.trim();
        if host.is_empty() {
            continue;
        }
        if host.as_bytes()[0].is_ascii_digit() && host.parse::<Ipv4Addr>().is_err() {
            tracing::warn!(host, "invalid host ip, skipping");
            continue;
        }
        hosts.push(host.to_string());
    }
    tracing::info!(count = hosts.len(), "hosts loaded");
    Ok(hosts)
}

/// Fleet membership and selection.
///
/// Workers move NotAvail -> Avail on a successful ping, Avail -> Executing
/// on dispatch, back to Avail on completion, NotAvail on a ping failure and
/// Disabled after too many consecutive failures or an operator command.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: Mutex<BTreeMap<String, Worker>>,
    capacity: usize,
    max_ping_failures: u32,
}

impl WorkerRegistry {
    pub fn new(capacity: usize, max_ping_failures: u32) -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
            max_ping_failures,
        }
    }

    pub fn from_hosts(hosts: Vec<String>, capacity: usize, max_ping_failures: u32) -> Self {
        let registry = Self::new(capacity, max_ping_failures);
        {
            let mut workers = registry.lock();
            for host in hosts {
                workers.insert(host.clone(), Worker::new(host));
            }
        }
        registry
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Worker>> {
        self.workers.lock().expect("registry lock poisoned")
    }

    pub fn add_host(&self, host: &str) {
        self.lock()
            .entry(host.to_string())
            .or_insert_with(|| Worker::new(host.to_string()));
    }

    pub fn hosts(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn worker(&self, host: &str) -> Option<Worker> {
        self.lock().get(host).cloned()
    }

    /// Pick the best worker for the next task: alive, below capacity,
    /// fewest outstanding tasks, lexicographic host id as the tie-break
    /// (BTreeMap iteration order supplies the latter).
    pub fn select(&self) -> Option<String> {
        let workers = self.lock();
        workers
            .values()
            .filter(|w| {
                matches!(w.state, WorkerState::Avail | WorkerState::Executing)
                    && w.running_tasks < self.capacity
            })
            .min_by_key(|w| w.running_tasks)
            .map(|w| w.host.clone())
    }

    pub fn on_assign(&self, host: &str) {
        if let Some(worker) = self.lock().get_mut(host) {
            worker.running_tasks += 1;
            worker.state = WorkerState::Executing;
        }
    }

    pub fn on_complete(&self, host: &str) {
        if let Some(worker) = self.lock().get_mut(host) {
            worker.running_tasks = worker.running_tasks.saturating_sub(1);
            worker.last_seen = Instant::now();
            if worker.running_tasks == 0 && worker.state == WorkerState::Executing {
                worker.state = WorkerState::Avail;
            }
        }
    }

    pub fn on_ping_ok(&self, host: &str) {
        if let Some(worker) = self.lock().get_mut(host) {
            worker.last_seen = Instant::now();
            worker.ping_failures = 0;
            if worker.state == WorkerState::NotAvail {
                worker.state = WorkerState::Avail;
            }
        }
    }

    pub fn on_ping_failure(&self, host: &str) {
        let mut workers = self.lock();
        if let Some(worker) = workers.get_mut(host) {
            if worker.state == WorkerState::Disabled {
                return;
            }
            worker.ping_failures += 1;
            worker.state = if worker.ping_failures >= self.max_ping_failures {
                tracing::warn!(host, failures = worker.ping_failures, "worker disabled");
                WorkerState::Disabled
            } else {
                WorkerState::NotAvail
            };
        }
    }

    /// Operator command: take a worker out of rotation.
    pub fn disable(&self, host: &str) {
        if let Some(worker) = self.lock().get_mut(host) {
            worker.state = WorkerState::Disabled;
        }
    }

    pub fn available_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|w| {
                matches!(w.state, WorkerState::Avail | WorkerState::Executing)
                    && w.running_tasks < self.capacity
            })
            .count()
    }
}

/// Probe every worker's task port each interval; registry state transitions
/// follow the probe results. Wakes the sender whenever a probe brings a
/// worker back into rotation.
pub async fn ping_loop(
    registry: Arc<WorkerRegistry>,
    config: Config,
    sender_wake: Arc<Notify>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(config.ping_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        for host in registry.hosts() {
            let addr = format!("{}:{}", host, config.worker_port);
            let probe = tokio::time::timeout(
                Duration::from_millis(config.ping_interval_ms / 2),
                tokio::net::TcpStream::connect(&addr),
            )
            .await;

            match probe {
                Ok(Ok(_)) => {
                    let was_down = registry
                        .worker(&host)
                        .map(|w| w.state == WorkerState::NotAvail)
                        .unwrap_or(false);
                    registry.on_ping_ok(&host);
                    if was_down {
                        tracing::info!(%host, "worker available");
                        sender_wake.notify_one();
                    }
                }
                _ => {
                    registry.on_ping_failure(&host);
                    tracing::debug!(%host, "ping failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn host_file_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker-a").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "10.0.0.1").unwrap();
        writeln!(file, "10.0.0.999").unwrap();
        writeln!(file, "worker-b").unwrap();
        let hosts = read_hosts(file.path()).unwrap();
        assert_eq!(hosts, vec!["worker-a", "10.0.0.1", "worker-b"]);
    }

    #[test]
    fn selection_prefers_least_loaded_then_lexicographic() {
        let registry = WorkerRegistry::from_hosts(
            vec!["b".into(), "a".into(), "c".into()],
            2,
            3,
        );
        for host in ["a", "b", "c"] {
            registry.on_ping_ok(host);
        }
        assert_eq!(registry.select().as_deref(), Some("a"));
        registry.on_assign("a");
        assert_eq!(registry.select().as_deref(), Some("b"));
        registry.on_assign("b");
        registry.on_assign("c");
        // All at one task; "a" wins the tie again under capacity 2.
        assert_eq!(registry.select().as_deref(), Some("a"));
    }

    #[test]
    fn state_machine_transitions() {
        let registry = WorkerRegistry::from_hosts(vec!["w".into()], 1, 2);
        assert_eq!(registry.worker("w").unwrap().state, WorkerState::NotAvail);
        assert!(registry.select().is_none());

        registry.on_ping_ok("w");
        assert_eq!(registry.worker("w").unwrap().state, WorkerState::Avail);

        registry.on_assign("w");
        assert_eq!(registry.worker("w").unwrap().state, WorkerState::Executing);
        // At capacity, not selectable.
        assert!(registry.select().is_none());

        registry.on_complete("w");
        assert_eq!(registry.worker("w").unwrap().state, WorkerState::Avail);

        registry.on_ping_failure("w");
        assert_eq!(registry.worker("w").unwrap().state, WorkerState::NotAvail);
        registry.on_ping_failure("w");
        assert_eq!(registry.worker("w").unwrap().state, WorkerState::Disabled);

        // Disabled workers stay disabled even if pings recover.
        registry.on_ping_failure("w");
        assert_eq!(registry.worker("w").unwrap().state, WorkerState::Disabled);
    }
}
