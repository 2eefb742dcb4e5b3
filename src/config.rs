use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;
use crate::lang::Lang;

pub const DEFAULT_WORKER_PORT: u16 = 5555;
pub const DEFAULT_MASTER_PORT: u16 = 5557;

const CONFIG_FILE_NAME: &str = "prexd.conf";

/// Master and worker settings, loaded from `<exe_dir>/prexd.conf` (JSON)
/// with defaults for every field.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the master accepts job submissions on.
    pub master_port: u16,
    /// Port workers accept task dispatches on.
    pub worker_port: u16,
    /// Socket buffer size for dispatch connections.
    pub send_buffer_size: usize,
    /// Cap on concurrent task dispatches.
    pub max_simult_sending_jobs: usize,
    /// Number of shared-memory script slots.
    pub shmem_slots: usize,
    /// Host-list file consumed by the worker registry.
    pub hosts_path: Option<PathBuf>,
    /// Liveness probe period.
    pub ping_interval_ms: u64,
    /// Consecutive probe failures before a worker is disabled.
    pub max_ping_failures: u32,
    /// Outstanding tasks a single worker may hold.
    pub worker_capacity: usize,
    pub interpreters: Interpreters,
}

/// Interpreter binary paths, keyed the same way the config file keys them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Interpreters {
    pub python: PathBuf,
    pub java: PathBuf,
    pub javac: PathBuf,
    pub shell: PathBuf,
    pub ruby: PathBuf,
    pub js: PathBuf,
}

impl Default for Interpreters {
    fn default() -> Self {
        Self {
            python: "/usr/bin/python3".into(),
            java: "/usr/bin/java".into(),
            javac: "/usr/bin/javac".into(),
            shell: "/bin/sh".into(),
            ruby: "/usr/bin/ruby".into(),
            js: "/usr/bin/node".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_port: DEFAULT_MASTER_PORT,
            worker_port: DEFAULT_WORKER_PORT,
            send_buffer_size: 4096,
            max_simult_sending_jobs: 32,
            shmem_slots: 256,
            hosts_path: None,
            ping_interval_ms: 5000,
            max_ping_failures: 3,
            worker_capacity: 1,
            interpreters: Interpreters::default(),
        }
    }
}

impl Config {
    /// Load `prexd.conf` from `exe_dir`, falling back to defaults when the
    /// file does not exist. A file that exists but fails to parse is an
    /// init error; starting with silently-wrong settings is worse than not
    /// starting.
    pub fn load(exe_dir: &Path) -> Result<Self> {
        let path = exe_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&raw)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn interpreter_path(&self, lang: Lang) -> &Path {
        match lang {
            Lang::Python => &self.interpreters.python,
            Lang::Java => &self.interpreters.java,
            Lang::Shell => &self.interpreters.shell,
            Lang::Ruby => &self.interpreters.ruby,
            Lang::Js => &self.interpreters.js,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker_port, DEFAULT_WORKER_PORT);
        assert!(config.shmem_slots > 0);
        assert!(config.max_simult_sending_jobs > 0);
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let config: Config = serde_json::from_str(r#"{"worker_port": 6000}"#).unwrap();
        assert_eq!(config.worker_port, 6000);
        assert_eq!(config.master_port, DEFAULT_MASTER_PORT);
        assert_eq!(config.interpreters.shell, PathBuf::from("/bin/sh"));
    }
}
