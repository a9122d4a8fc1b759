//! The seam between the orchestrator and the container runtime.
//!
//! Everything above this trait speaks in container names; the naming convention
//! (`<prefix>_<instance id>`) is what lets a restarted agent find its containers
//! again without any in-memory handle.

use std::collections::BTreeMap;
use std::time::Duration;

use hatchery_instance::PortMapping;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),
    /// The container was already in the requested state.
    #[error("not modified: {0}")]
    NotModified(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// `host_path:container_path[:mode]`
    pub binds: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub memory_mb: u64,
    pub cpu_percent: u64,
    pub disk_mb: Option<u64>,
    pub stop_signal: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Let the runtime bring the container back after a daemon restart.
    pub restart_unless_stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub output: String,
}

/// One line of container output as recorded by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// RFC 3339 timestamp assigned by the runtime's log driver.
    pub timestamp: Option<String>,
    pub text: String,
}

impl LogRecord {
    /// Splits a `timestamps=true` line (`<rfc3339> <text>`) into its parts.
    pub fn parse_timestamped(line: &str) -> Self {
        if let Some((ts, rest)) = line.split_once(' ')
            && chrono::DateTime::parse_from_rfc3339(ts).is_ok()
        {
            return Self {
                timestamp: Some(ts.to_string()),
                text: rest.to_string(),
            };
        }
        Self {
            timestamp: None,
            text: line.to_string(),
        }
    }
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_present(&self, image: &str) -> RuntimeResult<bool>;

    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;

    /// Creates a container without starting it; returns the runtime's id.
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start_container(&self, name: &str) -> RuntimeResult<()>;

    async fn stop_container(&self, name: &str, grace: Duration) -> RuntimeResult<()>;

    async fn restart_container(&self, name: &str, grace: Duration) -> RuntimeResult<()>;

    async fn remove_container(&self, name: &str, force: bool) -> RuntimeResult<()>;

    /// `Ok(None)` when no container carries this name.
    async fn inspect_container(&self, name: &str) -> RuntimeResult<Option<ContainerStatus>>;

    /// Blocks until the container exits; returns its exit code.
    async fn wait_container(&self, name: &str) -> RuntimeResult<i64>;

    async fn exec(&self, name: &str, cmd: Vec<String>) -> RuntimeResult<ExecOutput>;

    /// Returns the last `tail` lines (all when `None`), oldest first.
    async fn tail_logs(&self, name: &str, tail: Option<usize>) -> RuntimeResult<Vec<LogRecord>>;
}
