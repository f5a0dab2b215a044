mod docker;

pub use docker::DockerRuntime;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Everything needed to launch one lab container. Built by the
/// orchestrator, consumed by the runtime implementation verbatim.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub container_port: u16,
    pub host_port: u16,
    pub memory_limit: i64,
    pub cpu_limit: f64,
}

/// Normalized view of a container as reported by the engine.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// List query: label filters (`key` or `key=value`), optionally
/// restricted to running containers.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub labels: Vec<String>,
    pub running_only: bool,
}

impl ListFilter {
    pub fn label(value: impl Into<String>) -> Self {
        Self {
            labels: vec![value.into()],
            running_only: false,
        }
    }

    pub fn and(mut self, value: impl Into<String>) -> Self {
        self.labels.push(value.into());
        self
    }

    pub fn running(mut self) -> Self {
        self.running_only = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Capability boundary over the container engine. Carries no policy:
/// the orchestrator and reaper decide what to run and what to reclaim,
/// this trait only does it.
#[async_trait]
pub trait LabRuntime: Send + Sync {
    /// Cheap liveness check; failure is the sole trigger for
    /// simulation mode.
    async fn ping(&self) -> Result<()>;

    /// Create and start a container. Implementations must clean up the
    /// created container if the start step fails.
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;

    /// Graceful stop with a timeout; a timeout of zero kills outright.
    /// Stopping an already-stopped or missing container is success.
    async fn stop(&self, id: &str, timeout_secs: i64) -> Result<()>;

    /// Remove a container. Removing a missing container is success.
    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerRecord>>;

    async fn inspect(&self, id: &str) -> Result<ContainerRecord>;

    /// Run a shell command inside the container, demuxing stdout and
    /// stderr and reporting the exit code.
    async fn exec(&self, id: &str, command: &str) -> Result<ExecOutput>;

    async fn logs(&self, id: &str, tail: usize) -> Result<String>;
}
