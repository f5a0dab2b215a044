//! laborc - lab container orchestrator.
//!
//! Provisions short-lived, isolated container instances so a learner
//! can attack a vulnerable target over the network, and guarantees the
//! instance is reclaimed within a bounded time. The container runtime
//! itself is the source of truth: every lab carries structured labels
//! (owner, lab, creation and expiry timestamps) and the registry is a
//! read-through query over those labels, not a database.

pub mod config;
pub mod error;
pub mod instance;
pub mod logging;
pub mod orchestrator;
pub mod ports;
pub mod reaper;
pub mod runtime;
pub mod simulate;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use instance::{InstanceInfo, InstanceStatus, KillReport, SpawnedInstance, SweepReport};
pub use orchestrator::{Orchestrator, SpawnRequest};
pub use reaper::{Reaper, ReaperHandle};
pub use runtime::{DockerRuntime, ExecOutput, LabRuntime};
