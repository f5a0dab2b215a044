//! Synthetic responses for environments without a container engine.
//!
//! When the runtime is unreachable, Spawn/Kill/Status/Exec still answer
//! with well-formed, clearly-flagged data so the calling layer can be
//! exercised in demos and CI. Nothing here touches the expiry ledger or
//! any other tracked state; a simulated instance can never collide with
//! a real one later.

use chrono::{Duration, Utc};
use rand::Rng;

use crate::config::OrchestratorConfig;
use crate::instance::{KillReport, SpawnedInstance};
use crate::runtime::ExecOutput;

pub const SIMULATED_HOST: &str = "10.10.10.5";

pub fn spawn(
    owner_id: &str,
    image: &str,
    lab_ref: Option<&str>,
    timeout_minutes: i64,
    config: &OrchestratorConfig,
) -> SpawnedInstance {
    let port = rand::thread_rng().gen_range(config.port_range_start..config.port_range_end);
    let now = Utc::now();

    SpawnedInstance {
        success: true,
        simulated: true,
        instance_id: format!("sim-{}-{}", owner_id, now.timestamp()),
        instance_name: format!("simulated-lab-{owner_id}"),
        owner_id: owner_id.to_string(),
        lab_ref: lab_ref.map(String::from),
        image: image.to_string(),
        host: SIMULATED_HOST.to_string(),
        port,
        container_port: config.container_port,
        connection: format!("{SIMULATED_HOST}:{port}"),
        started_at: now,
        expires_at: now + Duration::minutes(timeout_minutes),
        timeout_minutes,
    }
}

pub fn kill() -> KillReport {
    KillReport::empty()
}

pub fn exec(command: &str) -> ExecOutput {
    ExecOutput {
        stdout: format!("simulated_user@lab:~$ {command}\n[SIMULATION] Command executed.\n"),
        stderr: String::new(),
        exit_code: 0,
    }
}
