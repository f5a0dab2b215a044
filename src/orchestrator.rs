use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::instance::{
    label_set, labels, Instance, InstanceInfo, KillReport, SpawnedInstance, SweepReport,
};
use crate::ports::PortAllocator;
use crate::runtime::{ContainerSpec, ExecOutput, LabRuntime, ListFilter};
use crate::simulate;

/// Attempts at container creation before a port-bind conflict is fatal.
/// Port allocation is advisory, so losing the race is expected.
const PORT_BIND_ATTEMPTS: u32 = 3;

/// What a caller asks for when spawning a lab.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub owner_id: String,
    pub image: String,
    pub lab_ref: Option<String>,
    pub container_port: Option<u16>,
    pub timeout_minutes: Option<i64>,
    pub env: Vec<String>,
    pub memory_limit: Option<i64>,
    pub cpu_limit: Option<f64>,
}

impl SpawnRequest {
    pub fn new(owner_id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            image: image.into(),
            lab_ref: None,
            container_port: None,
            timeout_minutes: None,
            env: Vec::new(),
            memory_limit: None,
            cpu_limit: None,
        }
    }
}

/// The lab container orchestrator. Constructed once at startup and
/// shared by handle; owns all spawn/kill policy, the one-instance-per-
/// owner invariant, and the mutable expiry ledger the reaper consults.
pub struct Orchestrator {
    runtime: Arc<dyn LabRuntime>,
    config: OrchestratorConfig,
    ports: PortAllocator,
    /// Effective expiry per instance id. Labels are immutable after
    /// creation, so Extend writes here and sweeps read here first.
    expiries: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Per-owner serialization of spawn/kill/extend/exec. Without it,
    /// two near-simultaneous spawns for one owner both pass the
    /// kill-existing step and both create.
    owner_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn LabRuntime>, config: OrchestratorConfig) -> Self {
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);
        Self {
            runtime,
            config,
            ports,
            expiries: Mutex::new(HashMap::new()),
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn owner_lock(&self, owner_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.owner_locks.lock().unwrap();
        locks
            .entry(owner_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn effective_expiry(&self, instance: &Instance) -> DateTime<Utc> {
        self.expiries
            .lock()
            .unwrap()
            .get(&instance.instance_id)
            .copied()
            .unwrap_or(instance.expires_at)
    }

    fn forget_expiry(&self, instance_id: &str) {
        self.expiries.lock().unwrap().remove(instance_id);
    }

    /// Spawn a lab instance for an owner, replacing any instance the
    /// owner already holds. Falls back to the configured default image
    /// exactly once if the requested image does not exist.
    pub async fn spawn(&self, req: SpawnRequest) -> Result<SpawnedInstance> {
        info!(
            "Spawning lab for owner {} from image {}",
            req.owner_id, req.image
        );

        if self.runtime.ping().await.is_err() {
            warn!("Runtime unreachable, returning simulated spawn");
            let timeout = self.clamp_timeout(req.timeout_minutes);
            return Ok(simulate::spawn(
                &req.owner_id,
                &req.image,
                req.lab_ref.as_deref(),
                timeout,
                &self.config,
            ));
        }

        let lock = self.owner_lock(&req.owner_id);
        let _guard = lock.lock().await;

        // One lab at a time: replacing is a side effect of spawning.
        let killed = self.kill_owner_instances(&req.owner_id, true).await;
        if killed.killed_count > 0 {
            info!(
                "Replaced {} existing instance(s) for owner {}",
                killed.killed_count, req.owner_id
            );
        }

        match self.launch(&req, &req.image).await {
            Err(Error::ImageNotFound(missing)) => {
                let fallback = self.config.fallback_image.clone();
                if req.image == fallback {
                    return Err(Error::DefaultImageMissing(fallback));
                }
                warn!(
                    "Image {} not found, falling back to {}",
                    missing, fallback
                );
                match self.launch(&req, &fallback).await {
                    Err(Error::ImageNotFound(_)) => Err(Error::DefaultImageMissing(fallback)),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// One launch attempt against a specific image, retrying with a
    /// fresh port when the advisory allocation loses the bind race.
    async fn launch(&self, req: &SpawnRequest, image: &str) -> Result<SpawnedInstance> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let host_port = self.ports.allocate()?;

            match self.create_and_verify(req, image, host_port).await {
                Err(Error::Runtime(msg)) if attempt < PORT_BIND_ATTEMPTS && is_bind_conflict(&msg) => {
                    warn!(
                        "Port {} taken between probe and bind, retrying ({}/{})",
                        host_port, attempt, PORT_BIND_ATTEMPTS
                    );
                }
                other => return other,
            }
        }
    }

    async fn create_and_verify(
        &self,
        req: &SpawnRequest,
        image: &str,
        host_port: u16,
    ) -> Result<SpawnedInstance> {
        let timeout_minutes = self.clamp_timeout(req.timeout_minutes);
        let container_port = req.container_port.unwrap_or(self.config.container_port);
        let created_at = Utc::now();
        let expires_at = created_at + Duration::minutes(timeout_minutes);

        // Random suffix keeps names unguessable even though the owner
        // id is embedded for operator readability.
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!(
            "lab-{}-{}-{}",
            req.owner_id,
            req.lab_ref.as_deref().unwrap_or("dev"),
            &suffix[..8]
        );

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.to_string(),
            env: req.env.clone(),
            labels: label_set(
                &req.owner_id,
                req.lab_ref.as_deref(),
                created_at,
                expires_at,
                host_port,
            ),
            container_port,
            host_port,
            memory_limit: req.memory_limit.unwrap_or(self.config.memory_limit),
            cpu_limit: req.cpu_limit.unwrap_or(self.config.cpu_limit),
        };

        let instance_id = self.runtime.run(&spec).await?;

        // Give the container a moment, then confirm it actually runs.
        sleep(self.config.settle_delay).await;
        let verified = match self.runtime.inspect(&instance_id).await {
            Ok(record) if record.running => Ok(()),
            Ok(record) => Err(Error::StartupFailure(format!(
                "container {} reported state running={}",
                record.name, record.running
            ))),
            Err(e) => Err(Error::StartupFailure(e.to_string())),
        };

        if let Err(e) = verified {
            // Never leave a half-started instance behind.
            warn!("Startup verification failed for {}: {}", name, e);
            if let Err(remove_err) = self.remove_instance(&instance_id, true).await {
                warn!(
                    "Cleanup of failed instance {} did not complete, leaving it for the sweeps: {}",
                    instance_id, remove_err
                );
            }
            return Err(e);
        }

        self.expiries
            .lock()
            .unwrap()
            .insert(instance_id.clone(), expires_at);

        let host = self.config.host_address.clone();
        info!(
            "Lab ready for owner {}: {}:{} (expires {})",
            req.owner_id, host, host_port, expires_at
        );

        Ok(SpawnedInstance {
            success: true,
            simulated: false,
            instance_id,
            instance_name: name,
            owner_id: req.owner_id.clone(),
            lab_ref: req.lab_ref.clone(),
            image: image.to_string(),
            connection: format!("{host}:{host_port}"),
            host,
            port: host_port,
            container_port,
            started_at: created_at,
            expires_at,
            timeout_minutes,
        })
    }

    fn clamp_timeout(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.config.default_timeout_minutes)
            .clamp(1, self.config.max_total_minutes)
    }

    /// Stop and remove every instance an owner holds. Partial failures
    /// are collected; `success` is true only if all removals went
    /// through cleanly.
    pub async fn kill(&self, owner_id: &str, force: bool) -> Result<KillReport> {
        if self.runtime.ping().await.is_err() {
            return Ok(simulate::kill());
        }

        let lock = self.owner_lock(owner_id);
        let _guard = lock.lock().await;
        Ok(self.kill_owner_instances(owner_id, force).await)
    }

    async fn kill_owner_instances(&self, owner_id: &str, force: bool) -> KillReport {
        let filter =
            ListFilter::label(format!("{}={}", labels::OWNER, owner_id)).and(managed());
        let records = match self.runtime.list(&filter).await {
            Ok(records) => records,
            Err(e) => {
                error!("Listing instances for owner {} failed: {}", owner_id, e);
                return KillReport {
                    success: false,
                    killed_count: 0,
                    instance_ids: Vec::new(),
                    errors: vec![e.to_string()],
                };
            }
        };

        let mut killed = Vec::new();
        let mut errors = Vec::new();

        for record in records {
            let stop_timeout = if force { 0 } else { self.config.stop_timeout_secs };
            if record.running {
                if let Err(e) = self.runtime.stop(&record.id, stop_timeout).await {
                    errors.push(format!("stop {}: {}", record.id, e));
                }
            }

            match self.runtime.remove(&record.id, true).await {
                Ok(()) => {
                    self.forget_expiry(&record.id);
                    info!("Killed instance {} for owner {}", record.id, owner_id);
                    killed.push(record.id);
                }
                Err(e) => errors.push(format!("remove {}: {}", record.id, e)),
            }
        }

        KillReport {
            success: errors.is_empty(),
            killed_count: killed.len(),
            instance_ids: killed,
            errors,
        }
    }

    /// Running instance for an owner, if any. With the runtime down
    /// this answers "no active instance" rather than failing.
    pub async fn status(&self, owner_id: &str) -> Result<Option<InstanceInfo>> {
        if self.runtime.ping().await.is_err() {
            return Ok(None);
        }

        Ok(self
            .find_active(owner_id)
            .await?
            .map(|instance| self.describe(&instance)))
    }

    async fn find_active(&self, owner_id: &str) -> Result<Option<Instance>> {
        let filter = ListFilter::label(format!("{}={}", labels::OWNER, owner_id))
            .and(managed())
            .running();
        let records = self.runtime.list(&filter).await?;

        let mut instances: Vec<Instance> = records
            .iter()
            .filter_map(Instance::from_record)
            .collect();

        // The invariant says at most one, but a crash between kill and
        // create can leave extras. Prefer the newest; the reaper takes
        // care of the orphans.
        instances.sort_by_key(|i| std::cmp::Reverse(i.created_at));
        if instances.len() > 1 {
            warn!(
                "Owner {} has {} running instances, treating older ones as orphans",
                owner_id,
                instances.len()
            );
        }

        Ok(instances.into_iter().next())
    }

    fn describe(&self, instance: &Instance) -> InstanceInfo {
        let expires_at = self.effective_expiry(instance);
        InstanceInfo {
            instance_id: instance.instance_id.clone(),
            instance_name: instance.instance_name.clone(),
            owner_id: instance.owner_id.clone(),
            lab_ref: instance.lab_ref.clone(),
            image: instance.image.clone(),
            host: self.config.host_address.clone(),
            port: instance.host_port,
            created_at: instance.created_at,
            expires_at,
            status: instance.status(Utc::now(), expires_at),
        }
    }

    /// Push an owner's expiry out by `extra_minutes`, capped at
    /// `created_at + max_total_minutes`. The new expiry lives in the
    /// ledger; container labels stay untouched.
    pub async fn extend(&self, owner_id: &str, extra_minutes: i64) -> Result<DateTime<Utc>> {
        self.runtime.ping().await?;

        let lock = self.owner_lock(owner_id);
        let _guard = lock.lock().await;

        let instance = self
            .find_active(owner_id)
            .await?
            .ok_or_else(|| Error::NoActiveInstance(owner_id.to_string()))?;

        let ceiling = instance.created_at + Duration::minutes(self.config.max_total_minutes);
        let current = self.effective_expiry(&instance);
        let new_expiry = (current + Duration::minutes(extra_minutes)).min(ceiling);

        self.expiries
            .lock()
            .unwrap()
            .insert(instance.instance_id.clone(), new_expiry);

        info!(
            "Extended instance {} for owner {} to {} (ceiling {})",
            instance.instance_id, owner_id, new_expiry, ceiling
        );
        Ok(new_expiry)
    }

    /// Run a shell command inside the owner's active instance.
    pub async fn exec(&self, owner_id: &str, command: &str) -> Result<ExecOutput> {
        if self.runtime.ping().await.is_err() {
            return Ok(simulate::exec(command));
        }

        let lock = self.owner_lock(owner_id);
        let _guard = lock.lock().await;

        let instance = self
            .find_active(owner_id)
            .await?
            .ok_or_else(|| Error::NoActiveInstance(owner_id.to_string()))?;

        self.runtime.exec(&instance.instance_id, command).await
    }

    /// Recent log output from the owner's active instance.
    pub async fn logs(&self, owner_id: &str, tail: usize) -> Result<String> {
        self.runtime.ping().await?;

        let instance = self
            .find_active(owner_id)
            .await?
            .ok_or_else(|| Error::NoActiveInstance(owner_id.to_string()))?;

        self.runtime.logs(&instance.instance_id, tail).await
    }

    /// Admin view: every running lab instance across all owners.
    pub async fn list_active(&self) -> Result<Vec<InstanceInfo>> {
        if self.runtime.ping().await.is_err() {
            return Ok(Vec::new());
        }

        let filter = ListFilter::label(labels::OWNER).and(managed()).running();
        let records = self.runtime.list(&filter).await?;

        Ok(records
            .iter()
            .filter_map(Instance::from_record)
            .map(|i| self.describe(&i))
            .collect())
    }

    /// Expiry sweep: remove every instance past its effective expiry.
    /// Idempotent; already-removed instances count as success.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let filter = ListFilter::label(labels::EXPIRES_AT).and(managed());
        let records = self.runtime.list(&filter).await?;

        let now = Utc::now();
        let mut cleaned = Vec::new();
        let mut errors = Vec::new();
        let mut kept = Vec::new();

        for record in &records {
            let Some(instance) = Instance::from_record(record) else {
                continue;
            };
            let expires_at = self.effective_expiry(&instance);

            if now > expires_at {
                info!(
                    "Instance {} expired for owner {} ({} < now)",
                    instance.instance_id, instance.owner_id, expires_at
                );
                match self.remove_instance(&instance.instance_id, record.running).await {
                    Ok(()) => cleaned.push(instance.instance_id),
                    Err(e) => errors.push(format!("{}: {}", instance.instance_id, e)),
                }
            } else {
                kept.push(instance.instance_id);
            }
        }

        // Drop ledger entries whose containers are gone, however they
        // went away.
        self.expiries
            .lock()
            .unwrap()
            .retain(|id, _| kept.contains(id));

        if !cleaned.is_empty() {
            info!("Expiry sweep removed {} instance(s)", cleaned.len());
        }

        Ok(SweepReport {
            cleaned_count: cleaned.len(),
            instance_ids: cleaned,
            errors,
        })
    }

    /// Stale safety-net sweep: hard-cap total instance age regardless of
    /// declared expiry. Catches clock skew, label drift, and logic bugs
    /// that would otherwise leak containers forever.
    pub async fn sweep_stale(&self) -> Result<SweepReport> {
        let filter = ListFilter::label(labels::CREATED_AT).and(managed());
        let records = self.runtime.list(&filter).await?;

        let now = Utc::now();
        let mut cleaned = Vec::new();
        let mut errors = Vec::new();

        for record in &records {
            let Some(instance) = Instance::from_record(record) else {
                continue;
            };
            let age = instance.age_minutes(now);

            if age > self.config.stale_ceiling_minutes {
                warn!(
                    "Zombie instance {} (owner {}, age {}m) past hard ceiling, reclaiming",
                    instance.instance_id, instance.owner_id, age
                );
                match self.remove_instance(&instance.instance_id, record.running).await {
                    Ok(()) => cleaned.push(instance.instance_id),
                    Err(e) => errors.push(format!("{}: {}", instance.instance_id, e)),
                }
            }
        }

        if !cleaned.is_empty() {
            info!("Stale sweep reclaimed {} zombie(s)", cleaned.len());
        }

        Ok(SweepReport {
            cleaned_count: cleaned.len(),
            instance_ids: cleaned,
            errors,
        })
    }

    async fn remove_instance(&self, instance_id: &str, running: bool) -> Result<()> {
        if running {
            if let Err(e) = self.runtime.stop(instance_id, 0).await {
                debug!("Force stop of {} failed (continuing): {}", instance_id, e);
            }
        }
        self.runtime.remove(instance_id, true).await?;
        self.forget_expiry(instance_id);
        Ok(())
    }
}

/// Guards every query against foreign containers that happen to carry
/// a colliding owner label: only containers we created match.
fn managed() -> String {
    format!("{}=true", labels::MANAGED)
}

fn is_bind_conflict(message: &str) -> bool {
    message.contains("port is already allocated") || message.contains("address already in use")
}
