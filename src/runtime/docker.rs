use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as EngineError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding, PortMap};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::StreamExt;
use tracing::{debug, info, warn};

use super::{ContainerRecord, ContainerSpec, ExecOutput, LabRuntime, ListFilter};
use crate::error::{Error, Result};

/// Bollard-backed implementation of [`LabRuntime`]. Connection is lazy;
/// `ping` is the availability check.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(socket_path: Option<&str>) -> Result<Self> {
        let docker = match socket_path {
            Some(socket) => Docker::connect_with_socket(socket, 120, API_DEFAULT_VERSION),
            None => Docker::connect_with_socket_defaults(),
        }
        .map_err(|e| Error::RuntimeUnreachable(e.to_string()))?;

        Ok(Self { docker })
    }
}

fn map_engine_err(err: EngineError) -> Error {
    match err {
        EngineError::DockerResponseServerError {
            status_code,
            message,
        } => Error::Runtime(format!("engine responded {status_code}: {message}")),
        other => Error::Runtime(other.to_string()),
    }
}

fn is_not_found(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// 304 from stop means the container was already stopped.
fn is_not_modified(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[async_trait]
impl LabRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::RuntimeUnreachable(e.to_string()))
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let port_key = format!("{}/tcp", spec.container_port);

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());

        let mut port_bindings = PortMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            memory: Some(spec.memory_limit),
            memory_swap: Some(spec.memory_limit), // Prevent swap usage
            cpu_quota: Some((spec.cpu_limit * 100_000.0) as i64),
            cpu_period: Some(100_000), // 100ms period
            port_bindings: Some(port_bindings),
            network_mode: Some("bridge".to_string()),
            auto_remove: Some(false), // Reclamation is the reaper's job
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let created = match self.docker.create_container(Some(options), config).await {
            Ok(resp) => resp,
            Err(EngineError::DockerResponseServerError {
                status_code: 404,
                message,
            }) if message.contains("No such image") => {
                return Err(Error::ImageNotFound(spec.image.clone()));
            }
            Err(e) => return Err(map_engine_err(e)),
        };

        debug!("Created container {} with ID: {}", spec.name, created.id);

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // A container that never started must not linger.
            warn!("Start failed for {}, removing: {}", spec.name, e);
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(map_engine_err(e));
        }

        info!("Started container {} ({})", spec.name, created.id);
        Ok(created.id)
    }

    async fn stop(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let options = StopContainerOptions { t: timeout_secs };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) || is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_engine_err(e)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                debug!("Removed container: {}", id);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_engine_err(e)),
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerRecord>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), filter.labels.clone());
        if filter.running_only {
            filters.insert("status".to_string(), vec!["running".to_string()]);
        }

        let options = ListContainersOptions::<String> {
            all: !filter.running_only,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_engine_err)?;

        let records = summaries
            .into_iter()
            .map(|c| ContainerRecord {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|n| n.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                running: c.state.as_deref() == Some("running"),
            })
            .collect();

        Ok(records)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerRecord> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_engine_err)?;

        let config = info.config.unwrap_or_default();

        Ok(ContainerRecord {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            running: info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false),
        })
    }

    async fn exec(&self, id: &str, command: &str) -> Result<ExecOutput> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            user: Some("root".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_config)
            .await
            .map_err(map_engine_err)?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_engine_err)?;

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Error reading exec output: {}", e),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(map_engine_err)?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut logs = String::new();

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(msg) => logs.push_str(&msg.to_string()),
                Err(e) => warn!("Error reading logs: {}", e),
            }
        }

        Ok(logs)
    }
}
