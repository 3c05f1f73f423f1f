//! Deployment Orchestrator: drives a single instance from image pull
//! through install-script execution to running state, updating the state
//! store at every phase.
//!
//! The HTTP caller is answered as soon as the container exists; the
//! install/start continuation runs as a background task observable only
//! through state polling, so slow install scripts never hold a request
//! open.

use crate::archive::ArchiveManager;
use crate::error::{BerthError, Result};
use crate::install::{InstallScript, Installer, VariableInput};
use crate::locks::InstanceLocks;
use crate::paths;
use crate::runtime::{find_by_name, ContainerRuntime, CreateContainerOptions};
use crate::state::{InstanceState, StateStore};
use crate::volume::VolumeManager;
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default container mount point for the instance's volume directory.
pub const DEFAULT_MOUNT_PATH: &str = "/data";

/// Deployment request.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploySpec {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// `KEY=value` entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Host port -> container port.
    #[serde(default)]
    pub ports: Vec<(u16, u16)>,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub cpus: u64,
    #[serde(default)]
    pub mount_path: Option<String>,
    #[serde(default)]
    pub scripts: Vec<InstallScript>,
    #[serde(default)]
    pub variables: Option<VariableInput>,
}

/// Edit request: unset fields preserve the existing container's values.
/// The volume to re-bind must be named explicitly.
#[derive(Debug, Clone, Deserialize)]
pub struct EditSpec {
    pub volume_id: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub ports: Vec<(u16, u16)>,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub cpus: u64,
    #[serde(default)]
    pub mount_path: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    volumes: Arc<VolumeManager>,
    installer: Arc<Installer>,
    archives: Arc<ArchiveManager>,
    locks: Arc<InstanceLocks>,
}

impl Orchestrator {
    pub fn new(
        state: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<VolumeManager>,
        installer: Arc<Installer>,
        archives: Arc<ArchiveManager>,
        locks: Arc<InstanceLocks>,
    ) -> Self {
        Self {
            state,
            runtime,
            volumes,
            installer,
            archives,
            locks,
        }
    }

    /// Deploy a new instance.
    ///
    /// Runs the synchronous prefix (pull, volume, create) and returns the
    /// container id; install and start continue in a background task.
    /// Failure in the prefix sets state `FAILED` and is surfaced to the
    /// caller directly.
    pub async fn deploy(&self, spec: DeploySpec) -> Result<String> {
        paths::validate_identifier(&spec.id)?;
        let guard = self.locks.acquire(&spec.id).await;
        self.deploy_locked(spec, guard).await
    }

    async fn deploy_locked(
        &self,
        spec: DeploySpec,
        guard: tokio::sync::OwnedMutexGuard<()>,
    ) -> Result<String> {
        let vars = match spec.variables.clone() {
            Some(input) => input.normalize()?,
            None => HashMap::new(),
        };

        let container_id = match self.provision(&spec, &vars).await {
            Ok(container_id) => container_id,
            Err(e) => {
                error!("[Orchestrator] Deployment of '{}' failed: {}", spec.id, e);
                let _ = self.state.upsert(&spec.id, InstanceState::Failed).await;
                return Err(e);
            }
        };

        // Fire-and-continue: the caller gets the container id now; the
        // rest of the pipeline is observable via state polling. The lock
        // guard moves into the task so the whole deployment serializes.
        let this = self.clone();
        let container = container_id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.finish_deployment(&spec, vars, &container).await;
        });

        Ok(container_id)
    }

    /// Steps 1-3: pull image, create volume, create container.
    async fn provision(&self, spec: &DeploySpec, vars: &HashMap<String, String>) -> Result<String> {
        self.state
            .upsert(&spec.id, InstanceState::PullingImage)
            .await?;
        self.runtime.pull_image(&spec.image).await?;

        self.state
            .upsert(&spec.id, InstanceState::CreatingVolume)
            .await?;
        let volume_dir = self.volumes.create(&spec.id).await?;

        self.state
            .upsert(&spec.id, InstanceState::CreatingContainer)
            .await?;
        let env = effective_env(spec, vars);
        let mount = spec
            .mount_path
            .clone()
            .unwrap_or_else(|| DEFAULT_MOUNT_PATH.to_string());
        let options = CreateContainerOptions {
            name: spec.id.clone(),
            image: spec.image.clone(),
            command: spec.command.clone(),
            env,
            binds: vec![(volume_dir.to_string_lossy().into_owned(), mount)],
            ports: spec.ports.clone(),
            memory_bytes: spec.memory_mb * 1024 * 1024,
            cpus: spec.cpus,
        };
        self.runtime.create_container(options).await
    }

    /// Steps 4-6: optional install pipeline, then start. Runs after the
    /// caller has been answered, so failures are recorded in the state
    /// store rather than propagated: an installation failure leaves the
    /// container created but never started, for inspection.
    async fn finish_deployment(
        &self,
        spec: &DeploySpec,
        vars: HashMap<String, String>,
        container_id: &str,
    ) {
        if !spec.scripts.is_empty() {
            if let Err(e) = self.run_install(spec, &vars).await {
                error!(
                    "[Orchestrator] Installation for '{}' failed: {}",
                    spec.id,
                    e
                );
                let _ = self
                    .state
                    .upsert(&spec.id, InstanceState::InstallationFailed)
                    .await;
                return;
            }
        }

        if let Err(e) = self.start_instance(&spec.id, container_id).await {
            error!("[Orchestrator] Start of '{}' failed: {}", spec.id, e);
            let _ = self.state.upsert(&spec.id, InstanceState::Failed).await;
        }
    }

    async fn run_install(&self, spec: &DeploySpec, vars: &HashMap<String, String>) -> Result<()> {
        self.state
            .upsert(&spec.id, InstanceState::Installing)
            .await?;

        let volume_dir = self.volumes.path(&spec.id)?;
        let install_vars = install_vars(spec, vars);

        self.installer
            .fetch_scripts(&spec.scripts, &install_vars, &volume_dir)
            .await?;
        crate::install::substitute_dir(&volume_dir, &install_vars).await?;
        Ok(())
    }

    async fn start_instance(&self, id: &str, container_id: &str) -> Result<()> {
        self.state.upsert(id, InstanceState::Starting).await?;
        self.runtime.start(container_id).await?;
        self.state.upsert(id, InstanceState::Running).await?;
        info!("[Orchestrator] Instance '{}' is running", id);
        Ok(())
    }

    /// Tear down the existing container and run the full pipeline again
    /// with updated parameters. The existing container must be
    /// resolvable; stopped containers count.
    pub async fn redeploy(&self, spec: DeploySpec) -> Result<String> {
        paths::validate_identifier(&spec.id)?;
        let guard = self.locks.acquire(&spec.id).await;
        let existing = find_by_name(self.runtime.as_ref(), &spec.id).await?;
        self.stop_and_remove(&existing.id).await?;
        self.deploy_locked(spec, guard).await
    }

    /// Re-run the install pipeline against the existing volume, then
    /// restart. The container is kept; its port bindings feed the
    /// install variables the same way they do on first deployment.
    pub async fn reinstall(
        &self,
        id: &str,
        scripts: Vec<InstallScript>,
        variables: Option<VariableInput>,
        clear_volume: bool,
    ) -> Result<()> {
        paths::validate_identifier(id)?;
        let _guard = self.locks.acquire(id).await;

        let existing = find_by_name(self.runtime.as_ref(), id).await?;
        if existing.state == "running" {
            self.runtime.stop(&existing.id).await?;
        }

        let vars = match variables {
            Some(input) => input.normalize()?,
            None => HashMap::new(),
        };
        let info = self.runtime.inspect(&existing.id).await?;
        let spec = DeploySpec {
            id: id.to_string(),
            image: info.image,
            command: None,
            env: info.env,
            ports: info.ports,
            memory_mb: 0,
            cpus: 0,
            mount_path: None,
            scripts,
            variables: None,
        };

        if clear_volume {
            self.volumes.clear(id).await?;
        }

        if let Err(e) = self.run_install(&spec, &vars).await {
            let _ = self
                .state
                .upsert(id, InstanceState::InstallationFailed)
                .await;
            return Err(e);
        }

        if let Err(e) = self.start_instance(id, &existing.id).await {
            let _ = self.state.upsert(id, InstanceState::Failed).await;
            return Err(e);
        }
        Ok(())
    }

    /// Recreate the container, preserving image/command/env unless the
    /// edit overrides them. The volume to re-bind is named explicitly.
    pub async fn edit(&self, id: &str, edit: EditSpec) -> Result<String> {
        paths::validate_identifier(id)?;
        paths::validate_identifier(&edit.volume_id)?;
        let _guard = self.locks.acquire(id).await;

        let existing = find_by_name(self.runtime.as_ref(), id).await?;
        let info = self.runtime.inspect(&existing.id).await?;
        self.stop_and_remove(&existing.id).await?;

        self.state
            .upsert(id, InstanceState::CreatingContainer)
            .await?;
        let volume_dir = self.volumes.path(&edit.volume_id)?;
        let mount = edit
            .mount_path
            .unwrap_or_else(|| DEFAULT_MOUNT_PATH.to_string());
        let options = CreateContainerOptions {
            name: id.to_string(),
            image: edit.image.unwrap_or(info.image),
            command: edit.command.or(if info.command.is_empty() {
                None
            } else {
                Some(info.command)
            }),
            env: edit.env.unwrap_or(info.env),
            binds: vec![(volume_dir.to_string_lossy().into_owned(), mount)],
            ports: edit.ports,
            memory_bytes: edit.memory_mb * 1024 * 1024,
            cpus: edit.cpus,
        };

        let container_id = match self.runtime.create_container(options).await {
            Ok(container_id) => container_id,
            Err(e) => {
                let _ = self.state.upsert(id, InstanceState::Failed).await;
                return Err(e);
            }
        };

        if let Err(e) = self.start_instance(id, &container_id).await {
            let _ = self.state.upsert(id, InstanceState::Failed).await;
            return Err(e);
        }
        Ok(container_id)
    }

    /// Remove the instance: container, volume directory, archives. The
    /// state record persists with the terminal `DELETED` value for
    /// audit.
    pub async fn delete(&self, id: &str) -> Result<()> {
        paths::validate_identifier(id)?;
        let _guard = self.locks.acquire(id).await;

        match find_by_name(self.runtime.as_ref(), id).await {
            Ok(existing) => self.stop_and_remove(&existing.id).await?,
            Err(BerthError::NotFound(_)) => {
                warn!("[Orchestrator] No container for '{}', removing data only", id);
            }
            Err(e) => return Err(e),
        }

        self.volumes.remove(id).await?;
        match self.archives.purge(id).await {
            Ok(_) => {}
            Err(BerthError::PartialFailure { failed, total }) => {
                warn!(
                    "[Orchestrator] Purge for '{}' left {}/{} archives behind",
                    id,
                    failed,
                    total
                );
            }
            Err(e) => return Err(e),
        }

        self.state.upsert(id, InstanceState::Deleted).await?;
        self.locks.evict(id).await;
        info!("[Orchestrator] Instance '{}' deleted", id);
        Ok(())
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        // Best-effort stop; an already-stopped container is fine.
        if let Err(e) = self.runtime.stop(container_id).await {
            debug!(
                "[Orchestrator] Stop before removal of {} failed: {}",
                container_id,
                e
            );
        }
        self.runtime.remove(container_id).await
    }
}

/// Effective container environment: explicit env entries, the variable
/// mapping, the inferred primary port, memory/cpu hints, and the
/// instance id. Later entries win on the engine side, so explicit env
/// comes first.
fn effective_env(spec: &DeploySpec, vars: &HashMap<String, String>) -> Vec<String> {
    let mut env = spec.env.clone();
    for (key, value) in vars {
        env.push(format!("{}={}", key, value));
    }
    if let Some((_, container_port)) = primary_port(spec) {
        env.push(format!("SERVER_PORT={}", container_port));
    }
    if spec.memory_mb > 0 {
        env.push(format!("SERVER_MEMORY={}", spec.memory_mb));
    }
    if spec.cpus > 0 {
        env.push(format!("SERVER_CPU={}", spec.cpus));
    }
    env.push(format!("INSTANCE_ID={}", spec.id));
    env
}

/// Variables visible to install scripts: the caller's mapping extended
/// by the primary port, a container-name-derived token, a timestamp, and
/// a random token.
fn install_vars(spec: &DeploySpec, vars: &HashMap<String, String>) -> HashMap<String, String> {
    let mut out = vars.clone();
    if let Some((_, container_port)) = primary_port(spec) {
        out.entry("SERVER_PORT".to_string())
            .or_insert_with(|| container_port.to_string());
    }
    out.entry("SERVER_NAME".to_string())
        .or_insert_with(|| spec.id.replace(['-', '.'], "_"));
    out.entry("TIMESTAMP".to_string())
        .or_insert_with(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
    out.entry("RANDOM".to_string())
        .or_insert_with(random_token);
    out
}

fn primary_port(spec: &DeploySpec) -> Option<(u16, u16)> {
    spec.ports.first().copied()
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| format!("{:x}", rng.gen_range(0..16)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DeploySpec {
        DeploySpec {
            id: "app1".to_string(),
            image: "example/app:latest".to_string(),
            command: None,
            env: vec!["EULA=true".to_string()],
            ports: vec![(25565, 25565)],
            memory_mb: 2048,
            cpus: 2,
            mount_path: None,
            scripts: Vec::new(),
            variables: None,
        }
    }

    #[test]
    fn effective_env_merges_all_sources() {
        let mut vars = HashMap::new();
        vars.insert("MOTD".to_string(), "hello".to_string());
        let env = effective_env(&spec(), &vars);

        assert!(env.contains(&"EULA=true".to_string()));
        assert!(env.contains(&"MOTD=hello".to_string()));
        assert!(env.contains(&"SERVER_PORT=25565".to_string()));
        assert!(env.contains(&"SERVER_MEMORY=2048".to_string()));
        assert!(env.contains(&"SERVER_CPU=2".to_string()));
        assert!(env.contains(&"INSTANCE_ID=app1".to_string()));
    }

    #[test]
    fn install_vars_do_not_override_caller_values() {
        let mut vars = HashMap::new();
        vars.insert("SERVER_PORT".to_string(), "7777".to_string());
        let out = install_vars(&spec(), &vars);

        assert_eq!(out.get("SERVER_PORT").map(String::as_str), Some("7777"));
        assert!(out.contains_key("SERVER_NAME"));
        assert!(out.contains_key("TIMESTAMP"));
        assert_eq!(out.get("RANDOM").map(String::len), Some(8));
    }
}
