pub mod archive;
pub mod config;
pub mod deploy;
pub mod error;
pub mod install;
pub mod locks;
pub mod paths;
pub mod rollback;
pub mod runtime;
pub mod server;
pub mod state;
pub mod volume;

pub use archive::{ArchiveEntry, ArchiveManager};
pub use config::Config;
pub use deploy::{DeploySpec, EditSpec, Orchestrator};
pub use error::{BerthError, Result};
pub use install::{InstallScript, Installer, VariableInput};
pub use runtime::{ContainerRuntime, CreateContainerOptions, DockerClient};
pub use state::{InstanceState, JsonStateStore, MemoryStateStore, StateStore};
pub use volume::VolumeManager;

use locks::InstanceLocks;
use server::AppState;
use std::sync::Arc;
use std::time::Duration;

/// Wire the daemon's components from configuration and serve until the
/// listener fails.
pub async fn run(config: Config) -> Result<()> {
    let state: Arc<dyn StateStore> =
        Arc::new(JsonStateStore::new(config.storage.state_file.clone()));
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerClient::new(
        config.runtime.endpoint.clone(),
        Duration::from_secs(config.runtime.power_timeout_secs),
    )?);
    let volumes = Arc::new(VolumeManager::new(config.storage.volume_root.clone())?);
    let archives = Arc::new(ArchiveManager::new(
        config.storage.archive_root.clone(),
        config.storage.max_archive_bytes,
        config.storage.fs_concurrency,
    )?);
    let installer = Arc::new(Installer::new());
    let locks = Arc::new(InstanceLocks::new());

    let orchestrator = Orchestrator::new(
        state.clone(),
        runtime.clone(),
        volumes.clone(),
        installer,
        archives.clone(),
        locks.clone(),
    );

    let app_state = AppState {
        state,
        runtime,
        volumes,
        archives,
        orchestrator,
        locks,
    };

    server::start_server(&config, app_state).await
}
