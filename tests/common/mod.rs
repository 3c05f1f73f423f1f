//! Shared fixtures: a scripted container runtime and a state store that
//! records every transition it is asked to persist.
#![allow(dead_code)]

use async_trait::async_trait;
use berth::archive::ArchiveManager;
use berth::locks::InstanceLocks;
use berth::runtime::{ContainerInfo, ContainerRuntime, ContainerSummary, CreateContainerOptions};
use berth::state::{InstanceState, MemoryStateStore, StateStore};
use berth::{BerthError, Installer, Orchestrator, Result, VolumeManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory container runtime with scripted failure points.
#[derive(Default)]
pub struct FakeRuntime {
    pub pulled: Mutex<Vec<String>>,
    pub created: Mutex<Vec<CreateContainerOptions>>,
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub renamed: Mutex<Vec<(String, String)>>,
    pub fail_pull: AtomicBool,
    pub fail_start: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn container_id(name: &str) -> String {
        format!("ctr-{}", name)
    }

    fn live_containers(&self) -> Vec<(String, String, String)> {
        let created = self.created.lock().unwrap();
        let removed = self.removed.lock().unwrap();
        let started = self.started.lock().unwrap();
        created
            .iter()
            .filter(|c| !removed.contains(&Self::container_id(&c.name)))
            .map(|c| {
                let id = Self::container_id(&c.name);
                let state = if started.contains(&id) {
                    "running".to_string()
                } else {
                    "created".to_string()
                };
                (id, c.name.clone(), state)
            })
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, reference: &str) -> Result<()> {
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(BerthError::Runtime("image pull refused".to_string()));
        }
        self.pulled.lock().unwrap().push(reference.to_string());
        Ok(())
    }

    async fn create_container(&self, options: CreateContainerOptions) -> Result<String> {
        let id = Self::container_id(&options.name);
        self.created.lock().unwrap().push(options);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(BerthError::Runtime("start refused".to_string()));
        }
        self.started.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.stopped.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.stopped.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.started.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        self.renamed
            .lock()
            .unwrap()
            .push((id.to_string(), new_name.to_string()));
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let created = self.created.lock().unwrap();
        let options = created
            .iter()
            .find(|c| Self::container_id(&c.name) == id || c.name == id)
            .ok_or_else(|| BerthError::NotFound(format!("no container '{}'", id)))?;
        let container_id = Self::container_id(&options.name);
        let running = self.started.lock().unwrap().contains(&container_id);
        Ok(ContainerInfo {
            id: container_id,
            name: options.name.clone(),
            image: options.image.clone(),
            state: if running { "running" } else { "created" }.to_string(),
            running,
            env: options.env.clone(),
            command: options.command.clone().unwrap_or_default(),
            binds: options
                .binds
                .iter()
                .map(|(h, c)| format!("{}:{}", h, c))
                .collect(),
            ports: options.ports.clone(),
        })
    }

    async fn list(&self, _all: bool) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .live_containers()
            .into_iter()
            .map(|(id, name, state)| ContainerSummary {
                id,
                names: vec![name],
                image: String::new(),
                state,
                status: String::new(),
            })
            .collect())
    }
}

/// State store that remembers the order of every upsert, for asserting
/// on deployment phase sequences.
pub struct RecordingStateStore {
    inner: MemoryStateStore,
    pub transitions: Mutex<Vec<(String, InstanceState)>>,
}

impl RecordingStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStateStore::new(),
            transitions: Mutex::new(Vec::new()),
        })
    }

    pub fn sequence_for(&self, id: &str) -> Vec<InstanceState> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(record_id, _)| record_id == id)
            .map(|(_, state)| *state)
            .collect()
    }
}

#[async_trait]
impl StateStore for RecordingStateStore {
    async fn get(&self, id: &str) -> Result<Option<InstanceState>> {
        self.inner.get(id).await
    }

    async fn upsert(&self, id: &str, state: InstanceState) -> Result<()> {
        self.transitions
            .lock()
            .unwrap()
            .push((id.to_string(), state));
        self.inner.upsert(id, state).await
    }

    async fn update_existing(&self, id: &str, state: InstanceState) -> Result<()> {
        self.inner.update_existing(id, state).await?;
        self.transitions
            .lock()
            .unwrap()
            .push((id.to_string(), state));
        Ok(())
    }
}

pub struct Fixture {
    pub orchestrator: Orchestrator,
    pub state: Arc<RecordingStateStore>,
    pub runtime: Arc<FakeRuntime>,
    pub volumes: Arc<VolumeManager>,
    pub archives: Arc<ArchiveManager>,
    pub locks: Arc<InstanceLocks>,
    pub root: tempfile::TempDir,
}

/// Build a full orchestrator on top of a scratch directory, the fake
/// runtime, and the recording store.
pub fn fixture() -> Fixture {
    let root = tempfile::tempdir().expect("tempdir");
    let state = RecordingStateStore::new();
    let runtime = FakeRuntime::new();
    let volumes = Arc::new(VolumeManager::new(root.path().join("volumes")).expect("volumes"));
    let archives = Arc::new(
        ArchiveManager::new(root.path().join("archives"), 1024 * 1024 * 1024, 4)
            .expect("archives"),
    );
    let locks = Arc::new(InstanceLocks::new());
    let orchestrator = Orchestrator::new(
        state.clone(),
        runtime.clone(),
        volumes.clone(),
        Arc::new(Installer::new()),
        archives.clone(),
        locks.clone(),
    );
    Fixture {
        orchestrator,
        state,
        runtime,
        volumes,
        archives,
        locks,
        root,
    }
}

/// Poll the state store until `id` reaches `expected` or the timeout
/// elapses. Post-response phases are only observable this way.
pub async fn wait_for_state(
    state: &Arc<RecordingStateStore>,
    id: &str,
    expected: InstanceState,
) -> bool {
    for _ in 0..200 {
        if state.get(id).await.unwrap() == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
