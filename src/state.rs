//! Instance lifecycle state persistence.
//!
//! The store is an injected trait so the orchestrator is not coupled to a
//! file path; the daemon runs a JSON-file implementation and tests run an
//! in-memory one.

use crate::error::{BerthError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Lifecycle state of an instance.
///
/// A fresh deployment progresses
/// `PULLING_IMAGE → CREATING_VOLUME → CREATING_CONTAINER → INSTALLING
/// (optional) → STARTING → RUNNING`, with `INSTALLATION_FAILED` / `FAILED`
/// as error exits and `DELETED` as the terminal state set on removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    PullingImage,
    CreatingVolume,
    CreatingContainer,
    Installing,
    Starting,
    Running,
    InstallationFailed,
    Failed,
    Deleted,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::PullingImage => "PULLING_IMAGE",
            InstanceState::CreatingVolume => "CREATING_VOLUME",
            InstanceState::CreatingContainer => "CREATING_CONTAINER",
            InstanceState::Installing => "INSTALLING",
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::InstallationFailed => "INSTALLATION_FAILED",
            InstanceState::Failed => "FAILED",
            InstanceState::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Durable mapping from instance id to lifecycle state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<InstanceState>>;

    /// Upsert: any prior record for `id` is replaced.
    async fn upsert(&self, id: &str, state: InstanceState) -> Result<()>;

    /// Update-only: fails with `NotFound` when no record exists for `id`,
    /// and does not create one.
    async fn update_existing(&self, id: &str, state: InstanceState) -> Result<()>;
}

/// One record of the persistence document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateRecord {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: InstanceState,
}

/// File-backed store: a single JSON array of `{Id, State}` records,
/// read-modify-write on every access.
///
/// Self-healing initialization: an absent document is created empty on
/// access; a present but unparsable document fails the access loudly
/// rather than silently resetting, so corruption is never masked.
pub struct JsonStateStore {
    path: PathBuf,
    // Serializes read-modify-write cycles against the same document.
    lock: Mutex<()>,
}

impl JsonStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn read_records(&self) -> Result<Vec<StateRecord>> {
        if !self.path.exists() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&self.path, b"[]").await?;
            info!(
                "[StateStore] Initialized empty state document at {}",
                self.path.display()
            );
            return Ok(Vec::new());
        }

        let raw = tokio::fs::read(&self.path).await?;
        let records: Vec<StateRecord> = serde_json::from_slice(&raw)?;
        Ok(records)
    }

    async fn write_records(&self, records: &[StateRecord]) -> Result<()> {
        let data = serde_json::to_vec_pretty(records)?;

        // Atomic write: temp file, then rename.
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &data).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn get(&self, id: &str) -> Result<Option<InstanceState>> {
        let _guard = self.lock.lock().await;
        let records = self.read_records().await?;
        Ok(records.iter().find(|r| r.id == id).map(|r| r.state))
    }

    async fn upsert(&self, id: &str, state: InstanceState) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_records().await?;
        records.retain(|r| r.id != id);
        records.push(StateRecord {
            id: id.to_string(),
            state,
        });
        self.write_records(&records).await?;
        debug!("[StateStore] {} -> {}", id, state);
        Ok(())
    }

    async fn update_existing(&self, id: &str, state: InstanceState) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_records().await?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| BerthError::NotFound(format!("no state record for '{}'", id)))?;
        record.state = state;
        self.write_records(&records).await?;
        debug!("[StateStore] {} -> {} (update)", id, state);
        Ok(())
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, InstanceState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &str) -> Result<Option<InstanceState>> {
        Ok(self.records.lock().await.get(id).copied())
    }

    async fn upsert(&self, id: &str, state: InstanceState) -> Result<()> {
        self.records.lock().await.insert(id.to_string(), state);
        Ok(())
    }

    async fn update_existing(&self, id: &str, state: InstanceState) -> Result<()> {
        let mut records = self.records.lock().await;
        match records.get_mut(id) {
            Some(existing) => {
                *existing = state;
                Ok(())
            }
            None => Err(BerthError::NotFound(format!(
                "no state record for '{}'",
                id
            ))),
        }
    }
}
