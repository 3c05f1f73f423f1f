//! Volume directory management: one persistent directory per instance,
//! bind-mounted into its container.

use crate::error::Result;
use crate::paths;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct VolumeManager {
    volume_root: PathBuf,
}

impl VolumeManager {
    pub fn new(volume_root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&volume_root)?;
        info!(
            "[VolumeManager] Initialized with volume root: {}",
            volume_root.display()
        );
        Ok(Self { volume_root })
    }

    pub fn root(&self) -> &Path {
        &self.volume_root
    }

    /// Resolve the volume directory for an instance, id validated and
    /// confined to the volume root.
    pub fn path(&self, id: &str) -> Result<PathBuf> {
        paths::validate_identifier(id)?;
        paths::resolve_under(&self.volume_root, id)
    }

    /// Create the volume directory (idempotent).
    pub async fn create(&self, id: &str) -> Result<PathBuf> {
        let dir = self.path(id)?;
        tokio::fs::create_dir_all(&dir).await?;
        info!("[VolumeManager] Volume ready for '{}': {}", id, dir.display());
        Ok(dir)
    }

    /// Remove every entry inside the volume directory, recreating it if
    /// absent. The directory itself survives.
    pub async fn clear(&self, id: &str) -> Result<PathBuf> {
        let dir = self.path(id)?;
        if !dir.exists() {
            tokio::fs::create_dir_all(&dir).await?;
            return Ok(dir);
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }

        info!("[VolumeManager] Cleared volume '{}'", id);
        Ok(dir)
    }

    /// Delete the volume directory entirely. Missing directory is fine.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let dir = self.path(id)?;
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
            info!("[VolumeManager] Removed volume '{}'", id);
        }
        Ok(())
    }

    /// Disk usage of the volume tree in bytes, computed by direct
    /// traversal rather than shelling out.
    pub async fn tree_size(&self, id: &str) -> Result<u64> {
        let dir = self.path(id)?;
        let total = tokio::task::spawn_blocking(move || {
            let mut total = 0u64;
            for entry in walkdir::WalkDir::new(&dir).into_iter().flatten() {
                if entry.file_type().is_file() {
                    if let Ok(metadata) = entry.metadata() {
                        total += metadata.len();
                    }
                }
            }
            total
        })
        .await
        .map_err(|e| crate::error::BerthError::Runtime(format!("tree size task failed: {}", e)))?;
        Ok(total)
    }
}
