//! Rollback Engine: replace a volume directory's contents with those of
//! a previously created archive.
//!
//! The archive is extracted into a staging directory next to the volume
//! and swapped in only after the full extraction succeeds, so a failed
//! extraction never leaves the volume half-empty.

use crate::archive::ArchiveManager;
use crate::error::{BerthError, Result};
use crate::paths;
use crate::volume::VolumeManager;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::info;
use zip::ZipArchive;

/// Restore `archive_name` into the volume directory of `volume_id`.
pub async fn rollback(
    archives: &ArchiveManager,
    volumes: &VolumeManager,
    instance_id: &str,
    volume_id: &str,
    archive_name: &str,
) -> Result<()> {
    let archive_path = archives.archive_path(instance_id, archive_name)?;
    if !archive_path.is_file() {
        return Err(BerthError::NotFound(format!(
            "archive '{}' not found for instance '{}'",
            archive_name, instance_id
        )));
    }

    let volume_dir = volumes.path(volume_id)?;
    let staging_dir = volume_dir.with_file_name(format!(
        "{}.restore-tmp",
        volume_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(volume_id)
    ));

    // Stale staging from a crashed rollback is discarded.
    if staging_dir.exists() {
        tokio::fs::remove_dir_all(&staging_dir).await?;
    }
    tokio::fs::create_dir_all(&staging_dir).await?;

    info!(
        "[Rollback] Extracting {} into staging for volume '{}'",
        archive_name,
        volume_id
    );

    let archive_path_clone = archive_path.clone();
    let staging_clone = staging_dir.clone();
    let extract_result = tokio::task::spawn_blocking(move || {
        extract_zip(&archive_path_clone, &staging_clone)
    })
    .await
    .map_err(|e| BerthError::Runtime(format!("extraction task failed: {}", e)))?;

    if let Err(e) = extract_result {
        let _ = tokio::fs::remove_dir_all(&staging_dir).await;
        return Err(e);
    }

    // Swap: drop the old tree, move staging into place.
    if volume_dir.exists() {
        tokio::fs::remove_dir_all(&volume_dir).await?;
    }
    tokio::fs::rename(&staging_dir, &volume_dir).await?;

    info!(
        "[Rollback] Volume '{}' restored from {}",
        volume_id,
        archive_name
    );
    Ok(())
}

/// Extract the archive's full contents into `dest`. Every entry name is
/// resolved through the Path Safety Guard before any write, rejecting
/// zip-slip entries.
fn extract_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| BerthError::Runtime(format!("unreadable archive: {}", e)))?;

    let mut buffer = vec![0u8; 64 * 1024];
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| BerthError::Runtime(format!("corrupt archive entry: {}", e)))?;

        let entry_name = entry.name().to_string();
        let out_path = paths::resolve_under(dest, &entry_name)?;
        if out_path == dest {
            continue;
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        loop {
            let n = entry.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])?;
        }
        out.sync_all()?;
    }

    Ok(())
}
