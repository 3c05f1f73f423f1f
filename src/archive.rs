//! Archive Manager: size-bounded zip snapshots of volume directories.
//!
//! Archives are immutable once written; they are only ever created,
//! listed, downloaded, and deleted.

use crate::error::{BerthError, Result};
use crate::paths;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// One entry of an archive listing.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub size_human: String,
    pub last_modified: DateTime<Utc>,
}

pub struct ArchiveManager {
    archive_root: PathBuf,
    max_archive_bytes: u64,
    fs_concurrency: usize,
}

impl ArchiveManager {
    pub fn new(archive_root: PathBuf, max_archive_bytes: u64, fs_concurrency: usize) -> Result<Self> {
        std::fs::create_dir_all(&archive_root)?;
        info!(
            "[ArchiveManager] Initialized with archive root: {} (cap {} bytes)",
            archive_root.display(),
            max_archive_bytes
        );
        Ok(Self {
            archive_root,
            max_archive_bytes,
            fs_concurrency: fs_concurrency.max(1),
        })
    }

    /// Per-instance archive subdirectory, id validated and confined.
    pub fn instance_dir(&self, id: &str) -> Result<PathBuf> {
        paths::validate_identifier(id)?;
        paths::resolve_under(&self.archive_root, id)
    }

    /// A named archive file, both segments checked independently.
    pub fn archive_path(&self, id: &str, name: &str) -> Result<PathBuf> {
        let dir = self.instance_dir(id)?;
        paths::validate_identifier(name)?;
        paths::resolve_under(&dir, name)
    }

    /// Snapshot `volume_dir` into a new zip archive for `id`.
    ///
    /// The zip is written to a `.partial` file and renamed into place on
    /// success. Crossing the configured compressed-size cap aborts the
    /// archive, deletes the partial file, and reports
    /// `SizeLimitExceeded`; a partial file never appears in listings.
    pub async fn create(&self, id: &str, volume_dir: &Path) -> Result<ArchiveEntry> {
        let dir = self.instance_dir(id)?;
        tokio::fs::create_dir_all(&dir).await?;

        if !volume_dir.is_dir() {
            return Err(BerthError::NotFound(format!(
                "volume directory {} does not exist",
                volume_dir.display()
            )));
        }

        let name = format!("{}-{}.zip", id, timestamp_token());
        let final_path = dir.join(&name);
        let partial_path = dir.join(format!("{}.partial", name));

        // Stat the tree under bounded concurrency before compressing, so
        // oversized trees are rejected cheaply where possible.
        self.precheck_tree(volume_dir).await?;

        let volume_dir = volume_dir.to_path_buf();
        let partial = partial_path.clone();
        let cap = self.max_archive_bytes;
        let result = tokio::task::spawn_blocking(move || {
            write_zip(&volume_dir, &partial, cap)
        })
        .await
        .map_err(|e| BerthError::Runtime(format!("archive task failed: {}", e)))?;

        match result {
            Ok(()) => {
                tokio::fs::rename(&partial_path, &final_path).await?;
                let metadata = tokio::fs::metadata(&final_path).await?;
                info!(
                    "[ArchiveManager] Created archive {} ({} bytes)",
                    name,
                    metadata.len()
                );
                Ok(ArchiveEntry {
                    name,
                    size: metadata.len(),
                    size_human: human_size(metadata.len()),
                    last_modified: metadata
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial_path).await;
                Err(e)
            }
        }
    }

    /// Fast pre-compression rejection: if the uncompressed tree already
    /// exceeds several times the cap, compression cannot save it.
    /// Stat calls fan out under the configured concurrency bound.
    async fn precheck_tree(&self, volume_dir: &Path) -> Result<()> {
        let files: Vec<PathBuf> = WalkDir::new(volume_dir)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.fs_concurrency));
        let mut handles = Vec::with_capacity(files.len());
        for path in files {
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                tokio::fs::metadata(&path).await.ok().map(|m| m.len())
            }));
        }

        let mut total = 0u64;
        for handle in handles {
            if let Ok(Some(len)) = handle.await {
                total += len;
            }
        }

        // Deflate rarely beats 100:1 on real app data.
        if total / 100 > self.max_archive_bytes {
            return Err(BerthError::SizeLimitExceeded {
                limit: self.max_archive_bytes,
                reached: total,
            });
        }
        Ok(())
    }

    /// List an instance's archives newest-first. A missing subdirectory
    /// yields an empty list.
    pub async fn list(&self, id: &str) -> Result<Vec<ArchiveEntry>> {
        let dir = self.instance_dir(id)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let metadata = entry.metadata().await?;
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(ArchiveEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                size_human: human_size(metadata.len()),
                last_modified: modified,
            });
        }

        entries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(entries)
    }

    /// Open a named archive for streaming download.
    pub async fn open_for_download(&self, id: &str, name: &str) -> Result<(tokio::fs::File, u64)> {
        let path = self.archive_path(id, name)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| BerthError::NotFound(format!("archive '{}' not found", name)))?;
        if !metadata.is_file() {
            return Err(BerthError::NotFound(format!("archive '{}' not found", name)));
        }
        let file = tokio::fs::File::open(&path).await?;
        Ok((file, metadata.len()))
    }

    /// Delete a named archive. Refuses when the path is absent or not a
    /// regular file.
    pub async fn delete(&self, id: &str, name: &str) -> Result<()> {
        let path = self.archive_path(id, name)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {
                tokio::fs::remove_file(&path).await?;
                info!("[ArchiveManager] Deleted archive {}/{}", id, name);
                Ok(())
            }
            _ => Err(BerthError::NotFound(format!("archive '{}' not found", name))),
        }
    }

    /// Delete every archive for an instance with bounded parallelism.
    /// Failed deletions do not cancel siblings; they are counted and
    /// reported as a `PartialFailure` after all settle.
    pub async fn purge(&self, id: &str) -> Result<usize> {
        let archives = self.list(id).await?;
        if archives.is_empty() {
            return Ok(0);
        }

        let semaphore = Arc::new(Semaphore::new(self.fs_concurrency));
        let mut handles = Vec::with_capacity(archives.len());
        for entry in &archives {
            let path = self.archive_path(id, &entry.name)?;
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                tokio::fs::remove_file(&path).await
            }));
        }

        let total = handles.len();
        let mut failed = 0usize;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                _ => failed += 1,
            }
        }

        let dir = self.instance_dir(id)?;
        let _ = tokio::fs::remove_dir(&dir).await;

        if failed > 0 {
            return Err(BerthError::PartialFailure { failed, total });
        }
        info!("[ArchiveManager] Purged {} archive(s) for '{}'", total, id);
        Ok(total)
    }
}

/// RFC3339 UTC timestamp with `:` and `.` replaced by `-`, safe for file
/// names on every filesystem.
fn timestamp_token() -> String {
    Utc::now()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Binary-unit rendering: 10240 -> "10.0 KiB".
pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Wraps the zip writer's sink, counting compressed output bytes and
/// failing the write once the cap is crossed.
struct CappedWriter {
    inner: File,
    written: u64,
    cap: u64,
}

impl Write for CappedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        if self.written > self.cap {
            return Err(std::io::Error::other(SizeCapHit(self.written)));
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for CappedWriter {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[derive(Debug)]
struct SizeCapHit(u64);

impl std::fmt::Display for SizeCapHit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compressed output reached {} bytes", self.0)
    }
}

impl std::error::Error for SizeCapHit {}

/// Stream the full tree under `volume_dir` into a zip at `out_path`.
/// Runs on the blocking pool; the zip crate's writer is synchronous.
fn write_zip(volume_dir: &Path, out_path: &Path, cap: u64) -> Result<()> {
    let sink = CappedWriter {
        inner: File::create(out_path)?,
        written: 0,
        cap,
    };
    let mut writer = ZipWriter::new(sink);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut buffer = vec![0u8; 64 * 1024];
    for entry in WalkDir::new(volume_dir) {
        let entry = entry.map_err(|e| BerthError::Runtime(format!("tree walk failed: {}", e)))?;
        let rel = entry
            .path()
            .strip_prefix(volume_dir)
            .map_err(|e| BerthError::Runtime(format!("tree walk escaped root: {}", e)))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel_name = rel.to_string_lossy().replace('\\', "/");

        let result = if entry.file_type().is_dir() {
            writer.add_directory(format!("{}/", rel_name), options)
        } else if entry.file_type().is_file() {
            writer.start_file(rel_name.as_str(), options).and_then(|_| {
                let mut file = File::open(entry.path())?;
                loop {
                    let n = file.read(&mut buffer)?;
                    if n == 0 {
                        break;
                    }
                    writer.write_all(&buffer[..n])?;
                }
                Ok(())
            })
        } else {
            // Sockets and the like do not belong in a snapshot.
            continue;
        };

        if let Err(e) = result {
            return Err(map_zip_error(e, cap));
        }
    }

    match writer.finish() {
        Ok(mut sink) => {
            sink.flush()?;
            Ok(())
        }
        Err(e) => Err(map_zip_error(e, cap)),
    }
}

/// A write failure caused by the cap surfaces as `SizeLimitExceeded`;
/// anything else stays an IO/runtime failure.
fn map_zip_error(e: zip::result::ZipError, cap: u64) -> BerthError {
    if let zip::result::ZipError::Io(io) = &e {
        if let Some(hit) = io.get_ref().and_then(|inner| inner.downcast_ref::<SizeCapHit>()) {
            return BerthError::SizeLimitExceeded {
                limit: cap,
                reached: hit.0,
            };
        }
    }
    BerthError::Runtime(format!("zip write failed: {}", e))
}
