//! Install Script Templating Engine.
//!
//! Two steps, both idempotent and safe to retry: fetch the configured
//! install assets (with `{{var}}` substitution in the URI), then
//! substitute the same variables inside the downloaded text files.

use crate::error::{BerthError, Result};
use crate::paths;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Binary archives are never substituted into; their bytes are not text.
const ARCHIVE_EXTENSIONS: &[&str] = &[".zip", ".jar", ".tar", ".tar.gz", ".tgz", ".gz", ".phar"];

/// One downloadable install asset: a templated URI and a destination
/// path relative to the volume directory.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallScript {
    #[serde(alias = "Uri")]
    pub uri: String,
    #[serde(alias = "Path")]
    pub path: String,
}

/// Variable mapping input: either a pre-parsed map or a JSON-encoded
/// string, normalized before use.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VariableInput {
    Map(HashMap<String, String>),
    Json(String),
}

impl VariableInput {
    pub fn normalize(self) -> Result<HashMap<String, String>> {
        match self {
            VariableInput::Map(map) => Ok(map),
            VariableInput::Json(raw) => serde_json::from_str(&raw).map_err(|e| {
                BerthError::Validation(format!("variables is not a JSON object: {}", e))
            }),
        }
    }
}

/// Replace every `{{key}}` occurrence for every key in `vars`. Tokens
/// with no matching key are left untouched.
pub fn substitute(text: &str, vars: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

pub struct Installer {
    client: reqwest::Client,
}

impl Default for Installer {
    fn default() -> Self {
        Self::new()
    }
}

impl Installer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Download every script concurrently into `dest_dir`.
    ///
    /// Each download streams to a `.partial` file and is renamed into
    /// place only on full success; a failed download removes its partial
    /// file and is reported after all siblings settle, as a
    /// `PartialFailure` carrying the count.
    pub async fn fetch_scripts(
        &self,
        scripts: &[InstallScript],
        vars: &HashMap<String, String>,
        dest_dir: &Path,
    ) -> Result<()> {
        if scripts.is_empty() {
            return Ok(());
        }

        tokio::fs::create_dir_all(dest_dir).await?;

        let downloads = scripts.iter().map(|script| {
            let uri = substitute(&script.uri, vars);
            async move {
                let result = self.fetch_one(&uri, &script.path, dest_dir).await;
                if let Err(e) = &result {
                    warn!(
                        "[Installer] Download failed: {} -> {}: {}",
                        uri,
                        script.path,
                        e
                    );
                }
                result
            }
        });

        let results = futures::future::join_all(downloads).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            return Err(BerthError::PartialFailure {
                failed,
                total: results.len(),
            });
        }

        info!(
            "[Installer] Fetched {} install script(s) into {}",
            scripts.len(),
            dest_dir.display()
        );
        Ok(())
    }

    async fn fetch_one(&self, uri: &str, rel_path: &str, dest_dir: &Path) -> Result<()> {
        let final_path = paths::resolve_under(dest_dir, rel_path)?;
        if final_path == dest_dir {
            return Err(BerthError::Validation(format!(
                "script destination '{}' is empty",
                rel_path
            )));
        }
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                BerthError::Validation(format!("script destination '{}' has no file name", rel_path))
            })?;
        let temp_path = final_path.with_file_name(format!("{}.partial", file_name));

        let result = self.stream_to_file(uri, &temp_path).await;
        match result {
            Ok(()) => {
                tokio::fs::rename(&temp_path, &final_path).await?;
                debug!("[Installer] Downloaded {} -> {}", uri, final_path.display());
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn stream_to_file(&self, uri: &str, path: &Path) -> Result<()> {
        let response = self.client.get(uri).send().await?;
        if !response.status().is_success() {
            return Err(BerthError::Runtime(format!(
                "download of {} returned {}",
                uri,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        Ok(())
    }
}

/// Substitute variables in the immediate files of `dir` (non-recursive).
///
/// Archive files and non-UTF-8 files are skipped; a file is rewritten
/// only when at least one substitution occurred, so untouched files keep
/// their timestamps. Per-file errors are logged and do not abort the
/// siblings.
pub async fn substitute_dir(dir: &Path, vars: &HashMap<String, String>) -> Result<usize> {
    if vars.is_empty() {
        return Ok(0);
    }

    let mut rewritten = 0usize;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_lowercase();
        if ARCHIVE_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            debug!("[Installer] Skipping archive file: {}", name);
            continue;
        }

        match substitute_file(&path, vars).await {
            Ok(true) => rewritten += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(
                    "[Installer] Substitution failed for {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }

    info!(
        "[Installer] Substituted variables in {} file(s) under {}",
        rewritten,
        dir.display()
    );
    Ok(rewritten)
}

async fn substitute_file(path: &Path, vars: &HashMap<String, String>) -> Result<bool> {
    let raw = tokio::fs::read(path).await?;
    let text = match String::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => {
            debug!("[Installer] Skipping non-text file: {}", path.display());
            return Ok(false);
        }
    };

    let replaced = substitute(&text, vars);
    if replaced == text {
        return Ok(false);
    }

    tokio::fs::write(path, replaced).await?;
    Ok(true)
}
