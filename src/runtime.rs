//! Container Runtime Client.
//!
//! The orchestrator talks to the runtime through the [`ContainerRuntime`]
//! trait; [`DockerClient`] implements it against the Docker Engine HTTP
//! API. Any non-success result is fatal to the caller's current step.

use crate::error::{BerthError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Parameters for container creation.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOptions {
    pub name: String,
    pub image: String,
    /// Command override; `None` keeps the image default.
    pub command: Option<Vec<String>>,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    /// Host path -> container mount path.
    pub binds: Vec<(String, String)>,
    /// Host port -> container port (tcp).
    pub ports: Vec<(u16, u16)>,
    /// Memory limit in bytes, 0 for unlimited.
    pub memory_bytes: u64,
    /// CPU limit in whole cores, 0 for unlimited.
    pub cpus: u64,
}

/// Inspection result, reduced to what the daemon surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub running: bool,
    pub env: Vec<String>,
    pub command: Vec<String>,
    pub binds: Vec<String>,
    /// Host port -> container port, recovered from the port bindings.
    pub ports: Vec<(u16, u16)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Create a container, returning its runtime id.
    async fn create_container(&self, options: CreateContainerOptions) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn kill(&self, id: &str) -> Result<()>;
    async fn restart(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn rename(&self, id: &str, new_name: &str) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<ContainerInfo>;
    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>>;
}

/// Docker Engine HTTP API client.
pub struct DockerClient {
    client: reqwest::Client,
    endpoint: String,
    power_timeout: Duration,
}

impl DockerClient {
    pub fn new(endpoint: String, power_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(BerthError::Http)?;
        Ok(Self {
            client,
            endpoint,
            power_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Consume a response, mapping engine error statuses to the daemon's
    /// taxonomy. 404 maps to `NotFound`; everything else non-success is
    /// `Runtime` with the engine's message.
    async fn check(response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(BerthError::NotFound(format!("{}: {}", context, body.trim())))
        } else {
            Err(BerthError::Runtime(format!(
                "{} failed with {}: {}",
                context,
                status,
                body.trim()
            )))
        }
    }

    /// Power actions carry a fixed timeout; exceeding it is a `Timeout`.
    async fn power_action(&self, id: &str, action: &str, query: &str) -> Result<()> {
        let url = self.url(&format!("/containers/{}/{}{}", id, action, query));
        let send = self.client.post(&url).send();

        let response = tokio::time::timeout(self.power_timeout, send)
            .await
            .map_err(|_| {
                BerthError::Timeout(format!(
                    "{} of container {} exceeded {}s",
                    action,
                    id,
                    self.power_timeout.as_secs()
                ))
            })?
            .map_err(BerthError::Http)?;

        // 304 means the container was already in the requested state.
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        Self::check(response, &format!("{} container {}", action, id)).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct CreateContainerResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct EngineContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Deserialize)]
struct EngineInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Config")]
    config: Option<EngineInspectConfig>,
    #[serde(rename = "State")]
    state: Option<EngineInspectState>,
    #[serde(rename = "HostConfig")]
    host_config: Option<EngineInspectHostConfig>,
}

#[derive(Deserialize)]
struct EngineInspectConfig {
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Env", default)]
    env: Vec<String>,
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct EngineInspectState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Deserialize)]
struct EngineInspectHostConfig {
    #[serde(rename = "Binds", default)]
    binds: Option<Vec<String>>,
    #[serde(rename = "PortBindings", default)]
    port_bindings: Option<HashMap<String, Option<Vec<EnginePortBinding>>>>,
}

#[derive(Deserialize)]
struct EnginePortBinding {
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

/// Flatten engine port bindings (`"25565/tcp": [{"HostPort": "25565"}]`)
/// into host -> container pairs.
fn parse_port_bindings(raw: &HashMap<String, Option<Vec<EnginePortBinding>>>) -> Vec<(u16, u16)> {
    let mut ports = Vec::new();
    for (key, bindings) in raw {
        let container_port = key.split('/').next().and_then(|p| p.parse::<u16>().ok());
        let (container_port, bindings) = match (container_port, bindings) {
            (Some(port), Some(bindings)) => (port, bindings),
            _ => continue,
        };
        for binding in bindings {
            if let Ok(host_port) = binding.host_port.parse::<u16>() {
                ports.push((host_port, container_port));
            }
        }
    }
    ports.sort_unstable();
    ports
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn pull_image(&self, reference: &str) -> Result<()> {
        info!("[Runtime] Pulling image: {}", reference);

        let url = self.url(&format!(
            "/images/create?fromImage={}",
            urlencode(reference)
        ));
        let response = self.client.post(&url).send().await?;
        let response = Self::check(response, &format!("pull image {}", reference)).await?;

        // The engine streams progress as JSON lines; drain it so the pull
        // completes before we report success.
        let _ = response.bytes().await?;
        info!("[Runtime] Image pulled: {}", reference);
        Ok(())
    }

    async fn create_container(&self, options: CreateContainerOptions) -> Result<String> {
        info!(
            "[Runtime] Creating container '{}' from image {}",
            options.name,
            options.image
        );

        let binds: Vec<String> = options
            .binds
            .iter()
            .map(|(host, dest)| format!("{}:{}", host, dest))
            .collect();

        let mut exposed = serde_json::Map::new();
        let mut port_bindings = serde_json::Map::new();
        for (host_port, container_port) in &options.ports {
            let key = format!("{}/tcp", container_port);
            exposed.insert(key.clone(), json!({}));
            port_bindings.insert(
                key,
                json!([{ "HostPort": host_port.to_string() }]),
            );
        }

        let mut body = json!({
            "Image": options.image,
            "Env": options.env,
            "ExposedPorts": exposed,
            "HostConfig": {
                "Binds": binds,
                "PortBindings": port_bindings,
                "Memory": options.memory_bytes,
                "NanoCpus": options.cpus * 1_000_000_000,
            },
        });
        if let Some(command) = &options.command {
            body["Cmd"] = json!(command);
        }

        let url = self.url(&format!(
            "/containers/create?name={}",
            urlencode(&options.name)
        ));
        let response = self.client.post(&url).json(&body).send().await?;
        let response =
            Self::check(response, &format!("create container {}", options.name)).await?;

        let created: CreateContainerResponse = response.json().await?;
        info!(
            "[Runtime] Container '{}' created: {}",
            options.name,
            created.id
        );
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.power_action(id, "start", "").await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.power_action(id, "stop", "?t=10").await
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.power_action(id, "kill", "").await
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.power_action(id, "restart", "?t=10").await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("/containers/{}?force=true", id));
        let response = self.client.delete(&url).send().await?;
        Self::check(response, &format!("remove container {}", id)).await?;
        Ok(())
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        let url = self.url(&format!(
            "/containers/{}/rename?name={}",
            id,
            urlencode(new_name)
        ));
        let response = self.client.post(&url).send().await?;
        Self::check(response, &format!("rename container {}", id)).await?;
        info!("[Runtime] Container {} renamed to '{}'", id, new_name);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let url = self.url(&format!("/containers/{}/json", id));
        let response = self.client.get(&url).send().await?;
        let response = Self::check(response, &format!("inspect container {}", id)).await?;

        let raw: EngineInspect = response.json().await?;
        let config = raw.config;
        let state = raw.state;
        let host_config = raw.host_config;
        Ok(ContainerInfo {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            image: config.as_ref().map(|c| c.image.clone()).unwrap_or_default(),
            state: state.as_ref().map(|s| s.status.clone()).unwrap_or_default(),
            running: state.as_ref().map(|s| s.running).unwrap_or(false),
            env: config.as_ref().map(|c| c.env.clone()).unwrap_or_default(),
            command: config
                .as_ref()
                .and_then(|c| c.cmd.clone())
                .unwrap_or_default(),
            binds: host_config
                .as_ref()
                .and_then(|h| h.binds.clone())
                .unwrap_or_default(),
            ports: host_config
                .as_ref()
                .and_then(|h| h.port_bindings.as_ref())
                .map(parse_port_bindings)
                .unwrap_or_default(),
        })
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let url = self.url(&format!("/containers/json?all={}", all));
        let response = self.client.get(&url).send().await?;
        let response = Self::check(response, "list containers").await?;

        let raw: Vec<EngineContainerSummary> = response.json().await?;
        Ok(raw
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id,
                names: c
                    .names
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
                image: c.image,
                state: c.state,
                status: c.status,
            })
            .collect())
    }
}

/// Percent-encode the characters that matter in engine query strings.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Find a container whose name matches `name`, searching stopped
/// containers too. Used by the redeploy/reinstall/edit variants, which
/// require the instance's existing container to be resolvable.
pub async fn find_by_name(
    runtime: &dyn ContainerRuntime,
    name: &str,
) -> Result<ContainerSummary> {
    let containers = runtime.list(true).await?;
    containers
        .into_iter()
        .find(|c| c.names.iter().any(|n| n == name))
        .ok_or_else(|| BerthError::NotFound(format!("no container named '{}'", name)))
}
