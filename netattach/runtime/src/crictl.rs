use crate::core::netns::{ContainerId, ResolveError, ResolveNetns};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::{path::PathBuf, process::Stdio};
use tokio::{process::Command, time};
use tracing::trace;

const INSPECT_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// Resolves network namespaces by inspecting containers with `crictl`.
#[derive(Clone, Debug)]
pub struct Crictl {
    path: PathBuf,
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Inspect {
    info: Info,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Info {
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    runtime_spec: Option<RuntimeSpec>,
}

#[derive(Debug, Deserialize)]
struct RuntimeSpec {
    #[serde(default)]
    linux: Option<Linux>,
}

#[derive(Debug, Deserialize)]
struct Linux {
    #[serde(default)]
    namespaces: Vec<Namespace>,
}

#[derive(Debug, Deserialize)]
struct Namespace {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: Option<String>,
}

// === impl Crictl ===

impl Crictl {
    pub fn new(path: impl Into<PathBuf>, endpoint: Option<String>) -> Self {
        Self {
            path: path.into(),
            endpoint,
        }
    }

    fn command(&self, container: &ContainerId) -> Command {
        let mut cmd = Command::new(&self.path);
        if let Some(endpoint) = &self.endpoint {
            cmd.arg("--runtime-endpoint").arg(endpoint);
        }
        cmd.args(["inspect", "--output", "json", container.id()])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl ResolveNetns for Crictl {
    async fn resolve_netns(&self, container: &ContainerId) -> Result<PathBuf, ResolveError> {
        let mut cmd = self.command(container);
        trace!(command = ?cmd, "Inspecting container");

        let output = time::timeout(INSPECT_TIMEOUT, cmd.output())
            .await
            .map_err(|_| anyhow!("crictl inspect timed out after {INSPECT_TIMEOUT:?}"))
            .map_err(ResolveError::Unavailable)?
            .with_context(|| format!("failed to execute {}", self.path.display()))
            .map_err(ResolveError::Unavailable)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") || stderr.contains("NotFound") {
                return Err(ResolveError::NotFound(container.clone()));
            }
            return Err(ResolveError::Unavailable(anyhow!(
                "crictl inspect exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        netns_from_inspect(&output.stdout).map_err(ResolveError::Unavailable)
    }
}

/// Extracts a container's network namespace path from `crictl inspect` output.
///
/// Prefers the namespace path in the container's OCI runtime spec and falls back to the
/// namespace of the container's init process.
fn netns_from_inspect(json: &[u8]) -> Result<PathBuf> {
    let Inspect { info } =
        serde_json::from_slice(json).context("failed to decode crictl inspect output")?;

    let path = info
        .runtime_spec
        .and_then(|spec| spec.linux)
        .into_iter()
        .flat_map(|linux| linux.namespaces)
        .find(|ns| ns.kind == "network")
        .and_then(|ns| ns.path)
        .filter(|path| !path.is_empty());
    if let Some(path) = path {
        return Ok(path.into());
    }

    match info.pid {
        Some(pid) if pid > 0 => Ok(format!("/proc/{pid}/ns/net").into()),
        _ => bail!("container has no network namespace path or process"),
    }
}
