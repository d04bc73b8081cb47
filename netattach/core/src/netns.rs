//! Workloads, containers and the network namespaces they run in.

use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

/// Identifies a container as reported in a pod's status, e.g. `cri-o://8e1f...`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId {
    runtime: Option<String>,
    id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid container ID: {0:?}")]
pub struct InvalidContainerId(String);

/// A workload scheduled to the local node, identified by its active container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub container: ContainerId,
}

/// The network namespace of a single workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Netns {
    pub namespace: String,
    pub name: String,
    pub path: PathBuf,
}

/// The result of a reconciliation pass, keyed by container.
///
/// Maps are only ever published whole.
pub type NetnsMap = BTreeMap<ContainerId, Netns>;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("container {0} not found")]
    NotFound(ContainerId),

    #[error("container runtime unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// Lists the workloads scheduled to a node.
#[async_trait::async_trait]
pub trait ListWorkloads: Send + Sync {
    async fn list_workloads(&self, node: &str) -> anyhow::Result<Vec<Workload>>;
}

/// Looks up the network namespace of a container through its runtime.
#[async_trait::async_trait]
pub trait ResolveNetns: Send + Sync {
    async fn resolve_netns(&self, container: &ContainerId) -> Result<PathBuf, ResolveError>;
}

// === impl ContainerId ===

impl ContainerId {
    /// The runtime-local identifier, without the runtime scheme.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runtime(&self) -> Option<&str> {
        self.runtime.as_deref()
    }
}

impl FromStr for ContainerId {
    type Err = InvalidContainerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (runtime, id) = match s.split_once("://") {
            Some((runtime, id)) if !runtime.is_empty() => (Some(runtime.to_string()), id),
            Some(_) => return Err(InvalidContainerId(s.to_string())),
            None => (None, s),
        };
        if id.is_empty() || id.contains('/') {
            return Err(InvalidContainerId(s.to_string()));
        }
        Ok(Self {
            runtime,
            id: id.to_string(),
        })
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.runtime {
            Some(runtime) => write!(f, "{}://{}", runtime, self.id),
            None => self.id.fmt(f),
        }
    }
}
