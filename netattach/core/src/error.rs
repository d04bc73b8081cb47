use crate::netns::ResolveError;

/// Failures that are handled where they occur and reported to an [`ErrorSink`] rather than
/// propagated.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A watched object could not be decoded as the resource kind its watch serves.
    #[error("unexpected object type for {kind} {namespace}/{name}: {source}")]
    TypeMismatch {
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// A workload's network namespace could not be resolved; it is skipped for the current pass.
    #[error("failed to resolve network namespace for pod {namespace}/{name}: {source}")]
    NamespaceResolution {
        namespace: String,
        name: String,
        #[source]
        source: ResolveError,
    },

    /// A scheduled run failed. It is retried on the runner's regular cadence.
    #[error("{runner} failed: {source}")]
    SyncFailed {
        runner: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Receives reports of non-fatal errors.
///
/// Implementations must not block the reporting task.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: Error);
}

// === impl Error ===

impl Error {
    /// A short, stable name for the error's kind, suitable for use as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::NamespaceResolution { .. } => "namespace_resolution",
            Self::SyncFailed { .. } => "sync_failed",
        }
    }
}
