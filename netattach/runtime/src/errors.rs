use crate::core::{Error, ErrorSink};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Logs handled errors and counts them by kind.
#[derive(Clone, Debug, Default)]
pub struct LogErrors {
    reports: Family<ErrorLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    kind: &'static str,
}

// === impl LogErrors ===

impl LogErrors {
    pub fn register(reg: &mut Registry) -> Self {
        let reports = Family::default();
        reg.register(
            "reports",
            "Count of non-fatal errors reported, by kind",
            reports.clone(),
        );
        Self { reports }
    }
}

impl ErrorSink for LogErrors {
    fn report(&self, error: Error) {
        let kind = error.kind();
        self.reports.get_or_create(&ErrorLabels { kind }).inc();
        match error {
            Error::NamespaceResolution { .. } => tracing::warn!(%error, kind),
            Error::TypeMismatch { .. } | Error::SyncFailed { .. } => tracing::error!(%error, kind),
        }
    }
}
