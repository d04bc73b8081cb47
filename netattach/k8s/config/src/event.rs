use crate::ResourceId;
use kube::ResourceExt;

/// A change to a single resource, as delivered to handlers.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceEvent<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}

// === impl ResourceEvent ===

impl<T: ResourceExt> ResourceEvent<T> {
    /// The resource's state after the change; for deletions, its last known state.
    pub fn current(&self) -> &T {
        match self {
            Self::Added(res) | Self::Deleted(res) => res,
            Self::Updated { new, .. } => new,
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::of(self.current())
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Added(_) => "add",
            Self::Updated { .. } => "update",
            Self::Deleted(_) => "delete",
        }
    }
}
