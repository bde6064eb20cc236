//! Error types for the lifecycle controller.

use thiserror::Error;

use crate::cloud::CloudError;

/// Errors surfaced by lifecycle operations that report failure to the caller.
///
/// Most lifecycle transitions are best-effort and only log; the tag
/// synchronizer and reconfiguration are the operations that propagate.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The provider call failed.
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// The provider no longer reports the tracked instance.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// No instance identifier is assigned yet (e.g. unfulfilled spot request).
    #[error("no instance id assigned to node {0}")]
    NoInstanceId(String),

    /// The node has been removed from management.
    #[error("node {0} has been retired")]
    NodeRetired(String),
}

impl LifecycleError {
    /// Returns true if the caller may retry the operation later.
    /// True when the node has no instance to act on.
    pub fn is_missing_instance(&self) -> bool {
        matches!(
            self,
            LifecycleError::InstanceNotFound(_) | LifecycleError::NoInstanceId(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::Cloud(e) => e.is_retryable(),
            LifecycleError::InstanceNotFound(_) | LifecycleError::NoInstanceId(_) => true,
            LifecycleError::NodeRetired(_) => false,
        }
    }
}
