//! Cloud provider interface and in-memory implementation.
//!
//! The provider is the authority on instance state. The controller only ever
//! sees it through [`CloudApi`]:
//! - Describing an instance (status, addresses, launch time, tags)
//! - Reboot/stop/terminate commands
//! - Creating and deleting tags
//!
//! [`MockCloud`] keeps an instance table in memory, records every call and
//! can be told to fail upcoming calls. The call log keeps the most recent
//! [`MOCK_CALL_LOG_CAPACITY`] calls. It backs the tests and the binary.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ec2_agent_id::InstanceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

// =============================================================================
// Provider Model
// =============================================================================

/// Provider-reported lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
}

impl InstanceState {
    /// Provider name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single (name, value) tag pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Point-in-time copy of the provider's view of one instance.
///
/// Never mutated after it is fetched; a refresh replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: InstanceId,
    pub state: InstanceState,
    pub public_dns: Option<String>,
    pub private_ip: Option<String>,
    pub launch_time: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl InstanceSnapshot {
    /// A freshly launched, running instance with no addresses or tags.
    pub fn running(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            state: InstanceState::Running,
            public_dns: None,
            private_ip: None,
            launch_time: Utc::now(),
            tags: BTreeMap::new(),
        }
    }

    /// Whether the instance still exists from the controller's point of view.
    pub fn is_alive(&self) -> bool {
        self.state != InstanceState::Terminated
    }

    /// Single-line JSON rendering used in failure diagnostics.
    pub fn diagnostic(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.instance_id.to_string())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Classified provider failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    /// The request did not complete (network, timeout, 5xx).
    #[error("{operation}: provider communication failed: {message}")]
    Communication {
        operation: &'static str,
        message: String,
    },

    /// The provider asked us to slow down.
    #[error("{operation}: request throttled")]
    Throttled { operation: &'static str },

    /// The provider refused the request (bad id, missing permission).
    #[error("{operation}: request rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
}

impl CloudError {
    pub fn communication(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Communication {
            operation,
            message: message.into(),
        }
    }

    pub fn rejected(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation,
            message: message.into(),
        }
    }

    /// Returns true for failures worth retrying on a later call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication { .. } | Self::Throttled { .. })
    }

    /// Name of the provider operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Communication { operation, .. }
            | Self::Throttled { operation }
            | Self::Rejected { operation, .. } => operation,
        }
    }
}

// =============================================================================
// Provider Interface
// =============================================================================

/// Provider API consumed by the controller.
///
/// Every call blocks its caller for one round trip. Batches carry no
/// transactional guarantee.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Describe the given instances. Unknown ids are simply absent from the result.
    async fn describe_instances(
        &self,
        instance_ids: &[InstanceId],
    ) -> Result<Vec<InstanceSnapshot>, CloudError>;

    async fn reboot_instance(&self, instance_id: &InstanceId) -> Result<(), CloudError>;

    async fn stop_instance(&self, instance_id: &InstanceId) -> Result<(), CloudError>;

    async fn terminate_instance(&self, instance_id: &InstanceId) -> Result<(), CloudError>;

    /// Create or overwrite the given tags.
    async fn create_tags(&self, instance_id: &InstanceId, tags: &[Tag]) -> Result<(), CloudError>;

    /// Delete the given tags. A tag is only removed when its value matches.
    async fn delete_tags(&self, instance_id: &InstanceId, tags: &[Tag]) -> Result<(), CloudError>;
}

// =============================================================================
// In-memory Provider
// =============================================================================

/// Provider operations, used to count and fail calls on [`MockCloud`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOperation {
    Describe,
    Reboot,
    Stop,
    Terminate,
    CreateTags,
    DeleteTags,
}

impl CloudOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Describe => "describe_instances",
            Self::Reboot => "reboot_instances",
            Self::Stop => "stop_instances",
            Self::Terminate => "terminate_instances",
            Self::CreateTags => "create_tags",
            Self::DeleteTags => "delete_tags",
        }
    }
}

/// A recorded call against [`MockCloud`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCall {
    pub operation: CloudOperation,
    pub instance_ids: Vec<InstanceId>,
    pub tags: Vec<Tag>,
}

/// Calls kept by [`MockCloud`]; older ones are dropped first.
pub const MOCK_CALL_LOG_CAPACITY: usize = 1024;

#[derive(Default)]
struct MockCloudState {
    instances: HashMap<InstanceId, InstanceSnapshot>,
    calls: VecDeque<CloudCall>,
    failures: HashMap<CloudOperation, VecDeque<CloudError>>,
}

/// In-memory provider for tests and local runs.
#[derive(Default)]
pub struct MockCloud {
    state: Mutex<MockCloudState>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider that already knows the given instance.
    pub fn with_instance(snapshot: InstanceSnapshot) -> Self {
        let cloud = Self::new();
        cloud.insert_instance(snapshot);
        cloud
    }

    fn lock(&self) -> MutexGuard<'_, MockCloudState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_instance(&self, snapshot: InstanceSnapshot) {
        self.lock()
            .instances
            .insert(snapshot.instance_id.clone(), snapshot);
    }

    pub fn remove_instance(&self, instance_id: &InstanceId) -> Option<InstanceSnapshot> {
        self.lock().instances.remove(instance_id)
    }

    /// Change an instance's state out of band.
    pub fn set_state(&self, instance_id: &InstanceId, state: InstanceState) {
        if let Some(instance) = self.lock().instances.get_mut(instance_id) {
            instance.state = state;
        }
    }

    /// Current provider-side view of an instance.
    pub fn instance(&self, instance_id: &InstanceId) -> Option<InstanceSnapshot> {
        self.lock().instances.get(instance_id).cloned()
    }

    /// Current provider-side tags of an instance.
    pub fn tags_of(&self, instance_id: &InstanceId) -> BTreeMap<String, String> {
        self.instance(instance_id)
            .map(|i| i.tags)
            .unwrap_or_default()
    }

    /// Fail the next call of `operation` with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, operation: CloudOperation, error: CloudError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.lock().calls.iter().cloned().collect()
    }

    pub fn call_count(&self, operation: CloudOperation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    /// Record the call and return the queued failure for it, if any.
    fn record(
        state: &mut MockCloudState,
        operation: CloudOperation,
        instance_ids: &[InstanceId],
        tags: &[Tag],
    ) -> Result<(), CloudError> {
        if state.calls.len() == MOCK_CALL_LOG_CAPACITY {
            state.calls.pop_front();
        }
        state.calls.push_back(CloudCall {
            operation,
            instance_ids: instance_ids.to_vec(),
            tags: tags.to_vec(),
        });

        match state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => {
                debug!(operation = operation.as_str(), error = %error, "[MOCK] Injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn known_instance<'a>(
        state: &'a mut MockCloudState,
        operation: CloudOperation,
        instance_id: &InstanceId,
    ) -> Result<&'a mut InstanceSnapshot, CloudError> {
        state.instances.get_mut(instance_id).ok_or_else(|| {
            CloudError::rejected(
                operation.as_str(),
                format!("InvalidInstanceID.NotFound: {instance_id}"),
            )
        })
    }

    fn transition(
        &self,
        operation: CloudOperation,
        instance_id: &InstanceId,
        to: Option<InstanceState>,
    ) -> Result<(), CloudError> {
        let mut state = self.lock();
        Self::record(&mut state, operation, std::slice::from_ref(instance_id), &[])?;
        let instance = Self::known_instance(&mut state, operation, instance_id)?;
        if let Some(to) = to {
            instance.state = to;
        }
        info!(
            instance_id = %instance_id,
            operation = operation.as_str(),
            state = %instance.state,
            "[MOCK] Instance command applied"
        );
        Ok(())
    }
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn describe_instances(
        &self,
        instance_ids: &[InstanceId],
    ) -> Result<Vec<InstanceSnapshot>, CloudError> {
        let mut state = self.lock();
        Self::record(&mut state, CloudOperation::Describe, instance_ids, &[])?;
        Ok(instance_ids
            .iter()
            .filter_map(|id| state.instances.get(id).cloned())
            .collect())
    }

    async fn reboot_instance(&self, instance_id: &InstanceId) -> Result<(), CloudError> {
        self.transition(CloudOperation::Reboot, instance_id, None)
    }

    async fn stop_instance(&self, instance_id: &InstanceId) -> Result<(), CloudError> {
        self.transition(CloudOperation::Stop, instance_id, Some(InstanceState::Stopped))
    }

    async fn terminate_instance(&self, instance_id: &InstanceId) -> Result<(), CloudError> {
        self.transition(
            CloudOperation::Terminate,
            instance_id,
            Some(InstanceState::Terminated),
        )
    }

    async fn create_tags(&self, instance_id: &InstanceId, tags: &[Tag]) -> Result<(), CloudError> {
        let mut state = self.lock();
        Self::record(
            &mut state,
            CloudOperation::CreateTags,
            std::slice::from_ref(instance_id),
            tags,
        )?;
        let instance = Self::known_instance(&mut state, CloudOperation::CreateTags, instance_id)?;
        for tag in tags {
            instance.tags.insert(tag.name.clone(), tag.value.clone());
        }
        Ok(())
    }

    async fn delete_tags(&self, instance_id: &InstanceId, tags: &[Tag]) -> Result<(), CloudError> {
        let mut state = self.lock();
        Self::record(
            &mut state,
            CloudOperation::DeleteTags,
            std::slice::from_ref(instance_id),
            tags,
        )?;
        let instance = Self::known_instance(&mut state, CloudOperation::DeleteTags, instance_id)?;
        for tag in tags {
            if instance.tags.get(&tag.name) == Some(&tag.value) {
                instance.tags.remove(&tag.name);
            }
        }
        Ok(())
    }
}
