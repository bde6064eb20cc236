//! Connection supervisor: owns the node's "has a live channel" view.
//!
//! Wraps the compute endpoint and turns transport failures into log lines.
//! Disconnect is best-effort and never fails its caller, so lifecycle
//! transitions cannot stall on an agent that is already gone.
//!
//! The endpoint can be detached when the node is removed from management;
//! every operation on a detached supervisor is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::endpoint::{AgentEndpoint, OfflineCause, TransportHandle};

pub struct ConnectionSupervisor {
    node: String,
    endpoint: RwLock<Option<Arc<dyn AgentEndpoint>>>,
    long_lived_agent: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(node: impl Into<String>, endpoint: Arc<dyn AgentEndpoint>, long_lived_agent: bool) -> Self {
        Self {
            node: node.into(),
            endpoint: RwLock::new(Some(endpoint)),
            long_lived_agent: AtomicBool::new(long_lived_agent),
        }
    }

    fn endpoint(&self) -> Option<Arc<dyn AgentEndpoint>> {
        self.endpoint
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_attached(&self) -> bool {
        self.endpoint().is_some()
    }

    /// Drop the endpoint. Returns the endpoint that was attached, if any.
    pub fn detach(&self) -> Option<Arc<dyn AgentEndpoint>> {
        let detached = self
            .endpoint
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if detached.is_some() {
            debug!(node = %self.node, "Detached compute endpoint");
        }
        detached
    }

    pub fn set_long_lived_agent(&self, long_lived: bool) {
        self.long_lived_agent.store(long_lived, Ordering::Relaxed);
    }

    pub fn is_long_lived_agent(&self) -> bool {
        self.long_lived_agent.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    /// Whether a channel to the agent is present. False once detached.
    pub fn is_channel_present(&self) -> bool {
        self.endpoint()
            .is_some_and(|endpoint| endpoint.is_channel_present())
    }

    pub fn offline_cause(&self) -> Option<OfflineCause> {
        self.endpoint().and_then(|endpoint| endpoint.offline_cause())
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Mark the node temporarily unreachable. Returns false if detached.
    pub fn take_offline(&self, cause: OfflineCause) -> bool {
        let Some(endpoint) = self.endpoint() else {
            return false;
        };
        info!(node = %self.node, cause = %cause, "Taking node offline");
        endpoint.set_temporarily_offline(true, Some(cause));
        true
    }

    /// Clear the temporarily-offline flag.
    pub fn bring_online(&self) {
        if let Some(endpoint) = self.endpoint() {
            endpoint.set_temporarily_offline(false, None);
            info!(node = %self.node, "Node back online");
        }
    }

    /// Ask a long-lived agent to exit, then tear the channel down and wait
    /// for the teardown to finish.
    pub async fn disconnect(&self, cause: Option<OfflineCause>) {
        let Some(endpoint) = self.endpoint() else {
            debug!(node = %self.node, "No endpoint attached, nothing to disconnect");
            return;
        };

        if self.is_long_lived_agent() && endpoint.is_channel_present() {
            match endpoint.request_graceful_shutdown().await {
                Ok(()) => debug!(node = %self.node, "Agent process asked to exit"),
                Err(e) if e.is_expected() => {
                    debug!(node = %self.node, error = %e, "Agent went away during shutdown")
                }
                Err(e) => {
                    warn!(node = %self.node, error = %e, "Failed to ask agent process to exit")
                }
            }
        }

        self.teardown_with(endpoint.as_ref(), cause).await;
    }

    /// Tear the channel down without asking the agent to exit first.
    pub async fn teardown_channel(&self, cause: Option<OfflineCause>) {
        if let Some(endpoint) = self.endpoint() {
            self.teardown_with(endpoint.as_ref(), cause).await;
        }
    }

    async fn teardown_with(&self, endpoint: &dyn AgentEndpoint, cause: Option<OfflineCause>) {
        match endpoint.teardown(cause).wait().await {
            Ok(()) => debug!(node = %self.node, "Channel torn down"),
            Err(e) if e.is_expected() || self.is_long_lived_agent() => {
                debug!(node = %self.node, error = %e, "Channel teardown ended early")
            }
            Err(e) => warn!(node = %self.node, error = %e, "Channel teardown failed"),
        }
    }

    /// Start a reconnect attempt. `None` when the endpoint is detached.
    pub fn connect(&self, explicit: bool) -> Option<TransportHandle> {
        let endpoint = self.endpoint()?;
        debug!(node = %self.node, explicit, "Starting connection attempt");
        Some(endpoint.connect(explicit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{MockEndpoint, TransportError};

    fn supervisor(long_lived: bool) -> (Arc<MockEndpoint>, ConnectionSupervisor) {
        let endpoint = Arc::new(MockEndpoint::connected("agent-1"));
        let api: Arc<dyn AgentEndpoint> = endpoint.clone();
        (endpoint, ConnectionSupervisor::new("agent-1", api, long_lived))
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_channel() {
        let (endpoint, supervisor) = supervisor(false);

        supervisor.disconnect(Some(OfflineCause::reboot(1))).await;
        assert!(!supervisor.is_channel_present());
        assert_eq!(endpoint.teardown_calls(), 1);
        assert_eq!(endpoint.shutdown_calls(), 0);
        assert_eq!(supervisor.offline_cause(), Some(OfflineCause::reboot(1)));
    }

    #[tokio::test]
    async fn test_long_lived_agent_is_asked_to_exit() {
        let (endpoint, supervisor) = supervisor(true);

        supervisor.disconnect(None).await;
        assert_eq!(endpoint.shutdown_calls(), 1);
        assert_eq!(endpoint.teardown_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_swallows_transport_failures() {
        let (endpoint, supervisor) = supervisor(true);
        endpoint.fail_graceful_shutdown(TransportError::Aborted);
        endpoint.fail_teardown(TransportError::Io("broken pipe".into()));

        supervisor.disconnect(None).await;
        assert_eq!(endpoint.teardown_calls(), 1);
        assert!(!supervisor.is_channel_present());
    }

    #[tokio::test]
    async fn test_no_graceful_shutdown_without_channel() {
        let (endpoint, supervisor) = supervisor(true);
        supervisor.teardown_channel(None).await;

        supervisor.disconnect(None).await;
        assert_eq!(endpoint.shutdown_calls(), 0);
        assert_eq!(endpoint.teardown_calls(), 2);
    }

    #[tokio::test]
    async fn test_take_offline_and_bring_online() {
        let (endpoint, supervisor) = supervisor(false);

        assert!(supervisor.take_offline(OfflineCause::reboot(2)));
        assert!(endpoint.is_temporarily_offline());

        supervisor.bring_online();
        assert!(!endpoint.is_temporarily_offline());
        assert_eq!(supervisor.offline_cause(), None);
    }

    #[tokio::test]
    async fn test_detached_supervisor_is_inert() {
        let (endpoint, supervisor) = supervisor(true);
        assert!(supervisor.detach().is_some());
        assert!(!supervisor.is_attached());

        assert!(!supervisor.take_offline(OfflineCause::reboot(1)));
        assert!(supervisor.connect(false).is_none());
        supervisor.disconnect(None).await;

        assert!(!supervisor.is_channel_present());
        assert_eq!(endpoint.teardown_calls(), 0);
        assert_eq!(endpoint.connect_calls(), 0);
    }
}
