//! Compute endpoint (agent channel) interface and mock implementation.
//!
//! The endpoint is the local handle on the remote agent process:
//! - Whether a channel to the agent is currently present
//! - Why the node is offline, if it is
//! - Asking the agent to exit, tearing the channel down, reconnecting
//!
//! Connection establishment itself is the transport's business; the
//! controller only starts attempts and polls the returned handles.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

// =============================================================================
// Offline Causes
// =============================================================================

/// Why a node is currently marked unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineCause {
    /// Taken offline by the reboot session with the given generation.
    Reboot { session: u64 },
    /// The last connection attempt failed to launch the agent.
    LaunchFailed { reason: String },
    /// An operator disconnected the node.
    UserRequested { reason: String },
    /// The channel closed underneath us.
    ChannelTerminated { reason: String },
    Other(String),
}

/// How the reboot monitor treats an offline cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    RetryWithBackoff,
    NonRetryable,
}

impl OfflineCause {
    pub fn reboot(session: u64) -> Self {
        Self::Reboot { session }
    }

    pub fn launch_failed(reason: impl Into<String>) -> Self {
        Self::LaunchFailed {
            reason: reason.into(),
        }
    }

    /// True only for the reboot cause set by the given session.
    pub fn is_reboot_for(&self, session: u64) -> bool {
        matches!(self, Self::Reboot { session: s } if *s == session)
    }

    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Self::LaunchFailed { .. })
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Reboot { .. } => RetryClass::Retryable,
            Self::LaunchFailed { .. } => RetryClass::RetryWithBackoff,
            _ => RetryClass::NonRetryable,
        }
    }
}

impl std::fmt::Display for OfflineCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reboot { .. } => f.write_str("Rebooting after build"),
            Self::LaunchFailed { reason } => write!(f, "Launch failed: {reason}"),
            Self::UserRequested { reason } => write!(f, "Disconnected by user: {reason}"),
            Self::ChannelTerminated { reason } => write!(f, "Connection was broken: {reason}"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Transport-level failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The remote side aborted the request, usually because it is exiting.
    #[error("request aborted by remote side")]
    Aborted,

    #[error("channel already closed")]
    ChannelClosed,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("interrupted")]
    Interrupted,

    #[error("agent launch failed: {0}")]
    LaunchFailed(String),
}

impl TransportError {
    /// "Already gone" conditions that are normal while an agent shuts down.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Aborted | Self::ChannelClosed)
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Handle on an asynchronous transport operation (teardown or connect).
#[derive(Debug)]
pub enum TransportHandle {
    /// The operation completed before the handle was returned.
    Completed(Result<(), TransportError>),
    /// The operation runs on a spawned task.
    Running(JoinHandle<Result<(), TransportError>>),
}

impl TransportHandle {
    /// Run `operation` on the tokio runtime.
    pub fn spawn<F>(operation: F) -> Self
    where
        F: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        Self::Running(tokio::spawn(operation))
    }

    pub fn completed(result: Result<(), TransportError>) -> Self {
        Self::Completed(result)
    }

    /// Non-blocking completion check.
    pub fn is_finished(&self) -> bool {
        match self {
            Self::Completed(_) => true,
            Self::Running(task) => task.is_finished(),
        }
    }

    /// Wait for the operation to complete or fail.
    pub async fn wait(self) -> Result<(), TransportError> {
        match self {
            Self::Completed(result) => result,
            Self::Running(task) => match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(TransportError::Interrupted),
                Err(e) => Err(TransportError::Io(e.to_string())),
            },
        }
    }
}

// =============================================================================
// Endpoint Interface
// =============================================================================

/// The compute endpoint for one node.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    /// Endpoint display name, for logs.
    fn name(&self) -> &str;

    fn is_channel_present(&self) -> bool;

    fn offline_cause(&self) -> Option<OfflineCause>;

    /// Set or clear the temporarily-offline flag.
    fn set_temporarily_offline(&self, offline: bool, cause: Option<OfflineCause>);

    /// Ask the remote agent process to exit.
    async fn request_graceful_shutdown(&self) -> Result<(), TransportError>;

    /// Start tearing the channel down.
    fn teardown(&self, cause: Option<OfflineCause>) -> TransportHandle;

    /// Start a new connection attempt. `explicit` marks operator-initiated attempts.
    fn connect(&self, explicit: bool) -> TransportHandle;
}

// =============================================================================
// Mock Endpoint
// =============================================================================

/// Scripted outcome of one [`MockEndpoint::connect`] call.
#[derive(Debug, Clone)]
pub enum ConnectScript {
    /// The channel comes up.
    Succeed,
    /// The agent fails to launch; the offline cause becomes `LaunchFailed`.
    LaunchFail(String),
    /// The attempt fails and leaves the given offline cause behind.
    Fail(OfflineCause),
    /// The attempt never completes.
    Hang,
}

#[derive(Debug, Default)]
struct MockEndpointState {
    channel_present: bool,
    temporarily_offline: bool,
    offline_cause: Option<OfflineCause>,
    connect_scripts: VecDeque<ConnectScript>,
    shutdown_error: Option<TransportError>,
    teardown_error: Option<TransportError>,
    connect_calls: u32,
    teardown_calls: u32,
    shutdown_calls: u32,
}

/// Endpoint double with scripted connection outcomes.
pub struct MockEndpoint {
    name: String,
    state: Mutex<MockEndpointState>,
}

impl MockEndpoint {
    /// A connected endpoint.
    pub fn connected(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockEndpointState {
                channel_present: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockEndpointState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the outcome of the next connect attempt. Unscripted attempts succeed.
    pub fn script_connect(&self, script: ConnectScript) {
        self.lock().connect_scripts.push_back(script);
    }

    pub fn fail_graceful_shutdown(&self, error: TransportError) {
        self.lock().shutdown_error = Some(error);
    }

    pub fn fail_teardown(&self, error: TransportError) {
        self.lock().teardown_error = Some(error);
    }

    /// Change the offline cause out of band (e.g. an operator action).
    pub fn set_offline_cause(&self, cause: Option<OfflineCause>) {
        self.lock().offline_cause = cause;
    }

    pub fn is_temporarily_offline(&self) -> bool {
        self.lock().temporarily_offline
    }

    pub fn connect_calls(&self) -> u32 {
        self.lock().connect_calls
    }

    pub fn teardown_calls(&self) -> u32 {
        self.lock().teardown_calls
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.lock().shutdown_calls
    }
}

#[async_trait]
impl AgentEndpoint for MockEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_channel_present(&self) -> bool {
        self.lock().channel_present
    }

    fn offline_cause(&self) -> Option<OfflineCause> {
        self.lock().offline_cause.clone()
    }

    fn set_temporarily_offline(&self, offline: bool, cause: Option<OfflineCause>) {
        let mut state = self.lock();
        state.temporarily_offline = offline;
        state.offline_cause = if offline { cause } else { None };
    }

    async fn request_graceful_shutdown(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.shutdown_calls += 1;
        match state.shutdown_error.take() {
            Some(error) => Err(error),
            None => {
                debug!(endpoint = %self.name, "[MOCK] Agent process exiting");
                Ok(())
            }
        }
    }

    fn teardown(&self, cause: Option<OfflineCause>) -> TransportHandle {
        let mut state = self.lock();
        state.teardown_calls += 1;
        state.channel_present = false;
        if cause.is_some() {
            state.offline_cause = cause;
        }
        match state.teardown_error.take() {
            Some(error) => TransportHandle::completed(Err(error)),
            None => TransportHandle::completed(Ok(())),
        }
    }

    fn connect(&self, explicit: bool) -> TransportHandle {
        let mut state = self.lock();
        state.connect_calls += 1;
        let script = state
            .connect_scripts
            .pop_front()
            .unwrap_or(ConnectScript::Succeed);
        info!(endpoint = %self.name, explicit, script = ?script, "[MOCK] Connecting");

        match script {
            ConnectScript::Succeed => {
                state.channel_present = true;
                TransportHandle::completed(Ok(()))
            }
            ConnectScript::LaunchFail(reason) => {
                state.channel_present = false;
                state.offline_cause = Some(OfflineCause::launch_failed(reason.clone()));
                TransportHandle::completed(Err(TransportError::LaunchFailed(reason)))
            }
            ConnectScript::Fail(cause) => {
                state.channel_present = false;
                let reason = cause.to_string();
                state.offline_cause = Some(cause);
                TransportHandle::completed(Err(TransportError::Io(reason)))
            }
            ConnectScript::Hang => TransportHandle::spawn(std::future::pending()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OfflineCause::reboot(1), RetryClass::Retryable)]
    #[case(OfflineCause::launch_failed("ssh refused"), RetryClass::RetryWithBackoff)]
    #[case(OfflineCause::UserRequested { reason: "maintenance".into() }, RetryClass::NonRetryable)]
    #[case(OfflineCause::ChannelTerminated { reason: "eof".into() }, RetryClass::NonRetryable)]
    #[case(OfflineCause::Other("unknown".into()), RetryClass::NonRetryable)]
    fn test_offline_cause_retry_class(#[case] cause: OfflineCause, #[case] expected: RetryClass) {
        assert_eq!(cause.retry_class(), expected);
    }

    #[test]
    fn test_reboot_cause_identity() {
        let cause = OfflineCause::reboot(3);
        assert!(cause.is_reboot_for(3));
        assert!(!cause.is_reboot_for(4));
        assert!(!OfflineCause::launch_failed("x").is_reboot_for(3));
    }

    #[test]
    fn test_transport_error_expected() {
        assert!(TransportError::Aborted.is_expected());
        assert!(TransportError::ChannelClosed.is_expected());
        assert!(!TransportError::Io("broken pipe".into()).is_expected());
        assert!(!TransportError::Interrupted.is_expected());
    }

    #[tokio::test]
    async fn test_completed_handle() {
        let handle = TransportHandle::completed(Err(TransportError::Aborted));
        assert!(handle.is_finished());
        assert_eq!(handle.wait().await, Err(TransportError::Aborted));
    }

    #[tokio::test]
    async fn test_spawned_handle() {
        let handle = TransportHandle::spawn(async { Ok(()) });
        assert_eq!(handle.wait().await, Ok(()));

        let handle = TransportHandle::spawn(std::future::pending());
        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn test_mock_connect_scripts() {
        let endpoint = MockEndpoint::connected("agent-1");
        endpoint.teardown(Some(OfflineCause::reboot(1))).wait().await.unwrap();
        assert!(!endpoint.is_channel_present());
        assert_eq!(endpoint.offline_cause(), Some(OfflineCause::reboot(1)));

        endpoint.script_connect(ConnectScript::LaunchFail("ssh refused".into()));
        let handle = endpoint.connect(false);
        assert!(handle.is_finished());
        assert!(handle.wait().await.is_err());
        assert!(endpoint.offline_cause().unwrap().is_launch_failure());

        let handle = endpoint.connect(false);
        assert!(handle.wait().await.is_ok());
        assert!(endpoint.is_channel_present());
        assert_eq!(endpoint.connect_calls(), 2);
    }

    #[test]
    fn test_mock_temporarily_offline_flag() {
        let endpoint = MockEndpoint::connected("agent-1");
        endpoint.set_temporarily_offline(true, Some(OfflineCause::reboot(1)));
        assert!(endpoint.is_temporarily_offline());
        assert_eq!(endpoint.offline_cause(), Some(OfflineCause::reboot(1)));

        endpoint.set_temporarily_offline(false, None);
        assert!(!endpoint.is_temporarily_offline());
        assert_eq!(endpoint.offline_cause(), None);
    }
}
