//! Reboot session state and the reconnect retry policy.
//!
//! The monitor is a small state machine:
//!
//! ```text
//! NoSession --reboot()--> AwaitingReboot --tick--> AttemptInFlight
//!                              ^                        |
//!                              |  launch failed         | tick
//!                              +------------------------+
//!                                                       |
//!                          online / abandoned --> NoSession
//! ```
//!
//! Each tick the controller gathers an [`Observation`] and asks
//! [`RebootPolicy::next_step`] what to do. The policy is plain data so the
//! retry and backoff rules can be tested without any collaborators.

use std::fmt;
use std::time::Duration;

use crate::endpoint::{OfflineCause, RetryClass, TransportHandle};

// =============================================================================
// Policy
// =============================================================================

/// Delays and limits of the reboot monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootPolicy {
    /// Wait after issuing the reboot, and after each failed launch.
    pub initial_delay: Duration,
    /// Wait between checks on a pending reconnect attempt.
    pub pending_recheck: Duration,
    /// Consecutive launch failures after which the session is abandoned.
    /// `None` retries indefinitely.
    pub max_launch_failures: Option<u32>,
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            pending_recheck: Duration::from_secs(5),
            max_launch_failures: None,
        }
    }
}

/// What a monitor tick saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// No attempt in flight.
    Idle {
        /// Result of a forced liveness check.
        alive: bool,
        /// The offline cause is still the one this session set.
        still_rebooting: bool,
    },
    /// An attempt is in flight and has not completed.
    AttemptPending,
    /// The attempt in flight has completed.
    AttemptFinished {
        channel_present: bool,
        cause: Option<OfflineCause>,
    },
}

/// What the monitor does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Start a reconnect attempt and check on it after `recheck_after`.
    StartAttempt { recheck_after: Duration },
    /// Leave the pending attempt alone and check again.
    Recheck { after: Duration },
    /// The channel is back. Clear the offline flag and end the session.
    Online,
    /// Drop the failed attempt and start over after `after`.
    RetryLaunch { after: Duration },
    /// End the session without further ticks.
    Abandon(AbandonReason),
}

/// Why a reboot session ended without the node coming back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    /// The instance is terminated or could not be found.
    InstanceGone,
    /// Something else changed the offline cause since the reboot.
    NoLongerRebooting,
    /// The attempt failed with a cause that is not retried.
    NonRetryable(Option<OfflineCause>),
    LaunchBudgetExhausted { failures: u32 },
    /// The compute endpoint disappeared.
    EndpointGone,
    /// The node was removed from management.
    NodeRetired,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceGone => f.write_str("instance terminated or unreachable"),
            Self::NoLongerRebooting => f.write_str("offline cause changed since reboot"),
            Self::NonRetryable(Some(cause)) => write!(f, "reconnect failed: {cause}"),
            Self::NonRetryable(None) => f.write_str("reconnect failed without a cause"),
            Self::LaunchBudgetExhausted { failures } => {
                write!(f, "agent launch failed {failures} times")
            }
            Self::EndpointGone => f.write_str("compute endpoint removed"),
            Self::NodeRetired => f.write_str("node retired"),
        }
    }
}

impl AbandonReason {
    /// True for endings that need a human to look at the node.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::InstanceGone | Self::NonRetryable(_) | Self::LaunchBudgetExhausted { .. }
        )
    }
}

impl RebootPolicy {
    /// Decide the next step. `launch_failures` counts the launch failures of
    /// the current session before this observation.
    pub fn next_step(&self, observation: &Observation, launch_failures: u32) -> Step {
        match observation {
            Observation::Idle { alive: false, .. } => Step::Abandon(AbandonReason::InstanceGone),
            Observation::Idle {
                still_rebooting: false,
                ..
            } => Step::Abandon(AbandonReason::NoLongerRebooting),
            Observation::Idle { .. } => Step::StartAttempt {
                recheck_after: self.pending_recheck,
            },
            Observation::AttemptPending => Step::Recheck {
                after: self.pending_recheck,
            },
            Observation::AttemptFinished {
                channel_present: true,
                ..
            } => Step::Online,
            Observation::AttemptFinished { cause, .. } => {
                match cause.as_ref().map(OfflineCause::retry_class) {
                    Some(RetryClass::RetryWithBackoff) => {
                        let failures = launch_failures.saturating_add(1);
                        match self.max_launch_failures {
                            Some(max) if failures >= max => {
                                Step::Abandon(AbandonReason::LaunchBudgetExhausted { failures })
                            }
                            _ => Step::RetryLaunch {
                                after: self.initial_delay,
                            },
                        }
                    }
                    _ => Step::Abandon(AbandonReason::NonRetryable(cause.clone())),
                }
            }
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Observable phase of a node's reboot monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    NoSession,
    /// Reboot issued; waiting for the next tick to start an attempt.
    AwaitingReboot,
    AttemptInFlight,
}

/// Reboot session record of one node. Guarded by the node's session lock.
#[derive(Debug, Default)]
pub struct RebootSession {
    generation: u64,
    active: bool,
    attempt: Option<TransportHandle>,
    launch_failures: u32,
}

impl RebootSession {
    /// Open a new session, superseding any previous one. Returns its generation.
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.active = true;
        self.abort_attempt();
        self.launch_failures = 0;
        self.generation
    }

    /// True if `generation` names the live session.
    pub fn is_current(&self, generation: u64) -> bool {
        self.active && self.generation == generation
    }

    pub fn end(&mut self) {
        self.active = false;
        self.abort_attempt();
    }

    /// Drop the in-flight attempt, cancelling it if it still runs.
    fn abort_attempt(&mut self) {
        if let Some(TransportHandle::Running(task)) = self.attempt.take() {
            task.abort();
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match (self.active, self.attempt.is_some()) {
            (false, _) => SessionPhase::NoSession,
            (true, false) => SessionPhase::AwaitingReboot,
            (true, true) => SessionPhase::AttemptInFlight,
        }
    }

    pub fn attempt(&self) -> Option<&TransportHandle> {
        self.attempt.as_ref()
    }

    pub fn set_attempt(&mut self, handle: TransportHandle) {
        self.attempt = Some(handle);
    }

    pub fn take_attempt(&mut self) -> Option<TransportHandle> {
        self.attempt.take()
    }

    pub fn launch_failures(&self) -> u32 {
        self.launch_failures
    }

    pub fn record_launch_failure(&mut self) {
        self.launch_failures = self.launch_failures.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> RebootPolicy {
        RebootPolicy::default()
    }

    #[rstest]
    #[case(false, true, Step::Abandon(AbandonReason::InstanceGone))]
    #[case(false, false, Step::Abandon(AbandonReason::InstanceGone))]
    #[case(true, false, Step::Abandon(AbandonReason::NoLongerRebooting))]
    #[case(true, true, Step::StartAttempt { recheck_after: Duration::from_secs(5) })]
    fn test_idle_tick(#[case] alive: bool, #[case] still_rebooting: bool, #[case] expected: Step) {
        let observation = Observation::Idle {
            alive,
            still_rebooting,
        };
        assert_eq!(policy().next_step(&observation, 0), expected);
    }

    #[test]
    fn test_pending_attempt_rechecks_soon() {
        assert_eq!(
            policy().next_step(&Observation::AttemptPending, 0),
            Step::Recheck {
                after: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_channel_present_is_online() {
        let observation = Observation::AttemptFinished {
            channel_present: true,
            cause: Some(OfflineCause::launch_failed("stale")),
        };
        assert_eq!(policy().next_step(&observation, 0), Step::Online);
    }

    #[test]
    fn test_launch_failure_backs_off_with_initial_delay() {
        let observation = Observation::AttemptFinished {
            channel_present: false,
            cause: Some(OfflineCause::launch_failed("ssh refused")),
        };
        assert_eq!(
            policy().next_step(&observation, 7),
            Step::RetryLaunch {
                after: Duration::from_secs(30)
            }
        );
    }

    #[rstest]
    #[case(None)]
    #[case(Some(OfflineCause::UserRequested { reason: "maintenance".into() }))]
    #[case(Some(OfflineCause::ChannelTerminated { reason: "eof".into() }))]
    #[case(Some(OfflineCause::reboot(1)))]
    fn test_other_failures_abandon(#[case] cause: Option<OfflineCause>) {
        let observation = Observation::AttemptFinished {
            channel_present: false,
            cause: cause.clone(),
        };
        assert_eq!(
            policy().next_step(&observation, 0),
            Step::Abandon(AbandonReason::NonRetryable(cause))
        );
    }

    #[test]
    fn test_launch_budget() {
        let policy = RebootPolicy {
            max_launch_failures: Some(3),
            ..RebootPolicy::default()
        };
        let observation = Observation::AttemptFinished {
            channel_present: false,
            cause: Some(OfflineCause::launch_failed("ssh refused")),
        };
        assert!(matches!(policy.next_step(&observation, 1), Step::RetryLaunch { .. }));
        assert_eq!(
            policy.next_step(&observation, 2),
            Step::Abandon(AbandonReason::LaunchBudgetExhausted { failures: 3 })
        );
    }

    #[test]
    fn test_session_generations() {
        let mut session = RebootSession::default();
        assert_eq!(session.phase(), SessionPhase::NoSession);

        let first = session.begin();
        assert!(session.is_current(first));
        assert_eq!(session.phase(), SessionPhase::AwaitingReboot);

        session.set_attempt(TransportHandle::completed(Ok(())));
        assert_eq!(session.phase(), SessionPhase::AttemptInFlight);

        let second = session.begin();
        assert!(!session.is_current(first));
        assert!(session.is_current(second));
        assert_eq!(session.phase(), SessionPhase::AwaitingReboot);

        session.end();
        assert!(!session.is_current(second));
        assert_eq!(session.phase(), SessionPhase::NoSession);
    }

    #[tokio::test]
    async fn test_superseded_attempt_is_aborted() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut session = RebootSession::default();
        session.begin();
        session.set_attempt(TransportHandle::spawn(async move {
            let _held = tx;
            std::future::pending::<()>().await;
            Ok(())
        }));

        session.begin();

        // The aborted task drops its sender without sending.
        assert!(rx.await.is_err());
        assert_eq!(session.phase(), SessionPhase::AwaitingReboot);
    }
}
