//! Idle watchdog loop.
//!
//! Checks the node on an interval and stops or terminates its instance once
//! it has been idle longer than the definition allows. The threshold is read
//! on every tick, so a reconfiguration takes effect without a restart.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::lifecycle::{IdleAction, LifecycleController};

/// Why the watchdog returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    Shutdown,
    /// The node was retired (e.g. its instance was terminated).
    Retired,
}

/// Run the idle watchdog until shutdown or retirement.
pub async fn run_idle_watchdog(
    controller: LifecycleController,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> WatchdogExit {
    info!(
        node = %controller.name(),
        interval_secs = interval.as_secs(),
        "Starting idle watchdog"
    );

    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                if controller.is_retired() {
                    info!(node = %controller.name(), "Node retired, idle watchdog exiting");
                    return WatchdogExit::Retired;
                }

                let Some(limit) = controller.idle_termination().await else {
                    continue;
                };
                let idle = controller.idle_for();
                if idle < limit {
                    debug!(node = %controller.name(), idle_secs = idle.as_secs(), "Node busy or within idle limit");
                    continue;
                }

                let action = controller.idle_timeout().await;
                info!(node = %controller.name(), action = ?action, "Idle timeout handled");
                match action {
                    IdleAction::Terminated { accepted: true } => {
                        return WatchdogExit::Retired;
                    }
                    _ => controller.record_activity(),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(node = %controller.name(), "Idle watchdog shutting down");
                    return WatchdogExit::Shutdown;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ec2_agent_id::InstanceId;

    use crate::cloud::{CloudOperation, InstanceSnapshot, InstanceState, MockCloud};
    use crate::config::ControllerSettings;
    use crate::definition::{AgentDefinition, IdleMinutes};
    use crate::endpoint::MockEndpoint;
    use crate::scheduler::ManualScheduler;

    fn instance_id() -> InstanceId {
        "i-0abc123def4567890".parse().unwrap()
    }

    fn controller(definition: AgentDefinition) -> (Arc<MockCloud>, LifecycleController) {
        let cloud = Arc::new(MockCloud::with_instance(InstanceSnapshot::running(instance_id())));
        let controller = LifecycleController::new(
            definition,
            cloud.clone(),
            Arc::new(MockEndpoint::connected("agent-1")),
            Arc::new(ManualScheduler::new()),
            ControllerSettings::default(),
        );
        (cloud, controller)
    }

    fn idle_after(minutes: i64, stop_on_terminate: bool) -> AgentDefinition {
        let mut definition = AgentDefinition::on_demand("agent-1", instance_id());
        definition.idle_termination_minutes = Some(IdleMinutes::Minutes(minutes));
        definition.stop_on_terminate = stop_on_terminate;
        definition
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_node_is_terminated_and_retired() {
        let (cloud, controller) = controller(idle_after(5, false));
        let (_tx, rx) = watch::channel(false);

        let exit = run_idle_watchdog(controller.clone(), Duration::from_secs(60), rx).await;

        assert_eq!(exit, WatchdogExit::Retired);
        assert!(controller.is_retired());
        assert_eq!(cloud.call_count(CloudOperation::Terminate), 1);
        assert_eq!(
            cloud.instance(&instance_id()).unwrap().state,
            InstanceState::Terminated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_node_is_stopped_once_per_idle_period() {
        let (cloud, controller) = controller(idle_after(5, true));
        let (tx, rx) = watch::channel(false);
        let watchdog = tokio::spawn(run_idle_watchdog(controller.clone(), Duration::from_secs(60), rx));

        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        tx.send(true).unwrap();

        assert_eq!(watchdog.await.unwrap(), WatchdogExit::Shutdown);
        assert_eq!(cloud.call_count(CloudOperation::Stop), 1);
        assert_eq!(cloud.call_count(CloudOperation::Terminate), 0);
        assert!(!controller.is_retired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_idle_termination_never_acts() {
        let (cloud, controller) = controller(idle_after(0, false));
        let (tx, rx) = watch::channel(false);
        let watchdog = tokio::spawn(run_idle_watchdog(controller, Duration::from_secs(60), rx));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        tx.send(true).unwrap();

        assert_eq!(watchdog.await.unwrap(), WatchdogExit::Shutdown);
        assert_eq!(cloud.total_calls(), 0);
    }
}
