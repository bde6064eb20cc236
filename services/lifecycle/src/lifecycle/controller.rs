//! Lifecycle controller for one build agent node.
//!
//! Entry point for everything that changes the node's instance: reboot and
//! its reconnect monitor, stop, terminate, idle timeout, tag pushes and
//! reconfiguration. Collaborators are injected at construction.
//!
//! Concurrency model:
//! - The reboot session record sits behind one async mutex that a monitor
//!   tick holds for its whole read-decide-write sequence, so two ticks can
//!   never both start a reconnect attempt.
//! - The definition sits behind its own async mutex; tag operations and
//!   reconfiguration hold it, which serializes them per node.
//! - Scheduled ticks hold a weak reference. Once the controller is dropped
//!   or retired, pending ticks end the session quietly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ec2_agent_id::InstanceId;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::RemoteStateCache;
use crate::cloud::{CloudApi, InstanceSnapshot};
use crate::config::ControllerSettings;
use crate::connection::ConnectionSupervisor;
use crate::definition::AgentDefinition;
use crate::endpoint::{AgentEndpoint, OfflineCause};
use crate::error::LifecycleError;
use crate::kind::InstanceKind;
use crate::scheduler::Scheduler;
use crate::tags::{TagSyncOutcome, TagSynchronizer};

use super::reboot::{AbandonReason, Observation, RebootPolicy, RebootSession, SessionPhase, Step};

/// What one monitor tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tick belonged to a session that is no longer live.
    Superseded,
    /// A reconnect attempt was started.
    AttemptStarted,
    /// The attempt in flight is still pending.
    Pending,
    /// The node is back online; the session ended.
    Online,
    /// The attempt failed to launch; a fresh attempt is scheduled.
    RetryScheduled,
    /// The session ended without the node coming back.
    Abandoned(AbandonReason),
}

/// What an idle timeout did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    Stopped { accepted: bool },
    Terminated { accepted: bool },
}

struct NodeInner {
    name: String,
    definition: tokio::sync::Mutex<AgentDefinition>,
    cache: Arc<RemoteStateCache>,
    tags: TagSynchronizer,
    connection: ConnectionSupervisor,
    scheduler: Arc<dyn Scheduler>,
    policy: RebootPolicy,
    session: tokio::sync::Mutex<RebootSession>,
    retired: AtomicBool,
    last_activity: Mutex<Instant>,
}

/// Drives the lifecycle of one node. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<NodeInner>,
}

impl LifecycleController {
    pub fn new(
        definition: AgentDefinition,
        cloud: Arc<dyn CloudApi>,
        endpoint: Arc<dyn AgentEndpoint>,
        scheduler: Arc<dyn Scheduler>,
        settings: ControllerSettings,
    ) -> Self {
        let name = definition.name.clone();
        let cache = Arc::new(RemoteStateCache::new(
            definition.instance_kind(),
            cloud,
            settings.cache,
        ));
        let connection =
            ConnectionSupervisor::new(name.clone(), endpoint, definition.long_lived_agent);

        Self {
            inner: Arc::new(NodeInner {
                name,
                tags: TagSynchronizer::new(Arc::clone(&cache)),
                definition: tokio::sync::Mutex::new(definition),
                cache,
                connection,
                scheduler,
                policy: settings.reboot,
                session: tokio::sync::Mutex::new(RebootSession::default()),
                retired: AtomicBool::new(false),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn definition(&self) -> AgentDefinition {
        self.inner.definition.lock().await.clone()
    }

    pub async fn instance_id(&self) -> Option<InstanceId> {
        self.inner.cache.instance_id().await
    }

    pub async fn kind(&self) -> InstanceKind {
        self.inner.cache.kind().await
    }

    pub async fn fetch(&self, force: bool) -> Option<Arc<InstanceSnapshot>> {
        self.inner.cache.fetch(force).await
    }

    pub async fn is_alive(&self, force: bool) -> bool {
        self.inner.cache.is_alive(force).await
    }

    pub async fn public_dns(&self) -> Option<String> {
        self.inner.cache.public_dns().await
    }

    pub async fn private_address(&self) -> Option<String> {
        self.inner.cache.private_address().await
    }

    pub async fn launch_time(&self) -> Option<DateTime<Utc>> {
        self.inner.cache.launch_time().await
    }

    /// Address to connect the agent over: private or public per the definition.
    pub async fn connect_address(&self) -> Option<String> {
        let private = self.inner.definition.lock().await.use_private_dns_name;
        if private {
            self.private_address().await
        } else {
            self.public_dns().await
        }
    }

    pub async fn launch_timeout(&self) -> Option<Duration> {
        self.inner.definition.lock().await.launch_timeout()
    }

    pub async fn idle_termination(&self) -> Option<Duration> {
        self.inner.definition.lock().await.idle_termination()
    }

    pub fn is_channel_present(&self) -> bool {
        self.inner.connection.is_channel_present()
    }

    pub fn offline_cause(&self) -> Option<OfflineCause> {
        self.inner.connection.offline_cause()
    }

    pub async fn session_phase(&self) -> SessionPhase {
        self.inner.session.lock().await.phase()
    }

    // =========================================================================
    // Activity and Retirement
    // =========================================================================

    /// Note that the node did useful work just now.
    pub fn record_activity(&self) {
        *self.inner.last_activity() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity().elapsed()
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::SeqCst)
    }

    /// Remove the node from management. Pending monitor ticks abandon their
    /// session on their next run.
    pub fn retire(&self) {
        if self.inner.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connection.detach();
        info!(node = %self.inner.name, "Node retired");
    }

    /// Record that a pending spot request was fulfilled by `instance_id`.
    pub async fn assign_instance_id(&self, instance_id: InstanceId) -> bool {
        let changed = self.inner.cache.assign_instance_id(instance_id.clone()).await;
        if changed {
            info!(node = %self.inner.name, instance_id = %instance_id, "Instance assigned");
        }
        changed
    }

    // =========================================================================
    // Tags and Reconfiguration
    // =========================================================================

    pub async fn push_tags(&self) -> Result<TagSyncOutcome, LifecycleError> {
        let definition = self.inner.definition.lock().await;
        self.inner.tags.push(&definition.tags).await
    }

    pub async fn clear_tags(&self) -> Result<TagSyncOutcome, LifecycleError> {
        let definition = self.inner.definition.lock().await;
        self.inner.tags.clear(&definition.tags).await
    }

    /// Replace the agent definition.
    ///
    /// The old definition's tags are cleared before the new definition's are
    /// pushed. If the clear fails the old definition stays in place. A node
    /// without a live instance has no provider tags, so the definition is
    /// still replaced. The instance binding is not taken from the new
    /// definition; the node keeps tracking the instance it already has.
    pub async fn reconfigure(&self, mut new: AgentDefinition) -> Result<(), LifecycleError> {
        let mut definition = self.inner.definition.lock().await;
        match self.inner.tags.clear(&definition.tags).await {
            Err(e) if e.is_missing_instance() => {
                debug!(node = %self.inner.name, error = %e, "No live instance, no tags to clear");
            }
            result => {
                result?;
            }
        }

        new.kind = Some(self.inner.cache.kind().await);
        self.inner.connection.set_long_lived_agent(new.long_lived_agent);
        *definition = new;
        info!(node = %self.inner.name, "Agent definition replaced");

        match self.inner.tags.push(&definition.tags).await {
            Err(e) if e.is_missing_instance() => {
                debug!(node = %self.inner.name, error = %e, "No live instance, tags not pushed");
                Ok(())
            }
            result => result.map(|_| ()),
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Reboot the instance and start monitoring its reconnect. Returns the
    /// generation of the new reboot session.
    ///
    /// Provider failures are logged; the monitor runs regardless since the
    /// instance may reboot anyway.
    pub async fn reboot(&self) -> Result<u64, LifecycleError> {
        let inner = &self.inner;
        if self.is_retired() {
            return Err(LifecycleError::NodeRetired(inner.name.clone()));
        }

        // Held until the first tick is scheduled so concurrent reboots run one
        // after the other and the newest session owns the offline cause.
        let mut session = inner.session.lock().await;
        let generation = session.begin();
        let cause = OfflineCause::reboot(generation);
        info!(node = %inner.name, session = generation, "Preparing to reboot instance");

        inner.connection.take_offline(cause.clone());
        inner.connection.disconnect(Some(cause)).await;

        match inner.cache.instance_id().await {
            Some(instance_id) => match inner.cache.cloud().reboot_instance(&instance_id).await {
                Ok(()) => info!(node = %inner.name, instance_id = %instance_id, "Reboot request sent"),
                Err(e) => {
                    let current = inner.diagnostic().await;
                    warn!(
                        node = %inner.name,
                        instance_id = %instance_id,
                        error = %e,
                        current = %current,
                        "Failed to reboot instance"
                    );
                }
            },
            None => warn!(node = %inner.name, "No instance id assigned, reboot not sent"),
        }

        schedule_monitor(inner, generation, inner.policy.initial_delay);
        drop(session);
        Ok(generation)
    }

    /// Run one reconnect monitor tick for the given session.
    ///
    /// Normally invoked by the scheduler; exposed so callers can drive ticks
    /// directly.
    pub async fn run_monitor_tick(&self, generation: u64) -> TickOutcome {
        self.inner.monitor_tick(generation).await
    }

    /// Reboot if the definition asks for a reboot after every build.
    pub async fn on_build_complete(&self) -> Option<u64> {
        self.record_activity();
        let reboot = self.inner.definition.lock().await.reboot_after_build;
        if !reboot {
            return None;
        }
        match self.reboot().await {
            Ok(generation) => Some(generation),
            Err(e) => {
                debug!(node = %self.inner.name, error = %e, "Skipping reboot after build");
                None
            }
        }
    }

    /// Disconnect and stop the instance. Returns whether the provider
    /// accepted the stop.
    pub async fn stop(&self) -> bool {
        let inner = &self.inner;
        inner.connection.disconnect(None).await;

        let Some(instance_id) = inner.cache.instance_id().await else {
            warn!(node = %inner.name, "No instance id assigned, stop not sent");
            return false;
        };

        match inner.cache.cloud().stop_instance(&instance_id).await {
            Ok(()) => {
                info!(node = %inner.name, instance_id = %instance_id, "Stop request sent");
                inner.connection.teardown_channel(None).await;
                true
            }
            Err(e) => {
                let current = inner.diagnostic().await;
                warn!(
                    node = %inner.name,
                    instance_id = %instance_id,
                    error = %e,
                    current = %current,
                    "Failed to stop instance"
                );
                false
            }
        }
    }

    /// Disconnect and terminate the instance. Returns whether the provider
    /// accepted the terminate; it is not retried.
    pub async fn terminate_instance(&self) -> bool {
        let inner = &self.inner;
        inner.connection.disconnect(None).await;

        let Some(instance_id) = inner.cache.instance_id().await else {
            warn!(node = %inner.name, "No instance id assigned, terminate not sent");
            return false;
        };

        match inner.cache.cloud().terminate_instance(&instance_id).await {
            Ok(()) => {
                info!(node = %inner.name, instance_id = %instance_id, "Terminate request sent");
                true
            }
            Err(e) => {
                warn!(node = %inner.name, instance_id = %instance_id, error = %e, "Failed to terminate instance");
                false
            }
        }
    }

    /// Terminate the instance and retire the node once the provider accepts.
    pub async fn terminate(&self) -> bool {
        let accepted = self.terminate_instance().await;
        if accepted {
            self.retire();
        }
        accepted
    }

    /// Stop or terminate the instance after it went idle.
    pub async fn idle_timeout(&self) -> IdleAction {
        let stop_on_terminate = self.inner.definition.lock().await.stop_on_terminate;
        info!(node = %self.inner.name, stop_on_terminate, "Instance idle time expired");
        if stop_on_terminate {
            IdleAction::Stopped {
                accepted: self.stop().await,
            }
        } else {
            IdleAction::Terminated {
                accepted: self.terminate().await,
            }
        }
    }
}

// =============================================================================
// Reboot Monitor
// =============================================================================

fn schedule_monitor(inner: &Arc<NodeInner>, generation: u64, delay: Duration) {
    debug!(
        node = %inner.name,
        session = generation,
        delay_secs = delay.as_secs(),
        "Scheduling reboot monitor"
    );
    let node: Weak<NodeInner> = Arc::downgrade(inner);
    inner.scheduler.schedule_after(
        delay,
        Box::pin(async move {
            match node.upgrade() {
                Some(inner) => {
                    inner.monitor_tick(generation).await;
                }
                None => debug!(session = generation, "Node dropped, reboot monitor exits"),
            }
        }),
    );
}

impl NodeInner {
    fn last_activity(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Best-effort current provider view, for failure logs.
    async fn diagnostic(&self) -> String {
        match self.cache.describe_current().await {
            Ok(Some(snapshot)) => snapshot.diagnostic(),
            _ => String::new(),
        }
    }

    async fn monitor_tick(self: &Arc<Self>, generation: u64) -> TickOutcome {
        let mut session = self.session.lock().await;
        if !session.is_current(generation) {
            debug!(node = %self.name, session = generation, "Reboot session superseded");
            return TickOutcome::Superseded;
        }

        if self.retired.load(Ordering::SeqCst) {
            session.end();
            return self.abandon(generation, AbandonReason::NodeRetired);
        }
        if !self.connection.is_attached() {
            session.end();
            return self.abandon(generation, AbandonReason::EndpointGone);
        }

        let attempt_pending = session.attempt().map(|attempt| !attempt.is_finished());
        let observation = match attempt_pending {
            None => {
                let alive = self.cache.is_alive(true).await;
                let still_rebooting = self
                    .connection
                    .offline_cause()
                    .is_some_and(|cause| cause.is_reboot_for(generation));
                Observation::Idle {
                    alive,
                    still_rebooting,
                }
            }
            Some(true) => Observation::AttemptPending,
            Some(false) => {
                if let Some(attempt) = session.take_attempt() {
                    if let Err(e) = attempt.wait().await {
                        debug!(node = %self.name, error = %e, "Reconnect attempt failed");
                    }
                }
                Observation::AttemptFinished {
                    channel_present: self.connection.is_channel_present(),
                    cause: self.connection.offline_cause(),
                }
            }
        };

        match self.policy.next_step(&observation, session.launch_failures()) {
            Step::StartAttempt { recheck_after } => {
                let Some(attempt) = self.connection.connect(false) else {
                    session.end();
                    return self.abandon(generation, AbandonReason::EndpointGone);
                };
                info!(node = %self.name, session = generation, "Starting reboot reconnect");
                session.set_attempt(attempt);
                schedule_monitor(self, generation, recheck_after);
                TickOutcome::AttemptStarted
            }
            Step::Recheck { after } => {
                debug!(node = %self.name, session = generation, "Reconnect still pending");
                schedule_monitor(self, generation, after);
                TickOutcome::Pending
            }
            Step::Online => {
                self.connection.bring_online();
                session.end();
                info!(node = %self.name, session = generation, "Instance is back online");
                TickOutcome::Online
            }
            Step::RetryLaunch { after } => {
                // The failed attempt was taken above; the session holds no handle.
                session.record_launch_failure();
                warn!(
                    node = %self.name,
                    session = generation,
                    failures = session.launch_failures(),
                    cause = ?self.connection.offline_cause(),
                    "Reconnect launch attempt failed, will try later"
                );
                self.connection.take_offline(OfflineCause::reboot(generation));
                schedule_monitor(self, generation, after);
                TickOutcome::RetryScheduled
            }
            Step::Abandon(reason) => {
                session.end();
                self.abandon(generation, reason)
            }
        }
    }

    fn abandon(&self, generation: u64, reason: AbandonReason) -> TickOutcome {
        if reason.is_failure() {
            warn!(
                node = %self.name,
                session = generation,
                reason = %reason,
                "Reboot handling aborted"
            );
        } else {
            debug!(
                node = %self.name,
                session = generation,
                reason = %reason,
                "Reboot session ended"
            );
        }
        TickOutcome::Abandoned(reason)
    }
}
