//! EC2 build agent lifecycle service.
//!
//! Runs the lifecycle controller for one agent node:
//!
//! - **Definition**: loaded from the TOML file named by `EC2_AGENT_DEFINITION`
//! - **Tags**: the definition's tags are pushed to the instance at startup
//! - **Idle Watchdog**: stops or terminates the instance once it idles out
//! - **Cloud / Endpoint**: in-memory collaborators until a provider client is wired in

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ec2_agent_lifecycle::idle::{self, WatchdogExit};
use ec2_agent_lifecycle::{
    AgentDefinition, Config, InstanceSnapshot, LifecycleController, MockCloud, MockEndpoint,
    TokioScheduler,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting EC2 agent lifecycle service");

    let definition = AgentDefinition::load(&config.definition_path)?;
    info!(
        node = %definition.name,
        cloud = %config.cloud_name,
        kind = definition.instance_kind().label(),
        definition = %config.definition_path.display(),
        "Configuration loaded"
    );

    // In-memory provider seeded with the node's instance
    let cloud = Arc::new(MockCloud::new());
    if let Some(instance_id) = definition.instance_kind().resolve_current_instance_id() {
        cloud.insert_instance(InstanceSnapshot::running(instance_id.clone()));
    }
    let endpoint = Arc::new(MockEndpoint::connected(definition.name.clone()));

    let controller = LifecycleController::new(
        definition,
        cloud,
        endpoint,
        Arc::new(TokioScheduler),
        config.controller.clone(),
    );

    match controller.push_tags().await {
        Ok(outcome) => info!(outcome = ?outcome, "Initial tags pushed"),
        Err(e) => warn!(error = %e, retryable = e.is_retryable(), "Failed to push initial tags"),
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watchdog_handle = tokio::spawn(idle::run_idle_watchdog(
        controller.clone(),
        config.idle_check_interval,
        shutdown_rx,
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = watchdog_handle => {
            match result {
                Ok(WatchdogExit::Retired) => info!("Node retired, nothing left to manage"),
                Ok(WatchdogExit::Shutdown) => info!("Idle watchdog exited"),
                Err(e) => error!(error = %e, "Idle watchdog task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("EC2 agent lifecycle service shutdown complete");
    Ok(())
}
