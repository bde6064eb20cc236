//! EC2 build agent lifecycle controller.
//!
//! Tracks and drives the lifecycle of a build agent node whose instance lives
//! in a cloud provider. The provider is the authority on instance state; the
//! controller keeps a time-bounded cached view of it and issues reboot, stop,
//! terminate and tag commands.
//!
//! ## Architecture
//!
//! ```text
//! LifecycleController
//! ├── RemoteStateCache       (cached describe, freshness window)
//! ├── TagSynchronizer        (whole-set tag clear/push)
//! ├── ConnectionSupervisor   (agent channel, disconnect)
//! └── reboot monitor         (scheduled ticks, RebootPolicy)
//! ```
//!
//! ## Modules
//!
//! - `cloud`: provider interface and the in-memory `MockCloud`
//! - `endpoint`: agent channel interface, offline causes, `MockEndpoint`
//! - `scheduler`: delayed-task scheduling (tokio and manual)
//! - `idle`: idle watchdog loop

pub mod cache;
pub mod cloud;
pub mod config;
pub mod connection;
pub mod definition;
pub mod endpoint;
pub mod error;
pub mod idle;
pub mod kind;
pub mod lifecycle;
pub mod scheduler;
pub mod tags;

// Re-export commonly used types
pub use cache::{CacheConfig, RemoteStateCache};
pub use cloud::{CloudApi, CloudError, InstanceSnapshot, InstanceState, MockCloud, Tag};
pub use config::{Config, ControllerSettings};
pub use definition::AgentDefinition;
pub use endpoint::{AgentEndpoint, MockEndpoint, OfflineCause, TransportError, TransportHandle};
pub use error::LifecycleError;
pub use kind::InstanceKind;
pub use lifecycle::{IdleAction, LifecycleController, RebootPolicy, SessionPhase, TickOutcome};
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
