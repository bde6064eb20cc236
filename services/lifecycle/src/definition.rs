//! Agent definitions.
//!
//! An agent definition is the already-resolved, locally held configuration of
//! one build agent node: how it is reached, how it is sized, what tags it
//! carries, and what happens when it goes idle. It is loaded from TOML.
//!
//! ```toml
//! name = "build-linux-1"
//! description = "Linux build agent"
//! stop_on_terminate = true
//! idle_termination_minutes = 30
//!
//! [kind]
//! type = "on_demand"
//! instance_id = "i-0abc123def4567890"
//!
//! [[tags]]
//! name = "team"
//! value = "ci"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use ec2_agent_id::InstanceId;
use serde::{Deserialize, Serialize};

use crate::cloud::Tag;
use crate::kind::InstanceKind;

/// Idle termination setting as written by the user: a number of minutes or
/// free text (blank meaning "never").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdleMinutes {
    Minutes(i64),
    Text(String),
}

impl IdleMinutes {
    /// Positive minutes, if any.
    pub fn minutes(&self) -> Option<u64> {
        let minutes = match self {
            Self::Minutes(m) => *m,
            Self::Text(text) => text.trim().parse().ok()?,
        };
        u64::try_from(minutes).ok().filter(|m| *m > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Node name. Legacy definitions used the instance id as the name.
    pub name: String,

    /// Capacity model. Defaults to on-demand with no explicit instance id.
    #[serde(default)]
    pub kind: Option<InstanceKind>,

    #[serde(default)]
    pub description: String,

    /// Root directory of the agent's workspace on the instance.
    #[serde(default)]
    pub remote_fs: Option<String>,

    /// Configured executor count. When unset, derived from `instance_type`.
    #[serde(default)]
    pub num_executors: Option<u32>,

    /// Provider instance type, e.g. `m1.large`.
    #[serde(default)]
    pub instance_type: Option<String>,

    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default)]
    pub init_script: Option<String>,

    #[serde(default)]
    pub tmp_dir: Option<String>,

    #[serde(default)]
    pub remote_admin: Option<String>,

    #[serde(default)]
    pub jvm_opts: Option<String>,

    /// Stop rather than terminate the instance when it goes idle.
    #[serde(default)]
    pub stop_on_terminate: bool,

    #[serde(default)]
    pub reboot_after_build: bool,

    /// The agent runs as a long-lived process that must be asked to exit.
    #[serde(default)]
    pub long_lived_agent: bool,

    #[serde(default)]
    pub idle_termination_minutes: Option<IdleMinutes>,

    /// Connect over the private address instead of the public DNS name.
    #[serde(default)]
    pub use_private_dns_name: bool,

    #[serde(default)]
    pub use_dedicated_tenancy: bool,

    #[serde(default)]
    pub launch_timeout_secs: Option<u64>,

    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl AgentDefinition {
    /// A minimal on-demand definition for the given instance.
    pub fn on_demand(name: impl Into<String>, instance_id: InstanceId) -> Self {
        Self {
            name: name.into(),
            kind: Some(InstanceKind::on_demand(instance_id)),
            description: String::new(),
            remote_fs: None,
            num_executors: None,
            instance_type: None,
            labels: Vec::new(),
            init_script: None,
            tmp_dir: None,
            remote_admin: None,
            jvm_opts: None,
            stop_on_terminate: false,
            reboot_after_build: false,
            long_lived_agent: false,
            idle_termination_minutes: None,
            use_private_dns_name: false,
            use_dedicated_tenancy: false,
            launch_timeout_secs: None,
            tags: Vec::new(),
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("Invalid agent definition")
    }

    /// Load a definition from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read agent definition {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse agent definition {}", path.display()))
    }

    /// The instance kind, with the legacy fallback applied: an on-demand node
    /// without an explicit instance id is identified by its name.
    pub fn instance_kind(&self) -> InstanceKind {
        let mut kind = self.kind.clone().unwrap_or(InstanceKind::OnDemand { instance_id: None });
        if let InstanceKind::OnDemand { instance_id: None } = kind {
            if let Ok(legacy) = self.name.parse::<InstanceId>() {
                kind.assign_instance_id(legacy);
            }
        }
        kind
    }

    pub fn launch_timeout(&self) -> Option<Duration> {
        self.launch_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Idle time after which the node is stopped or terminated. `None` disables it.
    pub fn idle_termination(&self) -> Option<Duration> {
        self.idle_termination_minutes
            .as_ref()
            .and_then(IdleMinutes::minutes)
            .map(|m| Duration::from_secs(m.saturating_mul(60)))
    }

    pub fn remote_admin(&self) -> &str {
        match self.remote_admin.as_deref() {
            Some(admin) if !admin.trim().is_empty() => admin,
            _ => "root",
        }
    }

    pub fn jvm_opts(&self) -> &str {
        self.jvm_opts.as_deref().unwrap_or_default()
    }

    pub fn executors(&self) -> u32 {
        self.num_executors
            .filter(|n| *n > 0)
            .unwrap_or_else(|| suggested_executors(self.instance_type.as_deref().unwrap_or_default()))
    }
}

/// Default executor count for a provider instance type. Unknown types get 1.
pub fn suggested_executors(instance_type: &str) -> u32 {
    match instance_type {
        "t1.micro" | "m1.small" => 1,
        "m1.medium" => 2,
        "m1.large" => 4,
        "c1.medium" => 5,
        "m2.xlarge" => 6,
        "c3.large" => 7,
        "m1.xlarge" => 8,
        "m2.2xlarge" | "m3.xlarge" => 13,
        "c3.xlarge" => 14,
        "c1.xlarge" => 20,
        "m2.4xlarge" | "m3.2xlarge" | "g2.2xlarge" => 26,
        "c3.2xlarge" => 28,
        "cc1.4xlarge" | "cg1.4xlarge" => 33,
        "hi1.4xlarge" | "hs1.8xlarge" => 35,
        "c3.4xlarge" => 55,
        "cc2.8xlarge" | "cr1.8xlarge" => 88,
        "c3.8xlarge" => 108,
        _ => 1,
    }
}
