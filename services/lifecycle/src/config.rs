//! Configuration for the agent lifecycle service.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::cache::CacheConfig;
use crate::lifecycle::RebootPolicy;

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the agent definition TOML.
    pub definition_path: PathBuf,

    /// Name of the cloud the agent belongs to.
    pub cloud_name: String,

    /// How often the idle watchdog checks the node.
    pub idle_check_interval: Duration,

    /// Cache and reboot monitor timings.
    pub controller: ControllerSettings,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Timing knobs of one node's controller.
#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    pub cache: CacheConfig,
    pub reboot: RebootPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let definition_path = lookup("EC2_AGENT_DEFINITION")
            .map(PathBuf::from)
            .context("Missing agent definition. Set EC2_AGENT_DEFINITION to a TOML file.")?;

        let cloud_name = lookup("EC2_AGENT_CLOUD").unwrap_or_else(|| "default".to_string());

        let idle_check_secs = secs(&lookup, "EC2_AGENT_IDLE_CHECK_INTERVAL_SECS")?.unwrap_or(60);
        let idle_check_interval = Duration::from_secs(idle_check_secs.max(1));

        let mut controller = ControllerSettings::default();
        if let Some(freshness) = secs(&lookup, "EC2_AGENT_FRESHNESS_SECS")? {
            controller.cache.freshness = Duration::from_secs(freshness);
        }
        if let Some(initial) = secs(&lookup, "EC2_AGENT_REBOOT_INITIAL_DELAY_SECS")? {
            controller.reboot.initial_delay = Duration::from_secs(initial);
        }
        if let Some(recheck) = secs(&lookup, "EC2_AGENT_REBOOT_RECHECK_SECS")? {
            controller.reboot.pending_recheck = Duration::from_secs(recheck);
        }

        let log_level = lookup("EC2_AGENT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            definition_path,
            cloud_name,
            idle_check_interval,
            controller,
            log_level,
        })
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|v| v.trim().parse::<u64>())
        .transpose()
        .with_context(|| format!("{key} must be a non-negative integer (seconds)."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("EC2_AGENT_DEFINITION", "/etc/ec2-agent/agent.toml")]).unwrap();
        assert_eq!(config.definition_path, PathBuf::from("/etc/ec2-agent/agent.toml"));
        assert_eq!(config.cloud_name, "default");
        assert_eq!(config.idle_check_interval, Duration::from_secs(60));
        assert_eq!(config.controller.cache.freshness, Duration::from_secs(20));
        assert_eq!(config.controller.reboot.initial_delay, Duration::from_secs(30));
        assert_eq!(config.controller.reboot.pending_recheck, Duration::from_secs(5));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("EC2_AGENT_DEFINITION", "agent.toml"),
            ("EC2_AGENT_CLOUD", "us-east"),
            ("EC2_AGENT_IDLE_CHECK_INTERVAL_SECS", "0"),
            ("EC2_AGENT_FRESHNESS_SECS", "5"),
            ("EC2_AGENT_REBOOT_INITIAL_DELAY_SECS", "60"),
            ("EC2_AGENT_REBOOT_RECHECK_SECS", "2"),
        ])
        .unwrap();
        assert_eq!(config.cloud_name, "us-east");
        assert_eq!(config.idle_check_interval, Duration::from_secs(1));
        assert_eq!(config.controller.cache.freshness, Duration::from_secs(5));
        assert_eq!(config.controller.reboot.initial_delay, Duration::from_secs(60));
        assert_eq!(config.controller.reboot.pending_recheck, Duration::from_secs(2));
    }

    #[test]
    fn test_missing_definition_is_an_error() {
        assert!(load(&[]).is_err());
    }

    #[test]
    fn test_malformed_number_is_an_error() {
        let err = load(&[
            ("EC2_AGENT_DEFINITION", "agent.toml"),
            ("EC2_AGENT_FRESHNESS_SECS", "soon"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("EC2_AGENT_FRESHNESS_SECS"));
    }
}
