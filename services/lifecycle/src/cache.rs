//! Time-bounded cache of one instance's provider-reported state.
//!
//! Much of the instance data is beyond our control (someone may terminate the
//! instance or retag it), so it is re-fetched once the freshness window has
//! passed. Every derived query goes through [`RemoteStateCache::fetch`] so the
//! staleness rules apply uniformly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ec2_agent_id::InstanceId;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cloud::{CloudApi, CloudError, InstanceSnapshot};
use crate::error::LifecycleError;
use crate::kind::InstanceKind;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum age at which a fetched snapshot is reused.
    pub freshness: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(20),
        }
    }
}

/// The last fetch result and when it was taken.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    /// `None` means "not found" or "never fetched".
    pub snapshot: Option<Arc<InstanceSnapshot>>,
    /// Time of the last successful fetch.
    pub fetched_at: Option<Instant>,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        self.fetched_at
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }
}

struct CacheState {
    kind: InstanceKind,
    entry: CacheEntry,
}

/// Cached view of the provider instance backing one node.
pub struct RemoteStateCache {
    cloud: Arc<dyn CloudApi>,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl RemoteStateCache {
    pub fn new(kind: InstanceKind, cloud: Arc<dyn CloudApi>, config: CacheConfig) -> Self {
        Self {
            cloud,
            config,
            state: Mutex::new(CacheState {
                kind,
                entry: CacheEntry::default(),
            }),
        }
    }

    pub fn cloud(&self) -> &Arc<dyn CloudApi> {
        &self.cloud
    }

    pub async fn kind(&self) -> InstanceKind {
        self.state.lock().await.kind.clone()
    }

    pub async fn instance_id(&self) -> Option<InstanceId> {
        self.state
            .lock()
            .await
            .kind
            .resolve_current_instance_id()
            .cloned()
    }

    /// Copy of the current cache entry.
    pub async fn entry(&self) -> CacheEntry {
        self.state.lock().await.entry.clone()
    }

    /// Bind the node to a (new) instance. A change drops the cached snapshot.
    pub async fn assign_instance_id(&self, instance_id: InstanceId) -> bool {
        let mut state = self.state.lock().await;
        let changed = state.kind.assign_instance_id(instance_id);
        if changed {
            state.entry = CacheEntry::default();
        }
        changed
    }

    /// Return the cached snapshot, refreshing it from the provider when it is
    /// stale or `force` is set.
    ///
    /// Without an instance id nothing is fetched and the cache is left alone.
    /// A failed fetch keeps the previous snapshot and does not count as a
    /// fetch, so the next call retries.
    pub async fn fetch(&self, force: bool) -> Option<Arc<InstanceSnapshot>> {
        let mut state = self.state.lock().await;

        let Some(instance_id) = state.kind.resolve_current_instance_id().cloned() else {
            debug!("No instance id assigned yet, skipping fetch");
            return state.entry.snapshot.clone();
        };

        if !force && state.entry.is_fresh(Instant::now(), self.config.freshness) {
            return state.entry.snapshot.clone();
        }

        match self.describe(&instance_id).await {
            Ok(found) => {
                debug!(
                    instance_id = %instance_id,
                    found = found.is_some(),
                    force,
                    "Refreshed instance data"
                );
                state.entry = CacheEntry {
                    snapshot: found.map(Arc::new),
                    fetched_at: Some(Instant::now()),
                };
            }
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Failed to fetch instance");
            }
        }

        state.entry.snapshot.clone()
    }

    /// Fetch the current instance straight from the provider, bypassing and
    /// not updating the cache.
    pub async fn describe_current(&self) -> Result<Option<InstanceSnapshot>, LifecycleError> {
        let (instance_id, kind) = {
            let state = self.state.lock().await;
            (
                state.kind.resolve_current_instance_id().cloned(),
                state.kind.label(),
            )
        };
        let instance_id =
            instance_id.ok_or_else(|| LifecycleError::NoInstanceId(kind.to_string()))?;
        Ok(self.describe(&instance_id).await?)
    }

    async fn describe(&self, instance_id: &InstanceId) -> Result<Option<InstanceSnapshot>, CloudError> {
        let found = self
            .cloud
            .describe_instances(std::slice::from_ref(instance_id))
            .await?;
        Ok(found.into_iter().next())
    }

    // -------------------------------------------------------------------------
    // Derived Queries
    // -------------------------------------------------------------------------

    /// Alive iff the provider reports the instance and it is not terminated.
    pub async fn is_alive(&self, force: bool) -> bool {
        self.fetch(force)
            .await
            .is_some_and(|snapshot| snapshot.is_alive())
    }

    pub async fn public_dns(&self) -> Option<String> {
        self.fetch(false).await.and_then(|s| s.public_dns.clone())
    }

    pub async fn private_address(&self) -> Option<String> {
        self.fetch(false).await.and_then(|s| s.private_ip.clone())
    }

    pub async fn launch_time(&self) -> Option<DateTime<Utc>> {
        self.fetch(false).await.map(|s| s.launch_time)
    }

    /// Tags as the provider last reported them.
    pub async fn tags(&self) -> BTreeMap<String, String> {
        self.fetch(false)
            .await
            .map(|s| s.tags.clone())
            .unwrap_or_default()
    }
}
