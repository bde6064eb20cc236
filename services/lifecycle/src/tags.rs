//! Tag synchronization between the agent definition and the provider.
//!
//! Synchronization is whole-set: `clear` deletes every local tag from the
//! instance and `push` creates or overwrites every local tag. There is no
//! diffing against the provider's copy. Both resolve the instance with a
//! fresh describe call so they act on provider truth at call time.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::RemoteStateCache;
use crate::cloud::Tag;
use crate::error::LifecycleError;

/// Result of a tag operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSyncOutcome {
    /// The local tag set was empty; no provider call was made.
    Skipped,
    /// A batch of `count` tags was submitted.
    Applied { count: usize },
}

#[derive(Debug, Clone, Copy)]
enum TagOp {
    Clear,
    Push,
}

/// Pushes and clears local tags on the instance tracked by a cache.
pub struct TagSynchronizer {
    cache: Arc<RemoteStateCache>,
}

impl TagSynchronizer {
    pub fn new(cache: Arc<RemoteStateCache>) -> Self {
        Self { cache }
    }

    /// Delete the given tags from the current instance.
    pub async fn clear(&self, tags: &[Tag]) -> Result<TagSyncOutcome, LifecycleError> {
        self.apply(TagOp::Clear, tags).await
    }

    /// Create or overwrite the given tags on the current instance.
    pub async fn push(&self, tags: &[Tag]) -> Result<TagSyncOutcome, LifecycleError> {
        self.apply(TagOp::Push, tags).await
    }

    async fn apply(&self, op: TagOp, tags: &[Tag]) -> Result<TagSyncOutcome, LifecycleError> {
        if tags.is_empty() {
            debug!(op = ?op, "No local tags, nothing to synchronize");
            return Ok(TagSyncOutcome::Skipped);
        }

        let Some(instance) = self.cache.describe_current().await? else {
            let missing = self.cache.instance_id().await.map(|id| id.to_string());
            return Err(LifecycleError::InstanceNotFound(missing.unwrap_or_default()));
        };

        let batch: Vec<Tag> = tags
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let cloud = self.cache.cloud();
        match op {
            TagOp::Clear => cloud.delete_tags(&instance.instance_id, &batch).await?,
            TagOp::Push => cloud.create_tags(&instance.instance_id, &batch).await?,
        }

        info!(
            instance_id = %instance.instance_id,
            op = ?op,
            count = batch.len(),
            "Synchronized tags"
        );
        Ok(TagSyncOutcome::Applied { count: batch.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::cloud::{CloudApi, CloudError, CloudOperation, InstanceSnapshot, MockCloud};
    use crate::kind::InstanceKind;
    use ec2_agent_id::InstanceId;

    fn instance_id() -> InstanceId {
        "i-0abc123def4567890".parse().unwrap()
    }

    fn synchronizer(cloud: &Arc<MockCloud>) -> TagSynchronizer {
        let api: Arc<dyn CloudApi> = cloud.clone();
        let cache = RemoteStateCache::new(
            InstanceKind::on_demand(instance_id()),
            api,
            CacheConfig::default(),
        );
        TagSynchronizer::new(Arc::new(cache))
    }

    fn tags() -> Vec<Tag> {
        vec![Tag::new("team", "ci"), Tag::new("os", "linux")]
    }

    #[tokio::test]
    async fn test_empty_tag_set_makes_no_calls() {
        let cloud = Arc::new(MockCloud::with_instance(InstanceSnapshot::running(instance_id())));
        let sync = synchronizer(&cloud);

        assert_eq!(sync.clear(&[]).await.unwrap(), TagSyncOutcome::Skipped);
        assert_eq!(sync.push(&[]).await.unwrap(), TagSyncOutcome::Skipped);
        assert_eq!(cloud.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_push_then_clear() {
        let cloud = Arc::new(MockCloud::with_instance(InstanceSnapshot::running(instance_id())));
        let sync = synchronizer(&cloud);

        assert_eq!(
            sync.push(&tags()).await.unwrap(),
            TagSyncOutcome::Applied { count: 2 }
        );
        assert_eq!(cloud.tags_of(&instance_id()).len(), 2);

        sync.clear(&tags()).await.unwrap();
        assert!(cloud.tags_of(&instance_id()).is_empty());
    }

    #[tokio::test]
    async fn test_every_operation_describes_fresh() {
        let cloud = Arc::new(MockCloud::with_instance(InstanceSnapshot::running(instance_id())));
        let sync = synchronizer(&cloud);

        sync.push(&tags()).await.unwrap();
        sync.push(&tags()).await.unwrap();
        assert_eq!(cloud.call_count(CloudOperation::Describe), 2);
    }

    #[tokio::test]
    async fn test_duplicate_tags_are_submitted_once() {
        let cloud = Arc::new(MockCloud::with_instance(InstanceSnapshot::running(instance_id())));
        let sync = synchronizer(&cloud);

        let outcome = sync
            .push(&[Tag::new("team", "ci"), Tag::new("team", "ci")])
            .await
            .unwrap();
        assert_eq!(outcome, TagSyncOutcome::Applied { count: 1 });
    }

    #[tokio::test]
    async fn test_missing_instance_is_reported() {
        let cloud = Arc::new(MockCloud::new());
        let sync = synchronizer(&cloud);

        let err = sync.push(&tags()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InstanceNotFound(_)));
        assert_eq!(cloud.call_count(CloudOperation::CreateTags), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_propagates_as_retryable() {
        let cloud = Arc::new(MockCloud::with_instance(InstanceSnapshot::running(instance_id())));
        cloud.fail_next(
            CloudOperation::CreateTags,
            CloudError::communication("create_tags", "connection reset"),
        );
        let sync = synchronizer(&cloud);

        let err = sync.push(&tags()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cloud.call_count(CloudOperation::CreateTags), 1);
    }
}
