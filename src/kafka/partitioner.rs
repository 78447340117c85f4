use crate::kafka::producer::TopicMetadata;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Default bound on a partition-count lookup.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// 32-bit FNV-1a. An empty key hashes to the offset basis.
pub fn fnv1a_32(key: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    key.iter()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(PRIME))
}

/// Maps a hash onto `[0, partition_count)`.
///
/// The hash is reinterpreted as signed before the remainder is taken, and a
/// negative remainder is folded back by its absolute value, so keys land on
/// the same partitions as other producers using this scheme.
pub fn partition_for_hash(hash: u32, partition_count: i32) -> i32 {
    debug_assert!(partition_count > 0);
    ((hash as i32) % partition_count).abs()
}

/// Assigns partitions by key hash, caching each topic's partition count for
/// the lifetime of the process.
pub struct HashPartitioner {
    metadata: Arc<dyn TopicMetadata>,
    partitions: Mutex<HashMap<String, i32>>,
    timeout: Duration,
}

impl HashPartitioner {
    pub fn new(metadata: Arc<dyn TopicMetadata>) -> Self {
        Self::with_timeout(metadata, METADATA_TIMEOUT)
    }

    pub fn with_timeout(metadata: Arc<dyn TopicMetadata>, timeout: Duration) -> Self {
        Self {
            metadata,
            partitions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Partition for `key` on `topic`. All empty keys of a topic share one
    /// partition.
    pub async fn assign(&self, topic: &str, key: &[u8]) -> Result<i32> {
        let count = self.partition_count(topic).await?;
        Ok(partition_for_hash(fnv1a_32(key), count))
    }

    #[instrument(skip(self))]
    pub async fn partition_count(&self, topic: &str) -> Result<i32> {
        // Held across the lookup so concurrent first requests for a topic
        // result in a single metadata call.
        let mut partitions = self.partitions.lock().await;
        if let Some(count) = partitions.get(topic) {
            return Ok(*count);
        }

        let count = tokio::time::timeout(
            self.timeout,
            self.metadata.partition_count(topic, self.timeout),
        )
        .await
        .map_err(|_| Error::Metadata {
            topic: topic.to_string(),
            message: format!("metadata lookup timed out after {:?}", self.timeout),
        })??;

        if count <= 0 {
            return Err(Error::Metadata {
                topic: topic.to_string(),
                message: format!("invalid partition count {}", count),
            });
        }

        debug!(topic, count, "Caching partition count");
        partitions.insert(topic.to_string(), count);
        Ok(count)
    }
}
