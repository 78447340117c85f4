pub mod partitioner;
pub mod producer;
pub mod serializer;

pub use partitioner::{fnv1a_32, partition_for_hash, HashPartitioner, METADATA_TIMEOUT};
pub use producer::{
    DeliveryReport, DryRunProducer, KafkaProducer, OutboundMessage, Producer, TopicMetadata,
};
pub use serializer::JsonSerializer;
