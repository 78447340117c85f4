use crate::{config::KafkaConfig, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A fully addressed message, ready to hand to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Queue id of the event this message carries.
    pub event_id: i64,
    pub topic: String,
    pub partition: i32,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Broker acknowledgement for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub partition: i32,
    pub offset: i64,
}

/// Publishing side of a broker client.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publishes one message and resolves once the broker confirms it.
    async fn publish(&self, message: &OutboundMessage) -> Result<DeliveryReport>;

    /// Waits up to `timeout` for outstanding messages; returns how many are
    /// still pending afterwards.
    async fn flush(&self, timeout: Duration) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

/// Topic metadata lookup, used for partition assignment.
#[async_trait]
pub trait TopicMetadata: Send + Sync {
    /// Number of partitions of `topic`. Fails with [`Error::Metadata`] when
    /// the broker does not know the topic.
    async fn partition_count(&self, topic: &str, timeout: Duration) -> Result<i32>;
}

#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    message_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "pg-relay".to_string());

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", &client_id)
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("message.timeout.ms", config.message_timeout_ms.to_string());

        if let Some(protocol) = &config.security_protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &config.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &config.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(password) = &config.sasl_password {
            client_config.set("sasl.password", password);
        }

        let producer: FutureProducer = client_config.create()?;
        info!(brokers = %config.brokers.join(","), %client_id, "Kafka producer created");

        Ok(Self {
            producer,
            message_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn publish(&self, message: &OutboundMessage) -> Result<DeliveryReport> {
        let record = FutureRecord::to(&message.topic)
            .payload(message.payload.as_slice())
            .key(message.key.as_slice())
            .partition(message.partition)
            .timestamp(message.timestamp.timestamp_millis());

        match self.producer.send(record, Timeout::After(self.message_timeout)).await {
            Ok((partition, offset)) => Ok(DeliveryReport { partition, offset }),
            Err((e, _)) => Err(Error::Delivery {
                event_id: message.event_id,
                topic: message.topic.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<usize> {
        let producer = self.producer.clone();
        let pending = tokio::task::spawn_blocking(move || {
            if let Err(e) = producer.flush(Timeout::After(timeout)) {
                warn!("Producer flush did not complete: {}", e);
            }
            producer.in_flight_count().max(0) as usize
        })
        .await?;
        Ok(pending)
    }

    async fn close(&self) -> Result<()> {
        // librdkafka tears the client down when the last handle is dropped.
        let pending = self.producer.in_flight_count();
        if pending > 0 {
            warn!(pending, "Closing producer with undelivered messages");
        } else {
            info!("Kafka producer closed");
        }
        Ok(())
    }
}

#[async_trait]
impl TopicMetadata for KafkaProducer {
    async fn partition_count(&self, topic: &str, timeout: Duration) -> Result<i32> {
        let producer = self.producer.clone();
        let topic = topic.to_string();

        tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
                .map_err(|e| Error::Metadata {
                    topic: topic.clone(),
                    message: format!("failed to fetch topic metadata: {}", e),
                })?;

            let partitions = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic && t.error().is_none())
                .map(|t| t.partitions().len())
                .unwrap_or(0);

            if partitions == 0 {
                return Err(Error::Metadata {
                    topic: topic.clone(),
                    message: "no such topic found".to_string(),
                });
            }

            debug!(%topic, partitions, "Fetched topic metadata");
            Ok(partitions as i32)
        })
        .await?
    }
}

/// Logs what would be published instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunProducer;

#[async_trait]
impl Producer for DryRunProducer {
    async fn publish(&self, message: &OutboundMessage) -> Result<DeliveryReport> {
        info!(
            event_id = message.event_id,
            topic = %message.topic,
            partition = message.partition,
            key = %String::from_utf8_lossy(&message.key),
            payload = %String::from_utf8_lossy(&message.payload),
            timestamp = %message.timestamp,
            "Dry run: would publish message"
        );
        Ok(DeliveryReport {
            partition: message.partition,
            offset: -1,
        })
    }

    async fn flush(&self, _timeout: Duration) -> Result<usize> {
        Ok(0)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kafka_config() -> KafkaConfig {
        let brokers =
            std::env::var("TEST_KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
        KafkaConfig {
            brokers: brokers.split(',').map(str::to_string).collect(),
            topic_namespace: None,
            client_id: Some("pg-relay-test".to_string()),
            compression: "none".to_string(),
            acks: "1".to_string(),
            message_timeout_ms: 1_000,
            metadata_timeout_secs: 1,
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }

    #[tokio::test]
    async fn test_dry_run_reports_success_without_offset() {
        let message = OutboundMessage {
            event_id: 1,
            topic: "shop.users".to_string(),
            partition: 2,
            key: b"u-1".to_vec(),
            payload: br#"{"statement":"INSERT"}"#.to_vec(),
            timestamp: Utc::now(),
        };

        let report = DryRunProducer.publish(&message).await.unwrap();
        assert_eq!(report, DeliveryReport { partition: 2, offset: -1 });
        assert_eq!(DryRunProducer.flush(Duration::from_secs(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore] // May fail if system has specific network configurations
    async fn test_producer_creation() {
        let config = test_kafka_config();
        // Creating the client does not contact the brokers.
        assert!(KafkaProducer::new(&config).is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires running Kafka
    async fn test_unknown_topic_metadata() {
        let config = test_kafka_config();
        let producer = KafkaProducer::new(&config).unwrap();

        let result = producer
            .partition_count("pg-relay-does-not-exist", Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(Error::Metadata { .. })));
    }
}
