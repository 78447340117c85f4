#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use pg_relay::kafka::{DeliveryReport, HashPartitioner, OutboundMessage, Producer, TopicMetadata};
use pg_relay::postgres::{Event, EventQueue, ExternalId, Statement, PAGE_SIZE};
use pg_relay::wake::{KeepalivePing, Notification, WakeSource};
use pg_relay::{Error, RelaySettings, Replicator, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Connection string for tests that need a live PostgreSQL.
pub fn test_postgres_url() -> String {
    let host = env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("TEST_PG_PORT").unwrap_or_else(|_| "5432".to_string());
    let database = env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string());
    let username = env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string());
    format!("postgres://{}:{}@{}:{}/{}", username, password, host, port, database)
}

/// Parsed form of [`test_postgres_url`].
pub fn test_postgres_config() -> tokio_postgres::Config {
    test_postgres_url().parse().unwrap()
}

#[derive(Default)]
struct QueueState {
    events: Vec<Event>,
    next_id: i64,
    fetches: usize,
    fail_mark_for: Option<i64>,
    already_processed: Option<i64>,
}

/// In-memory event queue with the same paging and marking rules as the table.
#[derive(Default)]
pub struct MemoryEventQueue {
    state: Mutex<QueueState>,
}

impl MemoryEventQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(
        &self,
        table: &str,
        statement: Statement,
        external_id: Option<&str>,
        data: Value,
        previous_data: Option<Value>,
    ) -> i64 {
        self.push_raw(table, statement, external_id.map(ExternalId::from), data, previous_data)
    }

    pub fn push_raw(
        &self,
        table: &str,
        statement: Statement,
        external_id: Option<ExternalId>,
        data: Value,
        previous_data: Option<Value>,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.events.push(Event {
            id,
            uuid: format!("00000000-0000-4000-8000-{:012}", id),
            external_id,
            table_name: table.to_string(),
            statement,
            data,
            previous_data,
            created_at: base_time() + ChronoDuration::milliseconds(id),
            processed: false,
        });
        id
    }

    pub fn fail_mark_for(&self, id: i64) {
        self.state.lock().unwrap().fail_mark_for = Some(id);
    }

    /// Makes `mark_processed(id)` report the row as already processed, as
    /// if another relay got there first.
    pub fn report_already_processed(&self, id: i64) {
        self.state.lock().unwrap().already_processed = Some(id);
    }

    pub fn is_processed(&self, id: i64) -> bool {
        let state = self.state.lock().unwrap();
        state.events.iter().any(|e| e.id == id && e.processed)
    }

    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.events.iter().filter(|e| !e.processed).count()
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub fn event(&self, id: i64) -> Event {
        let state = self.state.lock().unwrap();
        state.events.iter().find(|e| e.id == id).cloned().unwrap()
    }

    fn page(&self, after: Option<i64>) -> Vec<Event> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        state
            .events
            .iter()
            .filter(|e| !e.processed && after.map_or(true, |a| e.id > a))
            .take(PAGE_SIZE as usize)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventQueue for MemoryEventQueue {
    async fn fetch_unprocessed_page(&self) -> Result<Vec<Event>> {
        Ok(self.page(None))
    }

    async fn fetch_unprocessed_after(&self, after_id: i64) -> Result<Vec<Event>> {
        Ok(self.page(Some(after_id)))
    }

    async fn mark_processed(&self, id: i64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mark_for == Some(id) {
            return Err(Error::storage(
                format!("marking event {} as processed", id),
                "connection reset by peer",
            ));
        }
        if state.already_processed == Some(id) {
            return Ok(false);
        }
        match state.events.iter_mut().find(|e| e.id == id && !e.processed) {
            Some(event) => {
                event.processed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_pending(&self) -> Result<i64> {
        Ok(self.pending() as i64)
    }
}

#[derive(Default)]
struct ProducerState {
    attempted: Vec<OutboundMessage>,
    published: Vec<OutboundMessage>,
    fail_attempt: Option<usize>,
    flushes: usize,
    closed: bool,
}

/// Records every publish; optionally rejects the n-th attempt (1-based).
#[derive(Default)]
pub struct RecordingProducer {
    state: Mutex<ProducerState>,
}

impl RecordingProducer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(attempt: usize) -> Arc<Self> {
        let producer = Self::default();
        producer.state.lock().unwrap().fail_attempt = Some(attempt);
        Arc::new(producer)
    }

    pub fn attempted(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().attempted.clone()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().unwrap().published.len()
    }

    pub fn is_closed(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.closed && state.flushes > 0
    }
}

#[async_trait]
impl Producer for RecordingProducer {
    async fn publish(&self, message: &OutboundMessage) -> Result<DeliveryReport> {
        let mut state = self.state.lock().unwrap();
        state.attempted.push(message.clone());
        if state.fail_attempt == Some(state.attempted.len()) {
            return Err(Error::Delivery {
                event_id: message.event_id,
                topic: message.topic.clone(),
                message: "Broker: Not enough in-sync replicas".to_string(),
            });
        }
        state.published.push(message.clone());
        Ok(DeliveryReport {
            partition: message.partition,
            offset: state.published.len() as i64 - 1,
        })
    }

    async fn flush(&self, _timeout: Duration) -> Result<usize> {
        self.state.lock().unwrap().flushes += 1;
        Ok(0)
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Topic metadata with a fixed set of known topics.
pub struct StaticMetadata {
    topics: HashMap<String, i32>,
}

impl StaticMetadata {
    pub fn new(topics: &[(&str, i32)]) -> Arc<Self> {
        Arc::new(Self {
            topics: topics.iter().map(|(t, c)| (t.to_string(), *c)).collect(),
        })
    }
}

#[async_trait]
impl TopicMetadata for StaticMetadata {
    async fn partition_count(&self, topic: &str, _timeout: Duration) -> Result<i32> {
        self.topics.get(topic).copied().ok_or_else(|| Error::Metadata {
            topic: topic.to_string(),
            message: "no such topic found".to_string(),
        })
    }
}

#[derive(Default)]
pub struct CountingPing {
    pub calls: AtomicUsize,
    pub fail: bool,
}

#[async_trait]
impl KeepalivePing for CountingPing {
    async fn ping(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Keepalive {
                message: "server closed the connection unexpectedly".to_string(),
            });
        }
        Ok(())
    }
}

pub const USERS_PARTITIONS: i32 = 4;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 10, 15, 10, 30, 0).unwrap()
}

pub fn settings() -> RelaySettings {
    RelaySettings {
        namespace: "shop".to_string(),
        dry_run: false,
        flush_timeout: Duration::from_secs(1),
    }
}

/// A replicator wired to in-memory collaborators.
pub struct TestRelay {
    pub replicator: Replicator,
    pub wake: WakeSource,
    pub notify: mpsc::UnboundedSender<Notification>,
    pub shutdown: CancellationToken,
    pub ping: Arc<CountingPing>,
}

pub fn test_relay(
    queue: Arc<MemoryEventQueue>,
    producer: Arc<RecordingProducer>,
    settings: RelaySettings,
    keepalive: Duration,
    ping: Arc<CountingPing>,
) -> TestRelay {
    let metadata = StaticMetadata::new(&[
        ("shop.users", USERS_PARTITIONS),
        ("shop.orders", 2),
        ("users", 1),
    ]);
    let replicator = Replicator::new(
        settings,
        queue,
        producer,
        HashPartitioner::new(metadata),
    );

    let (notify, notifications) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let wake = WakeSource::new(notifications, ping.clone(), keepalive, shutdown.clone());

    TestRelay {
        replicator,
        wake,
        notify,
        shutdown,
        ping,
    }
}

pub fn notification() -> Notification {
    Notification {
        channel: "outbound_event_queue".to_string(),
        payload: String::new(),
    }
}

/// Polls `condition` every few milliseconds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn payload(message: &OutboundMessage) -> Value {
    serde_json::from_slice(&message.payload).unwrap()
}
