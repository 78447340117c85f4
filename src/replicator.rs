//! The relay loop.
//!
//! Drains the event queue, then waits for a notification, keepalive timeout
//! or shutdown request, and drains again on every notification. Events are
//! published one at a time: an event is marked processed only after the
//! broker confirmed it, and any failure stops the loop at that event.

use crate::config::{topic_name, Config};
use crate::kafka::{HashPartitioner, JsonSerializer, OutboundMessage, Producer};
use crate::postgres::{Event, EventQueue};
use crate::wake::{WakeEvent, WakeSource};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Immutable settings of one relay process.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Topic namespace; empty publishes to bare table names.
    pub namespace: String,
    pub dry_run: bool,
    pub flush_timeout: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.topic_namespace(),
            dry_run: config.relay.dry_run,
            flush_timeout: config.flush_timeout(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Completed backlog drains.
    pub drains: u64,
    /// Non-empty pages processed.
    pub pages: u64,
    pub events_published: u64,
}

enum State {
    Draining,
    Waiting,
}

#[derive(Debug, PartialEq, Eq)]
enum Drain {
    Empty,
    Interrupted,
}

pub struct Replicator {
    settings: RelaySettings,
    queue: Arc<dyn EventQueue>,
    producer: Arc<dyn Producer>,
    partitioner: HashPartitioner,
    stats: RelayStats,
    // Last event logged by a dry run; nothing is marked processed then.
    dry_run_cursor: Option<i64>,
}

impl Replicator {
    pub fn new(
        settings: RelaySettings,
        queue: Arc<dyn EventQueue>,
        producer: Arc<dyn Producer>,
        partitioner: HashPartitioner,
    ) -> Self {
        Self {
            settings,
            queue,
            producer,
            partitioner,
            stats: RelayStats::default(),
            dry_run_cursor: None,
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Runs until shutdown is requested or a fatal error occurs. The producer
    /// is flushed and closed on both paths.
    pub async fn run(&mut self, mut wake: WakeSource) -> Result<RelayStats> {
        info!(
            namespace = %self.settings.namespace,
            dry_run = self.settings.dry_run,
            "Replicator starting"
        );

        let result = self.run_loop(&mut wake).await;

        match self.producer.flush(self.settings.flush_timeout).await {
            Ok(0) => {}
            Ok(pending) => warn!(pending, "Messages still pending after flush"),
            Err(e) => warn!("Producer flush failed: {}", e),
        }
        let closed = self.producer.close().await;

        result?;
        closed?;
        info!(
            drains = self.stats.drains,
            pages = self.stats.pages,
            events_published = self.stats.events_published,
            "Replicator stopped"
        );
        Ok(self.stats)
    }

    async fn run_loop(&mut self, wake: &mut WakeSource) -> Result<()> {
        let pending = self.queue.count_pending().await?;
        info!(pending, "Draining event backlog");

        let mut state = State::Draining;
        loop {
            state = match state {
                State::Draining => match self.drain(wake).await? {
                    Drain::Empty => State::Waiting,
                    Drain::Interrupted => {
                        info!("Shutdown requested during drain");
                        return Ok(());
                    }
                },
                State::Waiting => match wake.wait().await? {
                    WakeEvent::Notified => State::Draining,
                    WakeEvent::TimedOut => State::Waiting,
                    WakeEvent::ShutdownRequested => {
                        info!("Shutdown requested");
                        return Ok(());
                    }
                },
            };
        }
    }

    /// Processes pages until a fetch comes back empty. Shutdown is only
    /// honoured between pages.
    async fn drain(&mut self, wake: &WakeSource) -> Result<Drain> {
        loop {
            let page = match (self.settings.dry_run, self.dry_run_cursor) {
                (true, Some(after)) => self.queue.fetch_unprocessed_after(after).await?,
                _ => self.queue.fetch_unprocessed_page().await?,
            };

            if page.is_empty() {
                self.stats.drains += 1;
                let pending = self.queue.count_pending().await?;
                debug!(drains = self.stats.drains, pending, "Event queue drained");
                return Ok(Drain::Empty);
            }

            check_page(&page)?;
            debug!(
                events = page.len(),
                first_id = page[0].id,
                "Processing page of events"
            );

            for event in &page {
                self.relay_event(event).await?;
            }
            self.stats.pages += 1;

            if wake.shutdown_requested() {
                return Ok(Drain::Interrupted);
            }
        }
    }

    #[instrument(skip_all, fields(event_id = event.id, table = %event.table_name))]
    async fn relay_event(&mut self, event: &Event) -> Result<()> {
        let payload = JsonSerializer::serialize(event)?;
        let topic = topic_name(&self.settings.namespace, &event.table_name);
        let partition = self.partitioner.assign(&topic, event.key()).await?;

        let message = OutboundMessage {
            event_id: event.id,
            topic,
            partition,
            key: event.key().to_vec(),
            payload,
            timestamp: event.created_at,
        };

        let report = self.producer.publish(&message).await?;
        debug!(
            topic = %message.topic,
            partition = report.partition,
            offset = report.offset,
            statement = %event.statement,
            "Event delivered"
        );

        if self.settings.dry_run {
            self.dry_run_cursor = Some(event.id);
        } else if !self.queue.mark_processed(event.id).await? {
            warn!("Event was already marked processed");
        }

        self.stats.events_published += 1;
        Ok(())
    }
}

/// A page must be strictly ordered by id and contain only unprocessed events.
fn check_page(page: &[Event]) -> Result<()> {
    if let Some(event) = page.iter().find(|e| e.processed) {
        return Err(Error::Storage {
            message: format!("page contains processed event {}", event.id),
        });
    }
    if let Some(pair) = page.windows(2).find(|w| w[0].id >= w[1].id) {
        return Err(Error::Storage {
            message: format!(
                "page is not ordered by id: {} followed by {}",
                pair[0].id, pair[1].id
            ),
        });
    }
    Ok(())
}
