//! Client for the outbound event queue table.
//!
//! The queue is populated by capture triggers outside this crate. The relay
//! only reads unprocessed rows in `id` order and flips their `processed`
//! flag once the broker has confirmed delivery.

use crate::postgres::types::{Event, ExternalId, Statement};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::task::JoinHandle;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

/// Maximum number of events returned by one page fetch.
pub const PAGE_SIZE: i64 = 1000;

/// Durable store of captured events awaiting delivery.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Up to [`PAGE_SIZE`] unprocessed events, ordered by `id` ascending.
    /// Empty when nothing is pending.
    async fn fetch_unprocessed_page(&self) -> Result<Vec<Event>>;

    /// Like [`EventQueue::fetch_unprocessed_page`], restricted to ids greater
    /// than `after_id`. Lets a dry run walk the backlog without marking events.
    async fn fetch_unprocessed_after(&self, after_id: i64) -> Result<Vec<Event>>;

    /// Flags the event as processed. Returns `false` when the event was already
    /// processed or does not exist, which is not an error.
    async fn mark_processed(&self, id: i64) -> Result<bool>;

    /// Number of events not yet processed.
    async fn count_pending(&self) -> Result<i64>;
}

struct QueueQueries {
    fetch_page: String,
    fetch_after: String,
    mark_processed: String,
    count_pending: String,
}

impl QueueQueries {
    fn new(table: &str) -> Self {
        let select = format!(
            "SELECT id::bigint AS id, uuid::text AS uuid, \
             external_id, \
             table_name::text AS table_name, statement::text AS statement, \
             data::jsonb AS data, previous_data::jsonb AS previous_data, \
             created_at::timestamptz AS created_at \
             FROM {} WHERE processed = false",
            table
        );

        Self {
            fetch_page: format!("{} ORDER BY id ASC LIMIT {}", select, PAGE_SIZE),
            fetch_after: format!("{} AND id > $1 ORDER BY id ASC LIMIT {}", select, PAGE_SIZE),
            mark_processed: format!(
                "UPDATE {} SET processed = true WHERE id = $1 AND processed = false",
                table
            ),
            count_pending: format!("SELECT count(*) FROM {} WHERE processed IS FALSE", table),
        }
    }
}

/// [`EventQueue`] backed by a PostgreSQL table.
pub struct PgEventQueue {
    client: Client,
    connection_task: JoinHandle<()>,
    queries: QueueQueries,
}

impl PgEventQueue {
    pub async fn connect(pg_config: &tokio_postgres::Config, queue_table: &str) -> Result<Self> {
        info!(queue_table, "Connecting to event queue");

        let (client, connection) = pg_config.connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Event queue connection error: {}", e);
            }
        });

        Ok(Self {
            client,
            connection_task,
            queries: QueueQueries::new(queue_table),
        })
    }

    /// Runs `migrations.sql` and then `triggers.sql` from `sql_dir`.
    pub async fn provision(&self, sql_dir: &Path) -> Result<()> {
        crate::postgres::provision::run(&self.client, sql_dir).await
    }

    pub async fn close(self) -> Result<()> {
        info!("Closing event queue connection");
        drop(self.client);
        self.connection_task.await?;
        Ok(())
    }

    async fn query_events(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Event>> {
        let rows = self
            .client
            .query(sql, params)
            .await
            .map_err(|e| Error::storage("fetching unprocessed events", e))?;

        let events = rows.iter().map(event_from_row).collect::<Result<Vec<_>>>()?;
        debug!(count = events.len(), "Fetched page of unprocessed events");
        Ok(events)
    }
}

#[async_trait]
impl EventQueue for PgEventQueue {
    async fn fetch_unprocessed_page(&self) -> Result<Vec<Event>> {
        self.query_events(&self.queries.fetch_page, &[]).await
    }

    async fn fetch_unprocessed_after(&self, after_id: i64) -> Result<Vec<Event>> {
        self.query_events(&self.queries.fetch_after, &[&after_id]).await
    }

    async fn mark_processed(&self, id: i64) -> Result<bool> {
        let updated = self
            .client
            .execute(&self.queries.mark_processed, &[&id])
            .await
            .map_err(|e| Error::storage(format!("marking event {} as processed", id), e))?;
        Ok(updated > 0)
    }

    async fn count_pending(&self) -> Result<i64> {
        let row = self
            .client
            .query_one(&self.queries.count_pending, &[])
            .await
            .map_err(|e| Error::storage("counting pending events", e))?;
        row.try_get(0)
            .map_err(|e| Error::storage("reading pending event count", e))
    }
}

fn event_from_row(row: &Row) -> Result<Event> {
    let decode = |e: tokio_postgres::Error| Error::storage("decoding queued event", e);

    let statement: String = row.try_get("statement").map_err(decode)?;
    let statement = statement
        .parse::<Statement>()
        .map_err(|e| Error::storage("decoding queued event", e))?;
    let external_id = external_id_from_row(row).map_err(decode)?;

    Ok(Event {
        id: row.try_get("id").map_err(decode)?,
        uuid: row.try_get("uuid").map_err(decode)?,
        external_id,
        table_name: row.try_get("table_name").map_err(decode)?,
        statement,
        data: row.try_get("data").map_err(decode)?,
        previous_data: row.try_get("previous_data").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        processed: false,
    })
}

/// `external_id` may be `bytea` or any text type. Bytes are taken verbatim;
/// text is taken as its UTF-8 encoding.
fn external_id_from_row(row: &Row) -> std::result::Result<Option<ExternalId>, tokio_postgres::Error> {
    let is_bytea = row
        .columns()
        .iter()
        .find(|c| c.name() == "external_id")
        .map_or(false, |c| *c.type_() == Type::BYTEA);

    if is_bytea {
        let bytes: Option<Vec<u8>> = row.try_get("external_id")?;
        Ok(bytes.map(ExternalId::from))
    } else {
        let text: Option<String> = row.try_get("external_id")?;
        Ok(text.map(|s| ExternalId::from(s.into_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_target_configured_table() {
        let queries = QueueQueries::new("relay.events");

        assert!(queries.fetch_page.contains("FROM relay.events WHERE processed = false"));
        // Selected without a cast so bytea keys keep their raw bytes.
        assert!(queries.fetch_page.contains(", external_id, "));
        assert!(queries.fetch_page.ends_with("ORDER BY id ASC LIMIT 1000"));
        assert!(queries.fetch_after.contains("AND id > $1 ORDER BY id ASC"));
        assert_eq!(
            queries.mark_processed,
            "UPDATE relay.events SET processed = true WHERE id = $1 AND processed = false"
        );
        assert_eq!(
            queries.count_pending,
            "SELECT count(*) FROM relay.events WHERE processed IS FALSE"
        );
    }
}
