use crate::wake::{KeepalivePing, Notification};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{debug, error, info, warn};

/// Dedicated connection that LISTENs on the queue's notification channel.
///
/// Notifications are forwarded to the receiver returned by
/// [`NotificationListener::connect`]. The receiver yields `None` once the
/// connection is gone.
pub struct NotificationListener {
    client: Arc<Client>,
    connection_task: JoinHandle<()>,
    channel: String,
}

impl NotificationListener {
    pub async fn connect(
        pg_config: &tokio_postgres::Config,
        channel: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notification>)> {
        info!(channel, "Connecting notification listener");

        let (client, mut connection) = pg_config.connect(NoTls).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Polling messages also drives the connection, so this task must run
        // before the LISTEN below can complete.
        let connection_task = tokio::spawn(async move {
            let messages = stream::poll_fn(move |cx| connection.poll_message(cx));
            futures::pin_mut!(messages);
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        debug!(channel = n.channel(), pid = n.process_id(), "Notification received");
                        let notification = Notification {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        };
                        if tx.send(notification).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        warn!("Notice on listener connection: {}", notice);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Listener connection error: {}", e);
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", quote_identifier(channel)))
            .await?;
        info!(channel, "Listening for queue notifications");

        let listener = Self {
            client: Arc::new(client),
            connection_task,
            channel: channel.to_string(),
        };
        Ok((listener, rx))
    }

    /// Shared handle that pings this connection.
    pub fn pinger(&self) -> Arc<dyn KeepalivePing> {
        Arc::new(ListenerPing {
            client: Arc::clone(&self.client),
        })
    }

    pub fn close(self) {
        info!(channel = %self.channel, "Closing notification listener");
        self.connection_task.abort();
    }
}

struct ListenerPing {
    client: Arc<Client>,
}

#[async_trait]
impl KeepalivePing for ListenerPing {
    async fn ping(&self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| Error::Keepalive {
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// Quotes a channel name so it matches `pg_notify(channel, ...)` exactly,
/// case included.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
