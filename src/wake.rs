//! Wake-up sources for the relay loop.
//!
//! While idle the loop blocks on exactly one of three things: a queue
//! notification, the keepalive timer, or a shutdown request. [`WakeSource`]
//! folds them into a single [`WakeEvent`].

use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A push signal that new events may be queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeEvent {
    Notified,
    TimedOut,
    ShutdownRequested,
}

/// Liveness check on the notification connection.
#[async_trait]
pub trait KeepalivePing: Send + Sync + 'static {
    async fn ping(&self) -> Result<()>;
}

pub struct WakeSource {
    notifications: mpsc::UnboundedReceiver<Notification>,
    pinger: Arc<dyn KeepalivePing>,
    keepalive_interval: Duration,
    shutdown: CancellationToken,
    ping_failures_tx: mpsc::UnboundedSender<Error>,
    ping_failures: mpsc::UnboundedReceiver<Error>,
}

enum Woke {
    Shutdown,
    PingFailed(Error),
    Notified(Option<Notification>),
    Elapsed,
}

impl WakeSource {
    pub fn new(
        notifications: mpsc::UnboundedReceiver<Notification>,
        pinger: Arc<dyn KeepalivePing>,
        keepalive_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let (ping_failures_tx, ping_failures) = mpsc::unbounded_channel();
        Self {
            notifications,
            pinger,
            keepalive_interval,
            shutdown,
            ping_failures_tx,
            ping_failures,
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Blocks until one wake source fires.
    ///
    /// On timeout a keepalive ping is spawned without waiting for it. A failed
    /// ping is returned as an error from a later call.
    pub async fn wait(&mut self) -> Result<WakeEvent> {
        let woke = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Woke::Shutdown,
            Some(err) = self.ping_failures.recv() => Woke::PingFailed(err),
            notification = self.notifications.recv() => Woke::Notified(notification),
            _ = tokio::time::sleep(self.keepalive_interval) => Woke::Elapsed,
        };

        match woke {
            Woke::Shutdown => Ok(WakeEvent::ShutdownRequested),
            Woke::PingFailed(err) => Err(err),
            Woke::Notified(None) => Err(Error::ListenerClosed),
            Woke::Notified(Some(notification)) => {
                // One drain covers every pending notification.
                let mut coalesced = 0;
                while self.notifications.try_recv().is_ok() {
                    coalesced += 1;
                }
                debug!(
                    channel = %notification.channel,
                    payload = %notification.payload,
                    coalesced,
                    "Woken by notification"
                );
                Ok(WakeEvent::Notified)
            }
            Woke::Elapsed => {
                debug!(interval = ?self.keepalive_interval, "No notification received, pinging listener");
                self.spawn_ping();
                Ok(WakeEvent::TimedOut)
            }
        }
    }

    fn spawn_ping(&self) {
        let pinger = Arc::clone(&self.pinger);
        let failures = self.ping_failures_tx.clone();
        tokio::spawn(async move {
            match pinger.ping().await {
                Ok(()) => debug!("Keepalive ping succeeded"),
                Err(e) => {
                    error!("Keepalive ping failed: {}", e);
                    let _ = failures.send(e);
                }
            }
        });
    }
}
