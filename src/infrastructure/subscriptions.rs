use crate::domain::errors::ExchangeError;
use crate::domain::ports::{ExchangeApi, StreamEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

/// Per-consumer queue depth; a consumer that falls behind loses the oldest
/// ticks and receives a [`StreamMessage::Stale`] marker.
const CONSUMER_QUEUE: usize = 64;

pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

/// A message on an acquired market stream.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Event(StreamEvent),
    /// The consumer lagged and `missed` messages were dropped. Treat current
    /// leg marks as stale until the next event.
    Stale { missed: u64 },
}

/// A consumer handle for one venue channel. Obtained from
/// [`SubscriptionManager::acquire`], returned via
/// [`SubscriptionManager::release`].
pub struct MarketStream {
    channel: String,
    rx: broadcast::Receiver<StreamEvent>,
}

impl MarketStream {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<StreamMessage> {
        match self.rx.recv().await {
            Ok(event) => Some(StreamMessage::Event(event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(StreamMessage::Stale { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

struct Entry {
    refcount: usize,
    tx: broadcast::Sender<StreamEvent>,
    forward: tokio::task::JoinHandle<()>,
    /// Bumped whenever the entry is (re)acquired; a linger task only
    /// unsubscribes if its epoch is still current.
    linger_epoch: u64,
}

/// Reference-counted fan-out of venue channels over a single exchange
/// client. Subscribes upstream on the 0→1 transition and unsubscribes on
/// 1→0 after a linger, so hedger churn does not thrash the venue.
pub struct SubscriptionManager {
    exchange: Arc<dyn ExchangeApi>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    linger: Duration,
}

impl SubscriptionManager {
    pub fn new(exchange: Arc<dyn ExchangeApi>) -> Self {
        Self::with_linger(exchange, DEFAULT_LINGER)
    }

    pub fn with_linger(exchange: Arc<dyn ExchangeApi>, linger: Duration) -> Self {
        Self {
            exchange,
            entries: Arc::new(Mutex::new(HashMap::new())),
            linger,
        }
    }

    /// Acquire a consumer stream for `channel`, subscribing upstream if this
    /// is the first reference.
    pub async fn acquire(&self, channel: &str) -> Result<MarketStream, ExchangeError> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(channel) {
            entry.refcount += 1;
            entry.linger_epoch += 1;
            return Ok(MarketStream {
                channel: channel.to_string(),
                rx: entry.tx.subscribe(),
            });
        }

        let upstream = self.exchange.subscribe(channel).await?;
        let (tx, rx) = broadcast::channel(CONSUMER_QUEUE);
        let forward = tokio::spawn(forward_loop(upstream, tx.clone()));
        entries.insert(
            channel.to_string(),
            Entry {
                refcount: 1,
                tx,
                forward,
                linger_epoch: 0,
            },
        );
        debug!("subscribed upstream: {channel}");

        Ok(MarketStream {
            channel: channel.to_string(),
            rx,
        })
    }

    /// Return a stream. On the last reference the upstream subscription is
    /// dropped after the linger, unless re-acquired in the meantime.
    pub async fn release(&self, stream: MarketStream) {
        let channel = stream.channel;
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&channel) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }

        entry.linger_epoch += 1;
        let epoch = entry.linger_epoch;
        drop(entries);

        let entries = Arc::clone(&self.entries);
        let exchange = Arc::clone(&self.exchange);
        let linger = self.linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let mut entries = entries.lock().await;
            let expired = entries
                .get(&channel)
                .is_some_and(|e| e.refcount == 0 && e.linger_epoch == epoch);
            if !expired {
                return;
            }
            if let Some(entry) = entries.remove(&channel) {
                entry.forward.abort();
            }
            drop(entries);
            if let Err(e) = exchange.unsubscribe(&channel).await {
                warn!("unsubscribe {channel} failed: {e}");
            } else {
                debug!("unsubscribed upstream: {channel}");
            }
        });
    }

    pub async fn refcount(&self, channel: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(channel)
            .map_or(0, |e| e.refcount)
    }

    pub async fn active_channels(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drop every subscription immediately, bypassing the linger.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Entry)> = {
            let mut entries = self.entries.lock().await;
            entries.drain().collect()
        };
        for (channel, entry) in drained {
            entry.forward.abort();
            if let Err(e) = self.exchange.unsubscribe(&channel).await {
                warn!("unsubscribe {channel} on shutdown failed: {e}");
            }
        }
    }
}

async fn forward_loop(
    mut upstream: broadcast::Receiver<StreamEvent>,
    tx: broadcast::Sender<StreamEvent>,
) {
    loop {
        match upstream.recv().await {
            Ok(event) => {
                // Send only fails with zero receivers; fan-out continues for
                // whoever subscribes next.
                let _ = tx.send(event);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("upstream fan-out lagged by {missed}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
