//! Live bus: process-external pub/sub keyed by chat id, one topic per
//! session.  Delivery is fire-and-forget and at-most-once; persistence is
//! the source of truth, so publish failures are logged by callers and
//! never fail a turn.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use redis::AsyncCommands;

use sc_domain::{Error, Result};

pub const LIVE_CHANNEL_PREFIX: &str = "chat:stream:live:";

/// The topic carrying a session's envelopes.
pub fn live_topic(session_id: &str) -> String {
    format!("{LIVE_CHANNEL_PREFIX}{session_id}")
}

/// Raw payloads from one subscription.  Dropping the stream releases the
/// underlying connection (the unsubscribe).
pub type BusStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[async_trait]
pub trait LiveBus: Send + Sync {
    /// Publish one payload.  At-most-once; no delivery guarantee.
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    /// Open a dedicated subscription to one topic.
    async fn subscribe(&self, topic: &str) -> Result<BusStream>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Redis implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RedisBus {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
}

impl RedisBus {
    /// Connect the shared publisher connection; subscriptions open their
    /// own connections on demand (redis pub/sub connections are dedicated).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::Bus(e.to_string()))?;
        let publisher = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl LiveBus for RedisBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(|e| Error::Bus(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(stream))
    }
}
