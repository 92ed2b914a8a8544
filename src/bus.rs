//! Invalidation Bus
//!
//! Best-effort, at-most-once broadcast of invalidation events between
//! processes. Each participant publishes with its own `source_id` and
//! ignores its own events on receipt; a consumer that misses an event
//! serves slightly stale data until local expiry. The bus is optional;
//! without one, invalidation is local-only.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::{Error, Result};

/// Subscriber channel depth; slow consumers drop events past this
const SUBSCRIBER_BUFFER: usize = 256;

/// What an event invalidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    Key,
    Namespace,
    All,
}

/// A single invalidation broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub kind: InvalidationKind,
    /// Cache key or namespace; empty for `All`
    pub target: String,
    /// Random id of the publishing process
    pub source_id: String,
}

impl InvalidationEvent {
    pub fn key(target: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            kind: InvalidationKind::Key,
            target: target.into(),
            source_id: source_id.into(),
        }
    }

    pub fn namespace(target: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            kind: InvalidationKind::Namespace,
            target: target.into(),
            source_id: source_id.into(),
        }
    }

    pub fn all(source_id: impl Into<String>) -> Self {
        Self {
            kind: InvalidationKind::All,
            target: String::new(),
            source_id: source_id.into(),
        }
    }
}

/// Cross-process invalidation fan-out.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Broadcast an event. Failures are surfaced but non-fatal to callers.
    async fn publish(&self, event: InvalidationEvent) -> Result<()>;

    /// Open a subscription stream. Delivery is best-effort.
    async fn subscribe(&self) -> Result<mpsc::Receiver<InvalidationEvent>>;
}

// =============================================================================
// Local Bus
// =============================================================================

/// In-process bus for tests and single-host multi-handler setups.
#[derive(Debug)]
pub struct LocalBus {
    sender: broadcast::Sender<InvalidationEvent>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvalidationBus for LocalBus {
    async fn publish(&self, event: InvalidationEvent) -> Result<()> {
        // No subscribers is not an error for a best-effort bus
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<InvalidationEvent>> {
        let mut source = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break; // subscriber dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "invalidation subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

// =============================================================================
// Redis Bus
// =============================================================================

/// Redis pub/sub bus. Events are MessagePack-encoded on the channel.
pub struct RedisBus {
    client: redis::Client,
    channel: String,
}

impl RedisBus {
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
        }
    }

    /// Connect a bus on its own pub/sub connection.
    pub fn connect(url: &str, channel: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("invalid redis URL: {e}")))?;
        Ok(Self::new(client, channel))
    }
}

#[async_trait]
impl InvalidationBus for RedisBus {
    async fn publish(&self, event: InvalidationEvent) -> Result<()> {
        let payload = rmp_serde::to_vec(&event).map_err(|e| Error::Serialization {
            serializer: "msgpack",
            reason: format!("invalidation event encoding failed: {e}"),
        })?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| crate::backend::redis::map_redis_error(e, "bus-publish", &self.channel))?;
        redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| crate::backend::redis::map_redis_error(e, "bus-publish", &self.channel))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<InvalidationEvent>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| crate::backend::redis::map_redis_error(e, "bus-subscribe", &self.channel))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| crate::backend::redis::map_redis_error(e, "bus-subscribe", &self.channel))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("undecodable invalidation payload: {e}");
                        continue;
                    }
                };
                match rmp_serde::from_slice::<InvalidationEvent>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("malformed invalidation event ignored: {e}");
                    }
                }
            }
        });
        Ok(rx)
    }
}

// =============================================================================
// Tests
// =============================================================================
