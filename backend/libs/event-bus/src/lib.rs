//! # Event Bus
//!
//! Durable, subject-addressed event delivery with two consumption modes:
//!
//! - **Exclusive** subscriptions: every subscriber instance sees every event
//!   published after it subscribed. Each process replica uses one to fan out to
//!   its own locally held connections.
//! - **Competing** subscriptions: members of a named group share the work, each
//!   event is handled by exactly one member.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a handler returning `Err` (or panicking) leaves the event
//!   unacknowledged and it is redelivered after the configured ack wait.
//! - **No deduplication**: handlers must be idempotent.
//! - **Ordering**: first deliveries to one consumer follow publish order for
//!   that stream; redeliveries may interleave. An exclusive subscription is a
//!   single consumer. A competing subscription runs `workers` consumers, each
//!   ordered on its own. Nothing is ordered across subjects or subscriptions.
//! - **Dead-lettering**: an event that reached `max_deliver` attempts is moved to
//!   the stream's dead-letter store and acknowledged.
//!
//! ## Architecture
//!
//! ```text
//! publish(subject) ──► stream (matched by wildcard subject tree)
//!                          │
//!           ┌──────────────┼───────────────────┐
//!           ▼              ▼                   ▼
//!   exclusive group   exclusive group    competing group
//!   (instance A)      (instance B)       (A + B share work)
//! ```
//!
//! Two backends implement [`EventBus`]: [`RedisStreamsBus`] (Redis Streams and
//! consumer groups) and [`InMemoryBus`] (single process).
//!
//! ## Usage
//!
//! ```ignore
//! use event_bus::{handler_fn, BusConfig, EventBus, InMemoryBus};
//!
//! let bus = InMemoryBus::new(BusConfig::default());
//! let sub = bus
//!     .subscribe_competing("workers", "conversation.update_last_message_id", handler_fn(|event| async move {
//!         tracing::info!(subject = %event.subject, "got event");
//!         Ok(())
//!     }))
//!     .await?;
//! bus.publish("conversation.update_last_message_id", b"{}".to_vec()).await?;
//! sub.drain().await?;
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

mod error;
pub mod memory;
pub mod redis_streams;
pub mod subject;
mod subscription;

pub use error::{BusError, BusResult};
pub use memory::InMemoryBus;
pub use redis_streams::RedisStreamsBus;
pub use subscription::Subscription;

/// A single delivery of a published event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Broker-assigned identifier (stream entry id or log sequence)
    pub id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,
}

impl Event {
    /// Deserialize the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// Consumer callback. `Ok` acknowledges the event, `Err` requests redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append `payload` to the stream covering `subject`. Returns the event id.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<String>;

    /// Durable, non-competing consumer named `durable`.
    async fn subscribe_exclusive(
        &self,
        durable: &str,
        subject: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription>;

    /// Member of the load-balanced consumer group `group`.
    async fn subscribe_competing(
        &self,
        group: &str,
        subject: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription>;

    /// Stop every subscription created through this bus and wait for in-flight
    /// handlers. Subscribing after a drain fails with [`BusError::Closed`].
    async fn drain(&self) -> BusResult<()>;
}

/// A durable stream and the wildcard subject trees it captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: &[&str]) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn covers(&self, subject: &str) -> bool {
        self.subjects
            .iter()
            .any(|pattern| subject::matches(pattern, subject))
    }
}

/// Bus-wide retry and batching policy.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub streams: Vec<StreamConfig>,
    /// How long an unacknowledged event waits before redelivery
    pub ack_wait: Duration,
    /// Upper bound for the exponential redelivery delay
    pub max_backoff: Duration,
    /// Deliveries before an event is dead-lettered
    pub max_deliver: u32,
    pub batch_size: usize,
    /// Broker-side blocking read timeout
    pub block: Duration,
    /// Approximate per-stream retention (entries)
    pub max_len: usize,
    /// Concurrent handler tasks per competing subscription. Each task is a
    /// separate group consumer; exclusive subscriptions always run one.
    pub workers: usize,
    /// Cap for the reconnect backoff after broker errors
    pub reconnect_backoff_max: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            ack_wait: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            max_deliver: 10,
            batch_size: 64,
            block: Duration::from_secs(5),
            max_len: 100_000,
            workers: 1,
            reconnect_backoff_max: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    pub fn with_streams(streams: Vec<StreamConfig>) -> Self {
        Self {
            streams,
            ..Self::default()
        }
    }

    /// Check that every stream has subjects and that no subject tree is
    /// claimed by two streams.
    pub fn validate(&self) -> BusResult<()> {
        if self.workers == 0 {
            return Err(BusError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.max_deliver == 0 {
            return Err(BusError::InvalidConfig(
                "max_deliver must be at least 1".into(),
            ));
        }

        for (i, stream) in self.streams.iter().enumerate() {
            if stream.subjects.is_empty() {
                return Err(BusError::InvalidConfig(format!(
                    "stream {} has no subjects",
                    stream.name
                )));
            }
            for pattern in &stream.subjects {
                subject::validate_pattern(pattern)?;
            }
            for other in &self.streams[i + 1..] {
                if other.name == stream.name {
                    return Err(BusError::InvalidConfig(format!(
                        "duplicate stream name {}",
                        stream.name
                    )));
                }
                for a in &stream.subjects {
                    for b in &other.subjects {
                        if subject::overlaps(a, b) {
                            return Err(BusError::InvalidConfig(format!(
                                "subjects {a} ({}) and {b} ({}) overlap",
                                stream.name, other.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Handler tasks for one subscription. An exclusive consumer is a single
    /// task so its handler sees events in publish order.
    pub fn workers_for(&self, exclusive: bool) -> usize {
        if exclusive {
            1
        } else {
            self.workers
        }
    }

    /// Stream that captures `subject` (a concrete subject or a filter).
    pub fn stream_for(&self, subject: &str) -> BusResult<&StreamConfig> {
        self.streams
            .iter()
            .find(|s| s.covers(subject))
            .ok_or_else(|| BusError::UnknownSubject(subject.to_string()))
    }

    /// Delay before redelivering an event whose `attempt`-th delivery failed.
    ///
    /// ack_wait * 2^(attempt-1), capped at `max_backoff`.
    pub fn redelivery_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.ack_wait
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}
