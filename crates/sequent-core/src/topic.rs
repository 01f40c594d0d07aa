//! Substrate-agnostic topic, producer, consumer, and envelope contracts
//! (§4.3, §6). Concrete substrates (in-memory, file, Kafka, …) are external
//! collaborators; this module only fixes the contract they must satisfy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Wire-level event as it travels through a topic: a producer timestamp and
/// a schema-unaware JSON payload. Partition keys travel alongside, not
/// inside, `RawEvent` (see `Producer::produce` and `Envelope::key`).
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub timestamp_ms: i64,
    pub message: Value,
}

impl RawEvent {
    pub fn new(timestamp_ms: i64, message: Value) -> Self {
        Self { timestamp_ms, message }
    }
}

/// Where a newly created [`ConsumerGroup`] should begin reading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Beginning,
    End,
}

/// Substrate-level coordination object: consumers sharing a group name
/// share offsets. Anonymous groups get a fresh unique name per call and
/// never share offsets with anything else.
#[derive(Debug, Clone)]
pub struct ConsumerGroup {
    pub name: String,
    pub start_from: StartPosition,
}

impl ConsumerGroup {
    pub fn named(name: impl Into<String>, start_from: StartPosition) -> Self {
        Self {
            name: name.into(),
            start_from,
        }
    }

    /// A fresh, never-reused group name; does not share offsets with any
    /// other consumer. Defaults to tailing live traffic, since anonymous
    /// listeners typically want "from now on" rather than full replay.
    pub fn anonymous() -> Self {
        Self {
            name: format!("anon-{}", Uuid::new_v4()),
            start_from: StartPosition::End,
        }
    }
}

/// Idempotent factory for named topics: repeated calls with the same name
/// must return topics sharing storage and offsets (§6).
#[async_trait]
pub trait TopicFactory: Send + Sync {
    async fn make(&self, name: &str) -> Result<Arc<dyn Topic>>;
}

/// A named, append-only, partitioned log of [`RawEvent`]s.
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;
    async fn producer(&self) -> Result<Box<dyn Producer>>;
    async fn consumer(&self, group: ConsumerGroup) -> Result<Box<dyn Consumer>>;
}

/// Publishes events onto a topic with at-least-once durability.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publishes `event` with an optional partition key, returning once the
    /// substrate's durability guarantee is met (broker ack, file flush, or
    /// in-memory enqueue).
    async fn produce(&self, event: RawEvent, key: Option<Vec<u8>>) -> Result<()>;
}

/// Pulls the next envelope for a consumer group, or `None` on clean
/// cancellation/shutdown.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, cancel: &CancellationToken) -> Result<Option<Envelope>>;
}

/// Acknowledgement sink backing an [`Envelope`]. Substrates implement this
/// to advance (ack) or retain (nack, for at-least-once redelivery) a
/// consumer group's offset.
#[async_trait]
pub trait Ack: Send + Sync {
    async fn ack(&self);
    async fn nack(&self);
}

/// An at-least-once delivery unit. If released (dropped) without an
/// explicit `nack`, it acks — matching "on scoped release without explicit
/// nack, it acks" (§4.3).
pub struct Envelope {
    pub event: RawEvent,
    pub key: Option<Vec<u8>>,
    ack: Arc<dyn Ack>,
    resolved: Arc<AtomicBool>,
}

impl Envelope {
    pub fn new(event: RawEvent, key: Option<Vec<u8>>, ack: Arc<dyn Ack>) -> Self {
        Self {
            event,
            key,
            ack,
            resolved: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn ack(self) {
        self.resolved.store(true, Ordering::SeqCst);
        self.ack.ack().await;
    }

    pub async fn nack(self) {
        self.resolved.store(true, Ordering::SeqCst);
        self.ack.nack().await;
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        if !self.resolved.swap(true, Ordering::SeqCst) {
            let ack = self.ack.clone();
            tokio::spawn(async move { ack.ack().await });
        }
    }
}
