//! A process-wide registry of named, append-only, in-memory logs: the
//! reference `TopicFactory`/`Topic` implementation used by tests and local
//! development in lieu of a real broker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sequent_core::{Ack, Consumer, ConsumerGroup, Envelope, Producer, RawEvent, StartPosition, Topic, TopicFactory};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

type Entry = (RawEvent, Option<Vec<u8>>);

struct TopicState {
    name: String,
    log: Mutex<Vec<Entry>>,
    notify: Notify,
    cursors: Mutex<HashMap<String, Arc<Mutex<usize>>>>,
}

/// A single named log, shared by every producer/consumer created against it.
pub struct InMemoryTopic {
    state: Arc<TopicState>,
}

impl InMemoryTopic {
    fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(TopicState {
                name: name.into(),
                log: Mutex::new(Vec::new()),
                notify: Notify::new(),
                cursors: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[async_trait]
impl Topic for InMemoryTopic {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn producer(&self) -> anyhow::Result<Box<dyn Producer>> {
        Ok(Box::new(InMemoryProducer {
            state: self.state.clone(),
        }))
    }

    /// Reuses the cursor already registered for `group.name`, so repeated
    /// calls with the same group name resume rather than restart; a new
    /// group name's initial offset is taken from `group.start_from`.
    async fn consumer(&self, group: ConsumerGroup) -> anyhow::Result<Box<dyn Consumer>> {
        let mut cursors = self.state.cursors.lock().await;
        let cursor = if let Some(existing) = cursors.get(&group.name) {
            existing.clone()
        } else {
            let start = match group.start_from {
                StartPosition::Beginning => 0,
                StartPosition::End => self.state.log.lock().await.len(),
            };
            let fresh = Arc::new(Mutex::new(start));
            cursors.insert(group.name.clone(), fresh.clone());
            fresh
        };
        drop(cursors);
        Ok(Box::new(InMemoryConsumer {
            state: self.state.clone(),
            cursor,
        }))
    }
}

struct InMemoryProducer {
    state: Arc<TopicState>,
}

#[async_trait]
impl Producer for InMemoryProducer {
    async fn produce(&self, event: RawEvent, key: Option<Vec<u8>>) -> anyhow::Result<()> {
        self.state.log.lock().await.push((event, key));
        self.state.notify.notify_waiters();
        Ok(())
    }
}

struct InMemoryConsumer {
    state: Arc<TopicState>,
    cursor: Arc<Mutex<usize>>,
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn consume(&self, cancel: &CancellationToken) -> anyhow::Result<Option<Envelope>> {
        loop {
            let notified = self.state.notify.notified();
            {
                let mut cursor = self.cursor.lock().await;
                let log = self.state.log.lock().await;
                if *cursor < log.len() {
                    let idx = *cursor;
                    let (event, key) = log[idx].clone();
                    *cursor += 1;
                    drop(log);
                    drop(cursor);
                    let ack: Arc<dyn Ack> = Arc::new(CursorAck {
                        cursor: self.cursor.clone(),
                        idx,
                    });
                    return Ok(Some(Envelope::new(event, key, ack)));
                }
            }
            tokio::pin!(notified);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => continue,
            }
        }
    }
}

/// Acking a delivered entry is a no-op (the cursor already advanced past
/// it on delivery); nacking rewinds the cursor back to `idx` so the next
/// `consume` redelivers the same entry, matching at-least-once semantics
/// for the (assumed single) consumer of this group.
struct CursorAck {
    cursor: Arc<Mutex<usize>>,
    idx: usize,
}

#[async_trait]
impl Ack for CursorAck {
    async fn ack(&self) {}

    async fn nack(&self) {
        let mut cursor = self.cursor.lock().await;
        if *cursor == self.idx + 1 {
            *cursor = self.idx;
        }
    }
}

/// Idempotent registry of [`InMemoryTopic`]s: repeated `make` calls with the
/// same name return the same topic, sharing its log and cursors.
#[derive(Default)]
pub struct InMemoryTopicFactory {
    topics: Mutex<HashMap<String, Arc<dyn Topic>>>,
}

impl InMemoryTopicFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopicFactory for InMemoryTopicFactory {
    async fn make(&self, name: &str) -> anyhow::Result<Arc<dyn Topic>> {
        let mut topics = self.topics.lock().await;
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }
        let topic: Arc<dyn Topic> = Arc::new(InMemoryTopic::new(name));
        topics.insert(name.to_string(), topic.clone());
        Ok(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn make_is_idempotent_and_shares_storage() {
        let factory = InMemoryTopicFactory::new();
        let a = factory.make("orders").await.unwrap();
        let b = factory.make("orders").await.unwrap();

        let producer = a.producer().await.unwrap();
        producer.produce(RawEvent::new(0, json!({"n": 1})), None).await.unwrap();

        let cancel = CancellationToken::new();
        let consumer = b.consumer(ConsumerGroup::named("g", StartPosition::Beginning)).await.unwrap();
        let envelope = consumer.consume(&cancel).await.unwrap().unwrap();
        assert_eq!(envelope.event.message, json!({"n": 1}));
    }

    #[tokio::test]
    async fn beginning_replays_history_end_only_tails_new_events() {
        let factory = InMemoryTopicFactory::new();
        let topic = factory.make("orders").await.unwrap();
        let producer = topic.producer().await.unwrap();
        producer.produce(RawEvent::new(0, json!({"n": 1})), None).await.unwrap();

        let cancel = CancellationToken::new();
        let from_beginning = topic
            .consumer(ConsumerGroup::named("replay", StartPosition::Beginning))
            .await
            .unwrap();
        assert!(from_beginning.consume(&cancel).await.unwrap().is_some());

        let from_end = topic
            .consumer(ConsumerGroup::named("tail", StartPosition::End))
            .await
            .unwrap();
        producer.produce(RawEvent::new(1, json!({"n": 2})), None).await.unwrap();
        let envelope = from_end.consume(&cancel).await.unwrap().unwrap();
        assert_eq!(envelope.event.message, json!({"n": 2}));
    }

    #[tokio::test]
    async fn nack_causes_redelivery_of_the_same_event() {
        let factory = InMemoryTopicFactory::new();
        let topic = factory.make("orders").await.unwrap();
        let producer = topic.producer().await.unwrap();
        producer.produce(RawEvent::new(0, json!({"n": 1})), None).await.unwrap();

        let cancel = CancellationToken::new();
        let consumer = topic
            .consumer(ConsumerGroup::named("g", StartPosition::Beginning))
            .await
            .unwrap();

        let first = consumer.consume(&cancel).await.unwrap().unwrap();
        first.nack().await;

        let second = consumer.consume(&cancel).await.unwrap().unwrap();
        assert_eq!(second.event.message, json!({"n": 1}));
    }

    #[tokio::test]
    async fn consume_wakes_up_once_an_event_is_produced() {
        let factory = InMemoryTopicFactory::new();
        let topic = factory.make("orders").await.unwrap();
        let consumer = topic
            .consumer(ConsumerGroup::named("g", StartPosition::Beginning))
            .await
            .unwrap();
        let producer = topic.producer().await.unwrap();

        let cancel = CancellationToken::new();
        let consume_task = tokio::spawn(async move { consumer.consume(&cancel).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.produce(RawEvent::new(0, json!({"n": 1})), None).await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_millis(200), consume_task)
            .await
            .expect("consume did not wake up in time")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(envelope.event.message, json!({"n": 1}));
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_consume() {
        let factory = InMemoryTopicFactory::new();
        let topic = factory.make("orders").await.unwrap();
        let consumer = topic
            .consumer(ConsumerGroup::named("g", StartPosition::Beginning))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let consume_task = tokio::spawn(async move { consumer.consume(&cancel2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(200), consume_task)
            .await
            .expect("cancellation did not unblock consume")
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }
}
