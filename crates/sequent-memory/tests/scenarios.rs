//! End-to-end scenarios exercising `sequent-core` against the in-memory
//! reference adapters: a simple projection, a schema evolution migrating a
//! backlog into a read model, a filtered evolution, the N-way time-ordered
//! merge, aggregate-derived partition keys, and idempotent migrator
//! catch-up under concurrent callers.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sequent_core::{
    Aggregate, ComputedField, ConsumerGroup, EventType, Field, Producer, ReadModel, RunOptions, Schema, StartPosition,
    Topic, TopicFactory,
};
use sequent_memory::{InMemoryClient, InMemoryClientFactory, InMemoryTopicFactory};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct UserRegistered {
    id: String,
    email: String,
}

fn user_registered_type() -> EventType<UserRegistered> {
    EventType::new(
        "UserRegistered",
        Schema::record(vec![Field::new("id", Schema::String), Field::new("email", Schema::String)]),
    )
}

#[tokio::test]
async fn simple_projection_ingests_every_produced_event() {
    let factory = Arc::new(InMemoryTopicFactory::new());
    let event_type = user_registered_type();

    let producer = event_type.producer(factory.clone(), RunOptions::default()).await.unwrap();
    producer
        .produce(
            UserRegistered {
                id: "1".into(),
                email: "ada@example.com".into(),
            },
            None,
        )
        .await
        .unwrap();
    producer
        .produce(
            UserRegistered {
                id: "2".into(),
                email: "bo@example.com".into(),
            },
            None,
        )
        .await
        .unwrap();

    let read_model = ReadModel::<InMemoryClient>::new("users").on(&event_type, "project", None, |event, client: Arc<InMemoryClient>, _key| async move {
        client.put("users", event.id.clone(), json!({"email": event.email})).await;
        Ok(())
    });

    let client_factory = Arc::new(InMemoryClientFactory::new());
    let client = read_model.start(factory, client_factory, RunOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.len("users").await, 2);
    assert_eq!(client.get("users", "1").await, Some(json!({"email": "ada@example.com"})));
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct UserRegisteredWithPlan {
    id: String,
    email: String,
    plan: String,
}

#[tokio::test]
async fn add_fields_migrates_an_existing_backlog_into_the_evolved_read_model() {
    let factory = Arc::new(InMemoryTopicFactory::new());
    let v1 = user_registered_type();

    let v1_producer = v1.producer(factory.clone(), RunOptions::default()).await.unwrap();
    v1_producer
        .produce(
            UserRegistered {
                id: "1".into(),
                email: "ada@example.com".into(),
            },
            None,
        )
        .await
        .unwrap();
    v1_producer
        .produce(
            UserRegistered {
                id: "2".into(),
                email: "bo@example.com".into(),
            },
            None,
        )
        .await
        .unwrap();

    let v2: EventType<UserRegisteredWithPlan> = v1
        .add_fields(
            vec![ComputedField::new("plan", Schema::String, |_: &UserRegistered| {
                Value::String("free".to_string())
            })],
            None,
        )
        .unwrap();

    // Running the evolved type's producer replicates the entire v1 backlog
    // through the new `addFields` migrator before returning.
    let _v2_producer = v2.producer(factory.clone(), RunOptions::default()).await.unwrap();

    let read_model = ReadModel::<InMemoryClient>::new("users").on(&v2, "project", None, |event, client: Arc<InMemoryClient>, _key| async move {
        client.put("users", event.id.clone(), json!({"email": event.email, "plan": event.plan})).await;
        Ok(())
    });

    let client_factory = Arc::new(InMemoryClientFactory::new());
    let client = read_model.start(factory, client_factory, RunOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.len("users").await, 2);
    assert_eq!(
        client.get("users", "1").await,
        Some(json!({"email": "ada@example.com", "plan": "free"}))
    );
}

#[tokio::test]
async fn filter_migrates_only_matching_events_and_bumps_the_nonce() {
    let factory = Arc::new(InMemoryTopicFactory::new());
    let base = user_registered_type();

    let base_producer = base.producer(factory.clone(), RunOptions::default()).await.unwrap();
    base_producer
        .produce(
            UserRegistered {
                id: "1".into(),
                email: "ada@example.com".into(),
            },
            None,
        )
        .await
        .unwrap();
    base_producer
        .produce(
            UserRegistered {
                id: "2".into(),
                email: "not-an-email".into(),
            },
            None,
        )
        .await
        .unwrap();

    let filtered = base.filter(None, |u: &UserRegistered| u.email.contains('@'));
    assert_eq!(filtered.nonce(), base.nonce() + 1);
    assert_ne!(filtered.topic_name(), base.topic_name());

    let _filtered_producer = filtered.producer(factory.clone(), RunOptions::default()).await.unwrap();

    let read_model = ReadModel::<InMemoryClient>::new("valid-users").on(&filtered, "project", None, |event, client: Arc<InMemoryClient>, _key| async move {
        client.put("users", event.id.clone(), json!({"email": event.email})).await;
        Ok(())
    });

    let client_factory = Arc::new(InMemoryClientFactory::new());
    let client = read_model.start(factory, client_factory, RunOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.len("users").await, 1);
    assert_eq!(client.get("users", "1").await, Some(json!({"email": "ada@example.com"})));
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Deposited {
    amount: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Withdrawn {
    amount: i64,
}

#[tokio::test]
async fn read_model_merges_two_topics_in_timestamp_order() {
    let factory = Arc::new(InMemoryTopicFactory::new());
    let deposits = EventType::<Deposited>::new("Deposited", Schema::record(vec![Field::new("amount", Schema::Number)]));
    let withdrawals = EventType::<Withdrawn>::new("Withdrawn", Schema::record(vec![Field::new("amount", Schema::Number)]));

    // Produce directly onto each topic with explicit, interleaved
    // timestamps close to "now" (so the catch-up recency latch fires
    // immediately) but far enough apart that the merge order is
    // deterministic regardless of wall-clock skew between the two calls.
    // Both topics get two events (mirroring the two-events-per-topic
    // interleaving used elsewhere) so neither stream ever drains to empty
    // mid-merge; a drained stream would otherwise stall the round for up to
    // `peek_timeout_ms` (0.7 * catch_up_idle_ms) waiting on its idle peek.
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64;
    let deposits_topic = factory.make(&deposits.topic_name()).await.unwrap();
    let withdrawals_topic = factory.make(&withdrawals.topic_name()).await.unwrap();
    let deposits_producer = deposits_topic.producer().await.unwrap();
    let withdrawals_producer = withdrawals_topic.producer().await.unwrap();

    deposits_producer
        .produce(sequent_core::RawEvent::new(now, json!({"amount": 10})), None)
        .await
        .unwrap();
    withdrawals_producer
        .produce(sequent_core::RawEvent::new(now + 100, json!({"amount": 3})), None)
        .await
        .unwrap();
    deposits_producer
        .produce(sequent_core::RawEvent::new(now + 200, json!({"amount": 5})), None)
        .await
        .unwrap();
    withdrawals_producer
        .produce(sequent_core::RawEvent::new(now + 300, json!({"amount": 7})), None)
        .await
        .unwrap();

    let order: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let deposits_order = order.clone();
    let withdrawals_order = order.clone();

    let read_model = ReadModel::<InMemoryClient>::new("ledger")
        .on(&deposits, "deposit", None, move |event: Deposited, _client: Arc<InMemoryClient>, _key| {
            let order = deposits_order.clone();
            async move {
                order.lock().unwrap().push(format!("deposit:{}", event.amount));
                Ok(())
            }
        })
        .on(&withdrawals, "withdraw", None, move |event: Withdrawn, _client: Arc<InMemoryClient>, _key| {
            let order = withdrawals_order.clone();
            async move {
                order.lock().unwrap().push(format!("withdraw:{}", event.amount));
                Ok(())
            }
        });

    let client_factory = Arc::new(InMemoryClientFactory::new());
    let _client = read_model.start(factory, client_factory, RunOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        *order.lock().unwrap(),
        vec!["deposit:10", "withdraw:3", "deposit:5", "withdraw:7"]
    );
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct UserCreated {
    id: String,
    name: String,
}

#[tokio::test]
async fn aggregate_derives_the_partition_key_from_id() {
    let factory: Arc<dyn TopicFactory> = Arc::new(InMemoryTopicFactory::new());
    let aggregate = Aggregate::new("User", factory.clone());
    let event_type: EventType<UserCreated> = EventType::new(
        "UserCreated",
        Schema::record(vec![Field::new("id", Schema::String), Field::new("name", Schema::String)]),
    );

    let producer = aggregate.use_event_type(&event_type, RunOptions::default()).await.unwrap();
    producer
        .produce(
            UserCreated {
                id: "user-42".into(),
                name: "Ada".into(),
            },
            None,
        )
        .await
        .unwrap();

    let bound = event_type.bound_to(aggregate.clone()).unwrap();
    let topic = factory.make(&bound.topic_name()).await.unwrap();
    let consumer = topic.consumer(ConsumerGroup::named("inspect", StartPosition::Beginning)).await.unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();
    let envelope = consumer.consume(&cancel).await.unwrap().unwrap();

    assert_eq!(envelope.key, Some(b"user-42".to_vec()));
}

#[tokio::test]
async fn aggregate_rejects_an_explicit_key_supplied_alongside_an_id() {
    let factory: Arc<dyn TopicFactory> = Arc::new(InMemoryTopicFactory::new());
    let aggregate = Aggregate::new("User", factory);
    let event_type: EventType<UserCreated> = EventType::new(
        "UserCreated",
        Schema::record(vec![Field::new("id", Schema::String), Field::new("name", Schema::String)]),
    );

    let producer = aggregate.use_event_type(&event_type, RunOptions::default()).await.unwrap();
    let err = producer
        .produce(
            UserCreated {
                id: "user-42".into(),
                name: "Ada".into(),
            },
            Some(b"explicit".to_vec()),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("must not supply an explicit partition key"));
}

#[tokio::test]
async fn concurrent_producer_calls_migrate_the_backlog_exactly_once() {
    let factory = Arc::new(InMemoryTopicFactory::new());
    let v1 = user_registered_type();
    let v1_producer = v1.producer(factory.clone(), RunOptions::default()).await.unwrap();
    v1_producer
        .produce(
            UserRegistered {
                id: "1".into(),
                email: "ada@example.com".into(),
            },
            None,
        )
        .await
        .unwrap();
    v1_producer
        .produce(
            UserRegistered {
                id: "2".into(),
                email: "bo@example.com".into(),
            },
            None,
        )
        .await
        .unwrap();

    let v2: EventType<UserRegisteredWithPlan> = v1
        .add_fields(
            vec![ComputedField::new("plan", Schema::String, |_: &UserRegistered| {
                Value::String("free".to_string())
            })],
            None,
        )
        .unwrap();

    let (a, b) = tokio::join!(
        v2.producer(factory.clone(), RunOptions::default()),
        v2.producer(factory.clone(), RunOptions::default())
    );
    let _a = a.unwrap();
    let _b = b.unwrap();

    let v2_topic = factory.make(&v2.topic_name()).await.unwrap();
    let consumer = v2_topic
        .consumer(ConsumerGroup::named("count", StartPosition::Beginning))
        .await
        .unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();
    let mut count = 0;
    // `consume` blocks waiting for further events once the log is drained,
    // so bound each pull with a timeout: its expiry is "no more events",
    // not a failure.
    while let Ok(Ok(Some(_envelope))) = tokio::time::timeout(Duration::from_millis(50), consumer.consume(&cancel)).await {
        count += 1;
    }
    assert_eq!(count, 2, "backlog must be replicated exactly once despite two concurrent producer() calls");
}
