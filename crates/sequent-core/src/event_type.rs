//! Declared event types, their schema-evolution operators, and the typed
//! producer/consumer pair built on top of the untyped topic contracts
//! (§3, §4.1–§4.2, §4.5).

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::aggregate::Aggregate;
use crate::catchup::CatchUpConsumer;
use crate::error::{Result, SequentError};
use crate::migrator::{Migrator, MigratorHandle, RunOptions};
use crate::naming::{join_nonempty, sha1_hex};
use crate::schema::{Field, Schema};
use crate::topic::{ConsumerGroup, Envelope, Producer, RawEvent, Topic, TopicFactory};

/// A named, computed field attached by [`EventType::add_fields`]. `compute`
/// sees the pre-evolution typed event and returns the field's new value.
pub struct ComputedField<T> {
    pub name: String,
    pub schema: Schema,
    pub compute: Arc<dyn Fn(&T) -> Value + Send + Sync>,
}

impl<T> ComputedField<T> {
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        compute: impl Fn(&T) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            compute: Arc::new(compute),
        }
    }
}

struct EventTypeInner {
    name: String,
    schema: Schema,
    nonce: i64,
    migrators: Vec<Arc<dyn MigratorHandle>>,
    aggregate: Option<Aggregate>,
}

/// An immutable, content-addressed event declaration. Every evolution
/// operator (`add_fields`, `remove_fields`, `turn_fields_optional`, `map`,
/// `flat_map`, `filter`) returns a *new* `EventType`, appending one more
/// migrator to the chain inherited from `self` (§4.1).
///
/// `T` is the Rust shape the current generation's payloads deserialize to;
/// it carries no runtime weight (`PhantomData<fn() -> T>` keeps the type
/// `Clone`/`Send`/`Sync` regardless of `T`'s own bounds).
pub struct EventType<T> {
    inner: Arc<EventTypeInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for EventType<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

fn derive_string(name: &str, schema: &Schema, aggregate: Option<&Aggregate>) -> String {
    let prefix = match aggregate {
        Some(agg) => format!("{name} (agg: {})", agg.name()),
        None => name.to_string(),
    };
    format!("{prefix} {}", schema.string())
}

fn derive_topic_name(name: &str, schema: &Schema, nonce: i64, aggregate: Option<&Aggregate>) -> String {
    let identity = derive_string(name, schema, aggregate);
    let hash = sha1_hex(&format!("{identity}{nonce}"));
    let aggregate_name = aggregate.map(Aggregate::name).unwrap_or("");
    join_nonempty(&[aggregate_name, name, &hash], "-")
}

impl<T> EventType<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self::with_nonce(name, schema, 0)
    }

    pub fn with_nonce(name: impl Into<String>, schema: Schema, nonce: i64) -> Self {
        Self {
            inner: Arc::new(EventTypeInner {
                name: name.into(),
                schema,
                nonce,
                migrators: Vec::new(),
                aggregate: None,
            }),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn nonce(&self) -> i64 {
        self.inner.nonce
    }

    pub fn aggregate(&self) -> Option<&Aggregate> {
        self.inner.aggregate.as_ref()
    }

    /// Rebinds this declaration under `aggregate`, scoping its topic name
    /// and key-derivation rules (§4.8). Used by `Aggregate::use_event_type`.
    /// Rejects event types that aren't a record carrying an `id` field,
    /// per the aggregate invariant.
    pub fn bound_to(&self, aggregate: Aggregate) -> Result<Self> {
        self.ensure_aggregate_compatible()?;
        Ok(Self {
            inner: Arc::new(EventTypeInner {
                name: self.inner.name.clone(),
                schema: self.inner.schema.clone(),
                nonce: self.inner.nonce,
                migrators: self.inner.migrators.clone(),
                aggregate: Some(aggregate),
            }),
            _marker: PhantomData,
        })
    }

    /// Every event type used inside an aggregate must be a record with an
    /// `id` field, since the aggregate derives partition keys from it.
    pub fn ensure_aggregate_compatible(&self) -> Result<()> {
        match self.inner.schema.as_record_fields() {
            Some(fields) if fields.iter().any(|f| f.name == "id") => Ok(()),
            _ => Err(SequentError::from(crate::error::SchemaError::leaf(format!(
                "event type `{}` must be a record with an `id` field to be used inside an aggregate",
                self.inner.name
            )))),
        }
    }

    /// The canonical identity string fed into SHA-1 for `topic_name` (§3).
    pub fn string(&self) -> String {
        derive_string(&self.inner.name, &self.inner.schema, self.inner.aggregate.as_ref())
    }

    /// `[aggregate?.name, name, sha1(string() + nonce)].filter_nonempty.join("-")`.
    pub fn topic_name(&self) -> String {
        derive_topic_name(
            &self.inner.name,
            &self.inner.schema,
            self.inner.nonce,
            self.inner.aggregate.as_ref(),
        )
    }

    async fn topic(&self, factory: &dyn TopicFactory) -> Result<Arc<dyn crate::topic::Topic>> {
        factory.make(&self.topic_name()).await.map_err(SequentError::Substrate)
    }

    /// Runs every migrator in this type's chain to catch-up, then returns a
    /// producer bound to this generation's topic. Holding the returned
    /// `EventProducer` keeps the chain's migrators alive and replicating.
    pub async fn producer(&self, factory: Arc<dyn TopicFactory>, opts: RunOptions) -> Result<EventProducer<T>> {
        let mut running = Vec::with_capacity(self.inner.migrators.len());
        for migrator in &self.inner.migrators {
            running.push(migrator.run(factory.clone(), opts.clone()).await?);
        }
        let topic = self.topic(factory.as_ref()).await?;
        let producer = topic.producer().await.map_err(SequentError::Substrate)?;
        Ok(EventProducer {
            event_type: self.clone(),
            producer: Arc::from(producer),
            _running: running,
        })
    }

    /// Opens a typed, catch-up-aware consumer on this generation's topic.
    pub async fn consumer(
        &self,
        factory: Arc<dyn TopicFactory>,
        group: ConsumerGroup,
        opts: RunOptions,
        on_catch_up: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Result<TypedConsumer<T>> {
        let topic = self.topic(factory.as_ref()).await?;
        let raw_consumer = topic.consumer(group).await.map_err(SequentError::Substrate)?;
        let mut catchup =
            CatchUpConsumer::new(raw_consumer, opts.catch_up_options).with_logger(opts.logger.clone());
        if let Some(cb) = on_catch_up {
            catchup = catchup.on_catch_up(move || cb());
        }
        Ok(TypedConsumer {
            inner: catchup,
            _marker: PhantomData,
        })
    }

    /// Appends one migrator transforming this generation's payloads into
    /// `new_schema`-shaped payloads, returning the resulting next-generation
    /// declaration. If the candidate identity (name + schema string +
    /// aggregate) is unchanged from `self` and no distinct nonce was
    /// requested, the nonce is bumped so the two generations never collide
    /// on the same topic (the rule `filter` relies on; see `filter` below).
    fn chain<U>(
        &self,
        new_schema: Schema,
        nonce: Option<i64>,
        transform: Arc<dyn Fn(Value) -> anyhow::Result<Vec<Value>> + Send + Sync>,
    ) -> EventType<U>
    where
        U: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let unchanged_identity = new_schema.string() == self.inner.schema.string();
        let mut effective_nonce = nonce.unwrap_or(0);
        if unchanged_identity && effective_nonce == self.inner.nonce {
            effective_nonce = self.inner.nonce + 1;
        }

        let destination_topic_name =
            derive_topic_name(&self.inner.name, &new_schema, effective_nonce, self.inner.aggregate.as_ref());
        let migrator = Arc::new(Migrator::new(self.topic_name(), destination_topic_name, transform));

        let mut migrators = self.inner.migrators.clone();
        migrators.push(migrator);

        EventType {
            inner: Arc::new(EventTypeInner {
                name: self.inner.name.clone(),
                schema: new_schema,
                nonce: effective_nonce,
                migrators,
                aggregate: self.inner.aggregate.clone(),
            }),
            _marker: PhantomData,
        }
    }

    /// Appends computed fields to a `Record` schema (§4.1 `addFields`).
    pub fn add_fields<U>(&self, fields: Vec<ComputedField<T>>, nonce: Option<i64>) -> Result<EventType<U>>
    where
        U: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let current = self
            .inner
            .schema
            .as_record_fields()
            .ok_or_else(|| SequentError::from(crate::error::SchemaError::leaf("addFields requires a record schema")))?;

        let mut new_fields = current.to_vec();
        for f in &fields {
            new_fields.push(Field::new(f.name.clone(), f.schema.clone()));
        }
        let new_schema = Schema::record(new_fields);

        let computed = fields;
        let transform: Arc<dyn Fn(Value) -> anyhow::Result<Vec<Value>> + Send + Sync> = Arc::new(move |value| {
            let typed: T = serde_json::from_value(value.clone()).context("deserializing source event for addFields")?;
            let Value::Object(mut map) = value else {
                return Err(anyhow!("addFields expects an object payload"));
            };
            for field in &computed {
                map.insert(field.name.clone(), (field.compute)(&typed));
            }
            Ok(vec![Value::Object(map)])
        });

        Ok(self.chain(new_schema, nonce, transform))
    }

    /// Drops named fields from a `Record` schema (§4.1 `removeFields`).
    pub fn remove_fields<U>(&self, names: &[&str], nonce: Option<i64>) -> Result<EventType<U>>
    where
        U: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let current = self
            .inner
            .schema
            .as_record_fields()
            .ok_or_else(|| SequentError::from(crate::error::SchemaError::leaf("removeFields requires a record schema")))?;

        let remaining: Vec<Field> = current
            .iter()
            .filter(|f| !names.contains(&f.name.as_str()))
            .cloned()
            .collect();
        let new_schema = Schema::record(remaining);

        let owned_names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let transform: Arc<dyn Fn(Value) -> anyhow::Result<Vec<Value>> + Send + Sync> = Arc::new(move |value| {
            let Value::Object(mut map) = value else {
                return Err(anyhow!("removeFields expects an object payload"));
            };
            for name in &owned_names {
                map.remove(name);
            }
            Ok(vec![Value::Object(map)])
        });

        Ok(self.chain(new_schema, nonce, transform))
    }

    /// Wraps named fields in `Optional`, leaving their values untouched
    /// (§4.1 `turnFieldsOptional`).
    pub fn turn_fields_optional<U>(&self, names: &[&str], nonce: Option<i64>) -> Result<EventType<U>>
    where
        U: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let current = self
            .inner
            .schema
            .as_record_fields()
            .ok_or_else(|| SequentError::from(crate::error::SchemaError::leaf("turnFieldsOptional requires a record schema")))?;

        let new_fields: Vec<Field> = current
            .iter()
            .map(|f| {
                if names.contains(&f.name.as_str()) {
                    Field::new(f.name.clone(), Schema::optional(f.schema.clone()))
                } else {
                    f.clone()
                }
            })
            .collect();
        let new_schema = Schema::record(new_fields);

        let transform: Arc<dyn Fn(Value) -> anyhow::Result<Vec<Value>> + Send + Sync> = Arc::new(|value| Ok(vec![value]));
        Ok(self.chain(new_schema, nonce, transform))
    }

    /// General flatMap evolution: each source event maps to zero, one, or
    /// many destination events under `new_schema` (§4.1 `flatMap`).
    pub fn flat_map<U>(
        &self,
        new_schema: Schema,
        nonce: Option<i64>,
        f: impl Fn(T) -> Vec<U> + Send + Sync + 'static,
    ) -> EventType<U>
    where
        U: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let transform: Arc<dyn Fn(Value) -> anyhow::Result<Vec<Value>> + Send + Sync> = Arc::new(move |value| {
            let typed: T = serde_json::from_value(value).context("deserializing source event for flatMap")?;
            f(typed)
                .into_iter()
                .map(|out| serde_json::to_value(out).context("serializing flatMap output"))
                .collect::<anyhow::Result<Vec<_>>>()
        });
        self.chain(new_schema, nonce, transform)
    }

    /// `map` is `flatMap` restricted to exactly one output (§4.1 `map`).
    pub fn map<U>(&self, new_schema: Schema, nonce: Option<i64>, f: impl Fn(T) -> U + Send + Sync + 'static) -> EventType<U>
    where
        U: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.flat_map(new_schema, nonce, move |event| vec![f(event)])
    }

    /// Keeps only events matching `predicate`, under the same schema. Since
    /// the schema string is unchanged, `chain` auto-bumps the nonce unless
    /// the caller supplies an explicit, distinct one — otherwise the
    /// filtered and unfiltered streams would hash to the same topic (§4.1).
    pub fn filter(&self, nonce: Option<i64>, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> EventType<T> {
        let schema = self.inner.schema.clone();
        self.flat_map(schema, nonce, move |event| {
            if predicate(&event) {
                vec![event]
            } else {
                Vec::new()
            }
        })
    }
}

/// A producer bound to one `EventType` generation. Validates against the
/// declared schema and derives/enforces aggregate partition keys before
/// delegating to the underlying topic producer (§4.2, §4.8).
pub struct EventProducer<T> {
    event_type: EventType<T>,
    producer: Arc<dyn Producer>,
    _running: Vec<Arc<crate::migrator::RunningMigration>>,
}

impl<T> EventProducer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn event_type(&self) -> &EventType<T> {
        &self.event_type
    }

    /// Serializes, validates, derives the effective partition key, and
    /// publishes `event` with the current wall-clock time as its
    /// producer timestamp.
    pub async fn produce(&self, event: T, key: Option<Vec<u8>>) -> Result<()> {
        let value = serde_json::to_value(&event).map_err(|e| SequentError::Substrate(e.into()))?;
        self.event_type.inner.schema.validate(&value)?;
        let effective_key = self.derive_key(&value, key)?;
        let raw = RawEvent::new(Utc::now().timestamp_millis(), value);
        self.producer.produce(raw, effective_key).await.map_err(SequentError::Substrate)
    }

    fn derive_key(&self, value: &Value, caller_key: Option<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        match (&self.event_type.inner.aggregate, caller_key) {
            (Some(_), Some(_)) => Err(SequentError::AggregateKeyConflict {
                event_type: self.event_type.inner.name.clone(),
            }),
            (Some(_), None) => {
                let id = value.get("id");
                key_bytes_of(id).map(Some).ok_or_else(|| SequentError::MissingAggregateKey {
                    event_type: self.event_type.inner.name.clone(),
                    id_field: "id".to_string(),
                })
            }
            (None, caller_key) => Ok(caller_key),
        }
    }
}

/// Encodes an `id` field's value as aggregate partition-key bytes: strings
/// as UTF-8, numbers as 8-byte little-endian float64, bytes (themselves
/// JSON strings at the wire boundary) as their raw string bytes. `null` or
/// a missing field yields `None` (§4.8).
fn key_bytes_of(id: Option<&Value>) -> Option<Vec<u8>> {
    match id {
        Some(Value::String(s)) => Some(s.as_bytes().to_vec()),
        Some(Value::Number(n)) => n.as_f64().map(|f| f.to_le_bytes().to_vec()),
        _ => None,
    }
}

/// One delivered, typed event plus its partition key and ack handle.
pub struct Event<T> {
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

pub struct TypedEnvelope<T> {
    pub event: Event<T>,
    pub key: Option<Vec<u8>>,
    raw: Envelope,
}

impl<T> TypedEnvelope<T> {
    pub async fn ack(self) {
        self.raw.ack().await;
    }

    pub async fn nack(self) {
        self.raw.nack().await;
    }
}

/// A catch-up-aware consumer that deserializes each delivered payload into
/// `T` before handing it back.
pub struct TypedConsumer<T> {
    inner: CatchUpConsumer,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedConsumer<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub async fn consume(&self, cancel: &CancellationToken) -> Result<Option<TypedEnvelope<T>>> {
        use crate::topic::Consumer as _;
        let Some(envelope) = self.inner.consume(cancel).await.map_err(SequentError::Substrate)? else {
            return Ok(None);
        };
        let message: T = serde_json::from_value(envelope.event.message.clone())
            .map_err(|e| SequentError::Substrate(e.into()))?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(envelope.event.timestamp_ms).unwrap_or_else(Utc::now);
        let key = envelope.key.clone();
        Ok(Some(TypedEnvelope {
            event: Event { timestamp, message },
            key,
            raw: envelope,
        }))
    }

    pub fn is_caught_up(&self) -> bool {
        self.inner.is_caught_up()
    }
}
