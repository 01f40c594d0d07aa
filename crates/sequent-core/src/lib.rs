//! # Sequent Core
//!
//! Substrate-agnostic building blocks for event-sourced read models:
//! content-addressed event types with algebraic schema-evolution operators,
//! an idempotent forward migrator between topic generations, a catch-up
//! aware consumer, and an N-way time-ordered ingestion scheduler that
//! projects onto an application-supplied client.
//!
//! Nothing here talks to a concrete broker or store — [`topic::TopicFactory`]
//! and [`readmodel::ReadModelClientFactory`] are the seams an application
//! fills in. `sequent-memory` ships in-process reference implementations of
//! both for tests and local development.

pub mod aggregate;
pub mod catchup;
pub mod codec;
pub mod error;
pub mod event_type;
pub mod logger;
pub mod migrator;
pub mod naming;
pub mod readmodel;
pub mod schema;
pub mod topic;

pub use aggregate::{Aggregate, AggregateReadModelBuilder};
pub use catchup::{CatchUpConsumer, CatchUpOptions};
pub use codec::{Codec, JsonCodec};
pub use error::{Result, SchemaError, SequentError};
pub use event_type::{ComputedField, Event, EventProducer, EventType, TypedConsumer, TypedEnvelope};
pub use logger::{Logger, NoopLogger, Severity, TracingLogger};
pub use migrator::{Migrator, MigratorHandle, RunOptions, RunningMigration};
pub use naming::{sha1_hex, CasingPolicy};
pub use readmodel::{ReadModel, ReadModelClientFactory};
pub use schema::{Field, Schema};
pub use topic::{Ack, Consumer, ConsumerGroup, Envelope, Producer, RawEvent, StartPosition, Topic, TopicFactory};
