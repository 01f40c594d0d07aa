//! Idempotent, once-per-process forward replication from a source topic to
//! a destination topic under a transformation (§4.6).
//!
//! Unlike the reference design, a `Migrator` here never needs a deferred
//! "destination" thunk to break a construction cycle: a topic name is a
//! pure function of `(name, schema-string, nonce, aggregate?)`, so the
//! destination topic's name is computed once, eagerly, at the moment an
//! [`crate::event_type::EventType`] operator builds the migrator — long
//! before (and independent of) the destination `EventType` value itself
//! existing. See DESIGN.md for the resolved open question.

use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::catchup::{CatchUpConsumer, CatchUpOptions};
use crate::error::{Result, SequentError};
use crate::logger::{Logger, NoopLogger, Severity};
use crate::topic::{ConsumerGroup, Envelope, Producer, RawEvent, StartPosition, Topic, TopicFactory};

/// Options threaded into a [`Migrator::run`] (and, by extension, every
/// suspending call downstream of it).
#[derive(Clone)]
pub struct RunOptions {
    pub logger: Arc<dyn Logger>,
    pub catch_up_options: CatchUpOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            logger: Arc::new(NoopLogger),
            catch_up_options: CatchUpOptions::default(),
        }
    }
}

/// A live replicator holding the source consumer and destination producer.
/// Cancelling (or dropping) it stops the background tail loop.
pub struct RunningMigration {
    cancel: CancellationToken,
}

impl RunningMigration {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RunningMigration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Type-erased handle stored in an `EventType`'s migrator chain. Each link
/// only needs to know the source/destination topic names (both pure
/// functions of already-known data) and how to transform one payload into
/// zero-or-more destination payloads.
#[async_trait]
pub trait MigratorHandle: Send + Sync {
    fn source_topic_name(&self) -> &str;
    fn destination_topic_name(&self) -> &str;

    /// Idempotent: concurrent/repeated calls return the same
    /// `RunningMigration`, resolving once the migrator has caught up with
    /// its source (P10).
    async fn run(&self, factory: Arc<dyn TopicFactory>, opts: RunOptions) -> Result<Arc<RunningMigration>>;
}

/// Forward replicator from `source_topic_name` to `destination_topic_name`,
/// applying `transform` (flatMap semantics: zero, one, or many outputs per
/// input) to each event's JSON payload.
pub struct Migrator {
    source_topic_name: String,
    destination_topic_name: String,
    transform: Arc<dyn Fn(Value) -> AnyResult<Vec<Value>> + Send + Sync>,
    run_cell: OnceCell<Arc<RunningMigration>>,
}

impl Migrator {
    pub fn new(
        source_topic_name: impl Into<String>,
        destination_topic_name: impl Into<String>,
        transform: Arc<dyn Fn(Value) -> AnyResult<Vec<Value>> + Send + Sync>,
    ) -> Self {
        Self {
            source_topic_name: source_topic_name.into(),
            destination_topic_name: destination_topic_name.into(),
            transform,
            run_cell: OnceCell::new(),
        }
    }
}

#[async_trait]
impl MigratorHandle for Migrator {
    fn source_topic_name(&self) -> &str {
        &self.source_topic_name
    }

    fn destination_topic_name(&self) -> &str {
        &self.destination_topic_name
    }

    async fn run(&self, factory: Arc<dyn TopicFactory>, opts: RunOptions) -> Result<Arc<RunningMigration>> {
        self.run_cell
            .get_or_try_init(|| self.run_once(factory, opts))
            .await
            .cloned()
    }
}

impl Migrator {
    async fn run_once(&self, factory: Arc<dyn TopicFactory>, opts: RunOptions) -> Result<Arc<RunningMigration>> {
        let source_topic = factory
            .make(&self.source_topic_name)
            .await
            .map_err(SequentError::Substrate)?;
        let destination_topic = factory
            .make(&self.destination_topic_name)
            .await
            .map_err(SequentError::Substrate)?;

        let group_name = format!("{}-{}", self.source_topic_name, self.destination_topic_name);
        let raw_consumer = source_topic
            .consumer(ConsumerGroup::named(group_name, StartPosition::Beginning))
            .await
            .map_err(SequentError::Substrate)?;
        let catchup = Arc::new(
            CatchUpConsumer::new(raw_consumer, opts.catch_up_options).with_logger(opts.logger.clone()),
        );
        let destination_producer: Arc<dyn Producer> =
            Arc::from(destination_topic.producer().await.map_err(SequentError::Substrate)?);

        let cancel = CancellationToken::new();

        // Replicate inline until caught up, so a failure here surfaces
        // directly to whoever is awaiting `run` (§7: "the Migrator's
        // ready-future rejects if not yet caught up").
        while !catchup.is_caught_up() {
            match catchup.consume(&cancel).await.map_err(SequentError::Substrate)? {
                Some(envelope) => {
                    self.replicate_one(&destination_producer, envelope, &opts.logger)
                        .await?;
                }
                None => break,
            }
        }

        opts.logger.log(
            Severity::Info,
            "migrator caught up",
            Some(&serde_json::json!({
                "source": self.source_topic_name,
                "destination": self.destination_topic_name,
            })),
        );

        // Keep tailing in the background; errors past this point are
        // logged and stop the tail loop, since no caller remains to
        // propagate them to.
        let tail_catchup = catchup.clone();
        let tail_cancel = cancel.clone();
        let tail_producer = destination_producer.clone();
        let tail_transform = self.transform.clone();
        let tail_logger = opts.logger.clone();
        let source_name = self.source_topic_name.clone();
        let destination_name = self.destination_topic_name.clone();
        tokio::spawn(async move {
            loop {
                match tail_catchup.consume(&tail_cancel).await {
                    Ok(Some(envelope)) => {
                        if let Err(err) = replicate_with(
                            tail_transform.as_ref(),
                            tail_producer.as_ref(),
                            envelope,
                            &source_name,
                            &destination_name,
                        )
                        .await
                        {
                            tail_logger.log(
                                Severity::Error,
                                "migrator tail replication failed",
                                Some(&serde_json::json!({"error": err.to_string()})),
                            );
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tail_logger.log(
                            Severity::Error,
                            "migrator tail consume failed",
                            Some(&serde_json::json!({"error": err.to_string()})),
                        );
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(RunningMigration { cancel }))
    }

    async fn replicate_one(
        &self,
        destination: &Arc<dyn Producer>,
        envelope: Envelope,
        logger: &Arc<dyn Logger>,
    ) -> Result<()> {
        replicate_with(
            self.transform.as_ref(),
            destination.as_ref(),
            envelope,
            &self.source_topic_name,
            &self.destination_topic_name,
        )
        .await
        .map_err(|err| {
            logger.log(
                Severity::Error,
                "migrator replication failed",
                Some(&serde_json::json!({"error": err.to_string()})),
            );
            err
        })
    }
}

/// Applies `transform` to one envelope's payload and republishes every
/// output, preserving the original timestamp and partition key (§4.6 step
/// 5). Acks on full success; nacks and returns a `MigratorFailure` on any
/// transform or produce error.
async fn replicate_with(
    transform: &(dyn Fn(Value) -> AnyResult<Vec<Value>> + Send + Sync),
    destination: &dyn Producer,
    envelope: Envelope,
    source_topic: &str,
    destination_topic: &str,
) -> Result<()> {
    let outputs = match transform(envelope.event.message.clone()).context("applying migrator transform") {
        Ok(outputs) => outputs,
        Err(err) => {
            envelope.nack().await;
            return Err(SequentError::MigratorFailure {
                source_topic: source_topic.to_string(),
                destination_topic: destination_topic.to_string(),
                source: err,
            });
        }
    };

    for output in outputs {
        let raw = RawEvent::new(envelope.event.timestamp_ms, output);
        if let Err(err) = destination.produce(raw, envelope.key.clone()).await {
            envelope.nack().await;
            return Err(SequentError::MigratorFailure {
                source_topic: source_topic.to_string(),
                destination_topic: destination_topic.to_string(),
                source: err,
            });
        }
    }

    envelope.ack().await;
    Ok(())
}
