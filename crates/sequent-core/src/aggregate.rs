//! Aggregate namespace: a named partition boundary scoping a set of record
//! event types whose partition key is always derived from `id` (§4.8).

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::event_type::{EventProducer, EventType};
use crate::migrator::RunOptions;
use crate::readmodel::{ReadModel, ReadModelClientFactory};
use crate::topic::TopicFactory;

struct AggregateInner {
    name: String,
    topic_factory: Arc<dyn TopicFactory>,
}

#[derive(Clone)]
pub struct Aggregate {
    inner: Arc<AggregateInner>,
}

impl Aggregate {
    pub fn new(name: impl Into<String>, topic_factory: Arc<dyn TopicFactory>) -> Self {
        Self {
            inner: Arc::new(AggregateInner {
                name: name.into(),
                topic_factory,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn topic_factory(&self) -> Arc<dyn TopicFactory> {
        self.inner.topic_factory.clone()
    }

    /// Rebinds `event_type` under this aggregate and returns a producer for
    /// it, enforcing the record-with-`id` invariant and the key derivation
    /// rules of §4.5/§4.8.
    pub async fn use_event_type<T>(&self, event_type: &EventType<T>, opts: RunOptions) -> Result<EventProducer<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let bound = event_type.bound_to(self.clone())?;
        bound.producer(self.inner.topic_factory.clone(), opts).await
    }

    /// Begins building a read model whose ingestors run against this
    /// aggregate's topic factory, so consumer topic resolution stays
    /// consistent with how `use_event_type` named them.
    pub fn use_client_factory<F>(&self, client_factory: Arc<F>) -> AggregateReadModelBuilder<F>
    where
        F: ReadModelClientFactory,
    {
        AggregateReadModelBuilder {
            aggregate: self.clone(),
            client_factory,
        }
    }
}

pub struct AggregateReadModelBuilder<F: ReadModelClientFactory> {
    aggregate: Aggregate,
    client_factory: Arc<F>,
}

impl<F> AggregateReadModelBuilder<F>
where
    F: ReadModelClientFactory + 'static,
    F::Client: Send + Sync + 'static,
{
    pub async fn use_read_model(&self, read_model: &ReadModel<F::Client>, opts: RunOptions) -> Result<Arc<F::Client>> {
        read_model
            .start(self.aggregate.topic_factory(), self.client_factory.clone(), opts)
            .await
    }
}
