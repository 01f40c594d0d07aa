//! Declarative read-model binding of event types to a projection client,
//! the N-way catch-up-aware ingestion scheduler that drives it, and the
//! client-factory contract an application substrate implements (§4.7, §6).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, select_all, BoxFuture};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catchup::CatchUpConsumer;
use crate::error::{Result, SequentError};
use crate::event_type::EventType;
use crate::logger::Severity;
use crate::migrator::RunOptions;
use crate::naming::{sha1_hex, CasingPolicy};
use crate::topic::{Consumer, ConsumerGroup, Envelope, StartPosition, Topic, TopicFactory};

/// The substrate capability a `ReadModel` projects into: how to name and
/// construct the namespaced client, and an optional post-catch-up hook.
#[async_trait]
pub trait ReadModelClientFactory: Send + Sync {
    type Client;

    fn naming_convention(&self) -> CasingPolicy;
    fn suffix_separator(&self) -> &str;
    async fn make(&self, namespace: &str) -> anyhow::Result<Arc<Self::Client>>;

    async fn on_catch_up(&self, _client: &Arc<Self::Client>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct IngestorSpec<Client> {
    identity: String,
    topic_name: String,
    handle: Arc<dyn Fn(Value, Arc<Client>, Option<Vec<u8>>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
}

struct InitializerSpec<Client> {
    identity: String,
    init: Arc<dyn Fn(Arc<Client>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
}

struct ReadModelInner<Client> {
    name: String,
    ingestors: Vec<Arc<IngestorSpec<Client>>>,
    initializers: Vec<Arc<InitializerSpec<Client>>>,
}

/// An immutable declaration of ingestors and initializers bound to a named
/// projection. Every builder method returns a new value; `self` remains
/// valid (§4.7).
pub struct ReadModel<Client> {
    inner: Arc<ReadModelInner<Client>>,
}

impl<Client> Clone for ReadModel<Client> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<Client> ReadModel<Client>
where
    Client: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ReadModelInner {
                name: name.into(),
                ingestors: Vec::new(),
                initializers: Vec::new(),
            }),
        }
    }

    /// Binds `event_type` to `handler`, invoked once per event ingested
    /// from its topic. `tag` disambiguates handlers whose event type and
    /// nonce are otherwise identical (e.g. two ingestors on the same type)
    /// for namespace hashing purposes — there is no portable way to
    /// stringify an arbitrary Rust closure, so the caller names it.
    pub fn on<T, H, Fut>(mut self, event_type: &EventType<T>, tag: impl Into<String>, nonce: Option<i64>, handler: H) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
        H: Fn(T, Arc<Client>, Option<Vec<u8>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let effective_nonce = nonce.unwrap_or(0);
        let identity = format!("{}{}{}", event_type.string(), effective_nonce, tag.into());
        let topic_name = event_type.topic_name();
        let handler = Arc::new(handler);
        let handle: Arc<dyn Fn(Value, Arc<Client>, Option<Vec<u8>>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync> =
            Arc::new(move |value: Value, client: Arc<Client>, key: Option<Vec<u8>>| {
                let handler = handler.clone();
                Box::pin(async move {
                    let typed: T = serde_json::from_value(value)?;
                    handler(typed, client, key).await
                })
            });

        let mut ingestors = self.inner.ingestors.clone();
        ingestors.push(Arc::new(IngestorSpec {
            identity,
            topic_name,
            handle,
        }));
        self.inner = Arc::new(ReadModelInner {
            name: self.inner.name.clone(),
            ingestors,
            initializers: self.inner.initializers.clone(),
        });
        self
    }

    /// Registers an initializer run once, in registration order, before
    /// any ingestor starts (§4.7 step 3).
    pub fn on_init<H, Fut>(mut self, tag: impl Into<String>, nonce: Option<i64>, init: H) -> Self
    where
        H: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let effective_nonce = nonce.unwrap_or(0);
        let identity = format!("{}{}", tag.into(), effective_nonce);
        let init = Arc::new(init);
        let init_fn: Arc<dyn Fn(Arc<Client>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync> = Arc::new(move |client| {
            let init = init.clone();
            Box::pin(async move { init(client).await })
        });

        let mut initializers = self.inner.initializers.clone();
        initializers.push(Arc::new(InitializerSpec { identity, init: init_fn }));
        self.inner = Arc::new(ReadModelInner {
            name: self.inner.name.clone(),
            ingestors: self.inner.ingestors.clone(),
            initializers,
        });
        self
    }

    /// `namingConvention(name) + sep + SHA1_hex(initializers ++ ingestors)`
    /// (§3, §4.7 step 1): any change to what's registered yields a fresh
    /// namespace, forcing re-projection from scratch (P6).
    pub fn namespace(&self, naming_convention: CasingPolicy, suffix_separator: &str) -> String {
        let mut concat = String::new();
        for init in &self.inner.initializers {
            concat.push_str(&init.identity);
        }
        for ingestor in &self.inner.ingestors {
            concat.push_str(&ingestor.identity);
        }
        format!(
            "{}{}{}",
            naming_convention.apply(&self.inner.name),
            suffix_separator,
            sha1_hex(&concat)
        )
    }

    /// Runs initializers, opens one catch-up-aware consumer per ingestor,
    /// and spawns the N-way merge loop in the background. Suspends until
    /// every ingestor has caught up, then returns the client.
    pub async fn start<F>(&self, topic_factory: Arc<dyn TopicFactory>, client_factory: Arc<F>, opts: RunOptions) -> Result<Arc<Client>>
    where
        F: ReadModelClientFactory<Client = Client> + 'static,
    {
        let namespace = self.namespace(client_factory.naming_convention(), client_factory.suffix_separator());
        let client = client_factory.make(&namespace).await.map_err(SequentError::Substrate)?;

        for initializer in &self.inner.initializers {
            (initializer.init)(client.clone()).await.map_err(SequentError::Substrate)?;
        }

        let cancel = CancellationToken::new();
        let mut runtimes = Vec::with_capacity(self.inner.ingestors.len());
        let mut ready_receivers = Vec::with_capacity(self.inner.ingestors.len());

        for ingestor in &self.inner.ingestors {
            let topic = topic_factory.make(&ingestor.topic_name).await.map_err(SequentError::Substrate)?;
            let group = ConsumerGroup::named(format!("{namespace}-{}", ingestor.topic_name), StartPosition::Beginning);
            let raw_consumer = topic.consumer(group).await.map_err(SequentError::Substrate)?;

            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
            let ready_tx = Arc::new(StdMutex::new(Some(ready_tx)));
            let catchup = CatchUpConsumer::new(raw_consumer, opts.catch_up_options)
                .with_logger(opts.logger.clone())
                .on_catch_up(move || {
                    if let Some(tx) = ready_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                });

            runtimes.push(IngestorRuntime {
                identity: ingestor.identity.clone(),
                handle: ingestor.handle.clone(),
                prefetch: Prefetch::new(Arc::new(catchup), cancel.clone()),
            });
            ready_receivers.push(ready_rx);
        }

        let peek_timeout = Duration::from_millis(opts.catch_up_options.peek_timeout_ms().max(0) as u64);
        let merge = Arc::new(MultiConsumerIngestor {
            ingestors: runtimes,
            client: client.clone(),
            peek_timeout,
        });

        let task_merge = merge.clone();
        let task_logger = opts.logger.clone();
        tokio::spawn(async move { task_merge.run(task_logger).await });

        join_all(ready_receivers).await;
        opts.logger.log(
            Severity::Info,
            "ingestor caught up",
            Some(&serde_json::json!({"readModel": self.inner.name})),
        );
        client_factory.on_catch_up(&client).await.map_err(SequentError::Substrate)?;

        Ok(client)
    }
}

type ConsumeResult = anyhow::Result<Option<Envelope>>;

enum PrefetchState {
    Pending(JoinHandle<ConsumeResult>),
    Ready(ConsumeResult),
    Taken,
}

/// Keeps exactly one `consume` call in flight per ingestor, so the N-way
/// merge never pays consume latency twice for the same stream (§4.7.1).
struct Prefetch {
    consumer: Arc<CatchUpConsumer>,
    cancel: CancellationToken,
    state: AsyncMutex<PrefetchState>,
    ended: AtomicBool,
}

impl Prefetch {
    fn new(consumer: Arc<CatchUpConsumer>, cancel: CancellationToken) -> Self {
        let state = Self::spawn(&consumer, &cancel);
        Self {
            consumer,
            cancel,
            state: AsyncMutex::new(state),
            ended: AtomicBool::new(false),
        }
    }

    fn spawn(consumer: &Arc<CatchUpConsumer>, cancel: &CancellationToken) -> PrefetchState {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        PrefetchState::Pending(tokio::spawn(async move { consumer.consume(&cancel).await }))
    }

    /// The prefetched envelope's timestamp if it resolved within `timeout`
    /// to an event; `None` if still pending, or if it resolved terminally
    /// (ended/errored — check `is_ended` to tell those apart from timeout).
    async fn peek(&self, timeout: Duration) -> Option<i64> {
        let mut guard = self.state.lock().await;
        match &mut *guard {
            PrefetchState::Ready(res) => Self::timestamp_of(res),
            PrefetchState::Taken => {
                self.ended.store(true, Ordering::SeqCst);
                None
            }
            PrefetchState::Pending(handle) => match tokio::time::timeout(timeout, handle).await {
                Ok(join_result) => {
                    let resolved = join_result.unwrap_or_else(|e| Err(anyhow::anyhow!("prefetch task panicked: {e}")));
                    let ts = Self::timestamp_of(&resolved);
                    if ts.is_none() {
                        self.ended.store(true, Ordering::SeqCst);
                    }
                    *guard = PrefetchState::Ready(resolved);
                    ts
                }
                Err(_elapsed) => None,
            },
        }
    }

    fn timestamp_of(res: &ConsumeResult) -> Option<i64> {
        match res {
            Ok(Some(envelope)) => Some(envelope.event.timestamp_ms),
            _ => None,
        }
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Waits unboundedly for the prefetch, consumes it, and — unless the
    /// stream ended — starts the next one.
    async fn take(&self) -> ConsumeResult {
        let mut guard = self.state.lock().await;
        let resolved = match std::mem::replace(&mut *guard, PrefetchState::Taken) {
            PrefetchState::Ready(res) => res,
            PrefetchState::Pending(handle) => handle.await.unwrap_or_else(|e| Err(anyhow::anyhow!("prefetch task panicked: {e}"))),
            PrefetchState::Taken => Err(anyhow::anyhow!("take() called on an already-taken prefetch")),
        };
        match &resolved {
            Ok(Some(_)) => *guard = Self::spawn(&self.consumer, &self.cancel),
            _ => self.ended.store(true, Ordering::SeqCst),
        }
        resolved
    }
}

struct IngestorRuntime<Client> {
    identity: String,
    handle: Arc<dyn Fn(Value, Arc<Client>, Option<Vec<u8>>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
    prefetch: Prefetch,
}

enum NextOutcome {
    Ingested,
    Stopped,
}

/// N-way time-ordered merge over every ingestor's prefetch (§4.7.1).
struct MultiConsumerIngestor<Client> {
    ingestors: Vec<IngestorRuntime<Client>>,
    client: Arc<Client>,
    peek_timeout: Duration,
}

impl<Client> MultiConsumerIngestor<Client>
where
    Client: Send + Sync + 'static,
{
    async fn run(&self, logger: Arc<dyn crate::logger::Logger>) {
        loop {
            match self.next().await {
                Ok(NextOutcome::Ingested) => continue,
                Ok(NextOutcome::Stopped) => break,
                Err(err) => {
                    logger.log(
                        Severity::Error,
                        "ingestor failed",
                        Some(&serde_json::json!({"error": err.to_string()})),
                    );
                    break;
                }
            }
        }
    }

    async fn next(&self) -> Result<NextOutcome> {
        if self.ingestors.is_empty() {
            return Ok(NextOutcome::Stopped);
        }
        loop {
            let timestamps = join_all(self.ingestors.iter().map(|ingestor| ingestor.prefetch.peek(self.peek_timeout))).await;

            if let Some(idx) = self.ingestors.iter().position(|ingestor| ingestor.prefetch.is_ended()) {
                return self.finish(idx).await;
            }

            let earliest = timestamps
                .iter()
                .enumerate()
                .filter_map(|(i, ts)| ts.map(|t| (i, t)))
                .min_by_key(|(i, ts)| (*ts, *i));

            if let Some((idx, _)) = earliest {
                return self.ingest(idx).await;
            }

            self.wait_for_any().await;
        }
    }

    async fn wait_for_any(&self) {
        let futures: Vec<_> = self
            .ingestors
            .iter()
            .map(|ingestor| Box::pin(ingestor.prefetch.peek(Duration::from_secs(u64::MAX))) as BoxFuture<'_, Option<i64>>)
            .collect();
        let _ = select_all(futures).await;
    }

    async fn finish(&self, idx: usize) -> Result<NextOutcome> {
        match self.ingestors[idx].prefetch.take().await {
            Ok(None) => Ok(NextOutcome::Stopped),
            Ok(Some(_)) => Ok(NextOutcome::Ingested),
            Err(err) => Err(SequentError::Substrate(err)),
        }
    }

    async fn ingest(&self, idx: usize) -> Result<NextOutcome> {
        let ingestor = &self.ingestors[idx];
        match ingestor.prefetch.take().await {
            Ok(Some(envelope)) => {
                let key = envelope.key.clone();
                let value = envelope.event.message.clone();
                match (ingestor.handle)(value, self.client.clone(), key).await {
                    Ok(()) => {
                        envelope.ack().await;
                        Ok(NextOutcome::Ingested)
                    }
                    Err(source) => {
                        envelope.nack().await;
                        Err(SequentError::IngestorFailure {
                            ingestor: ingestor.identity.clone(),
                            source,
                        })
                    }
                }
            }
            Ok(None) => Ok(NextOutcome::Stopped),
            Err(err) => Err(SequentError::Substrate(err)),
        }
    }
}
