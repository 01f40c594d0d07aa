//! Wraps a raw [`Consumer`] to detect the transition from "replaying
//! history" to "tailing live" (§4.4), latching the transition exactly once
//! and emitting periodic throughput telemetry in the meantime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::logger::{Logger, NoopLogger, Severity};
use crate::topic::{Consumer, Envelope};

/// Tunables controlling catch-up latching and the N-way merge's peek
/// timeout (§5). `catch_up_idle_ms` drives both. `Deserialize` so a host
/// application can load these from its own config file alongside the rest
/// of its settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CatchUpOptions {
    pub progress_log_interval_ms: i64,
    pub catch_up_idle_ms: i64,
}

impl Default for CatchUpOptions {
    fn default() -> Self {
        Self {
            progress_log_interval_ms: 3000,
            catch_up_idle_ms: 1000,
        }
    }
}

impl CatchUpOptions {
    /// The N-way merge's default `peek` timeout: `0.7 * catch_up_idle_ms`.
    pub fn peek_timeout_ms(&self) -> i64 {
        (self.catch_up_idle_ms as f64 * 0.7) as i64
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wraps an inner [`Consumer`], latching `caught_up` the first time a
/// delivered event is recent, the inner consume idles past
/// `catch_up_idle_ms`, or the cancel token fires — whichever comes first.
pub struct CatchUpConsumer {
    inner: Box<dyn Consumer>,
    options: CatchUpOptions,
    caught_up: AtomicBool,
    progress_counter: AtomicU64,
    last_progress_log: Mutex<Instant>,
    on_catch_up: Option<Arc<dyn Fn() + Send + Sync>>,
    logger: Arc<dyn Logger>,
}

impl CatchUpConsumer {
    pub fn new(inner: Box<dyn Consumer>, options: CatchUpOptions) -> Self {
        Self {
            inner,
            options,
            caught_up: AtomicBool::new(false),
            progress_counter: AtomicU64::new(0),
            last_progress_log: Mutex::new(Instant::now()),
            on_catch_up: None,
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Registers the callback invoked exactly once (P9) when this consumer
    /// latches caught-up.
    pub fn on_catch_up(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_catch_up = Some(Arc::new(callback));
        self
    }

    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::SeqCst)
    }

    fn latch(&self, reason: &'static str) {
        if !self.caught_up.swap(true, Ordering::SeqCst) {
            self.logger.log(
                Severity::Info,
                "consumer caught up",
                Some(&json!({"reason": reason})),
            );
            if let Some(cb) = &self.on_catch_up {
                cb();
            }
        }
    }

    async fn maybe_log_progress(&self) {
        let mut last = self.last_progress_log.lock().await;
        if last.elapsed() >= Duration::from_millis(self.options.progress_log_interval_ms as u64) {
            self.logger.log(
                Severity::Debug,
                "ingestion progress",
                Some(&json!({"events": self.progress_counter.load(Ordering::SeqCst)})),
            );
            *last = Instant::now();
        }
    }
}

#[async_trait]
impl Consumer for CatchUpConsumer {
    async fn consume(&self, cancel: &CancellationToken) -> Result<Option<Envelope>> {
        let inner_fut = self.inner.consume(cancel);
        tokio::pin!(inner_fut);

        loop {
            if self.caught_up.load(Ordering::SeqCst) {
                return self.finish(inner_fut.await).await;
            }

            let idle = tokio::time::sleep(Duration::from_millis(self.options.catch_up_idle_ms as u64));
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.latch("cancelled");
                    return Ok(None);
                }
                _ = idle => {
                    self.latch("idle");
                    // keep waiting for the in-flight consume; only the
                    // latch fires early, delivery still completes normally.
                }
                res = &mut inner_fut => {
                    return self.finish(res).await;
                }
            }
        }
    }
}

impl CatchUpConsumer {
    async fn finish(&self, res: Result<Option<Envelope>>) -> Result<Option<Envelope>> {
        match res? {
            Some(envelope) => {
                self.progress_counter.fetch_add(1, Ordering::SeqCst);
                self.maybe_log_progress().await;
                if !self.caught_up.load(Ordering::SeqCst)
                    && now_ms() - envelope.event.timestamp_ms <= self.options.catch_up_idle_ms
                {
                    self.latch("recency");
                }
                Ok(Some(envelope))
            }
            None => {
                self.latch("shutdown");
                Ok(None)
            }
        }
    }
}
