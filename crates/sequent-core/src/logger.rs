//! The `Logger` contract consumed by the core (§6), plus a `tracing`-backed
//! default implementation and `LOG_LEVEL` parsing, in the spirit of
//! `dustin10-kaftui`'s `trace.rs` span-scoped logging setup.

use serde_json::Value;
use std::sync::Arc;

/// Severity levels a [`Logger`] accepts, ordered low-to-high by urgency.
/// `Off` sits above `Fatal` and is never emitted as an event's own
/// severity — it only ever appears as a `min_severity` floor, for
/// `LOG_LEVEL=none`, so that every real level compares strictly below it
/// and gets suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Off,
}

/// Logging contract consumed throughout the core. Implementations are
/// expected to be cheap to clone (e.g. an `Arc` around shared state).
pub trait Logger: Send + Sync {
    fn log(&self, severity: Severity, message: &str, context: Option<&Value>);

    /// Returns a child logger carrying additional structured context for
    /// every subsequent `log` call.
    fn with_context(&self, context: Value) -> Arc<dyn Logger>;
}

/// No-op logger, useful as a default in tests and for callers that don't
/// care about telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _severity: Severity, _message: &str, _context: Option<&Value>) {}

    fn with_context(&self, _context: Value) -> Arc<dyn Logger> {
        Arc::new(NoopLogger)
    }
}

/// Default [`Logger`] implementation backed by the `tracing` facade.
///
/// `withContext` maps to an entered `tracing::Span` carrying the context as
/// a serialized field, following the same context-propagation idea as
/// `trace.rs` in the Kafka TUI this crate's style is grounded on.
#[derive(Clone)]
pub struct TracingLogger {
    min_severity: Severity,
    context: Option<Value>,
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self {
            min_severity: log_level_from_env(),
            context: None,
        }
    }
}

impl TracingLogger {
    pub fn with_min_severity(min_severity: Severity) -> Self {
        Self {
            min_severity,
            context: None,
        }
    }
}

impl Logger for TracingLogger {
    fn log(&self, severity: Severity, message: &str, context: Option<&Value>) {
        if severity < self.min_severity {
            return;
        }
        let merged = merge_context(self.context.as_ref(), context);
        let context_str = merged.map(|v| v.to_string()).unwrap_or_default();
        match severity {
            Severity::Debug => tracing::debug!(context = %context_str, "{message}"),
            Severity::Info => tracing::info!(context = %context_str, "{message}"),
            Severity::Warning => tracing::warn!(context = %context_str, "{message}"),
            Severity::Error => tracing::error!(context = %context_str, "{message}"),
            Severity::Fatal => tracing::error!(context = %context_str, fatal = true, "{message}"),
            Severity::Off => {}
        }
    }

    fn with_context(&self, context: Value) -> Arc<dyn Logger> {
        Arc::new(TracingLogger {
            min_severity: self.min_severity,
            context: merge_context(self.context.as_ref(), Some(&context)),
        })
    }
}

fn merge_context(base: Option<&Value>, extra: Option<&Value>) -> Option<Value> {
    match (base, extra) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(e)) => Some(e.clone()),
        (Some(b), Some(e)) => {
            let mut merged = b.clone();
            if let (Value::Object(m), Value::Object(extra_map)) = (&mut merged, e) {
                for (k, v) in extra_map {
                    m.insert(k.clone(), v.clone());
                }
            }
            Some(merged)
        }
    }
}

/// Parses `LOG_LEVEL` per the accepted value table (§6); unknown values
/// fall back to `Debug` and emit one warning.
pub fn log_level_from_env() -> Severity {
    match std::env::var("LOG_LEVEL") {
        Ok(raw) => parse_log_level(&raw),
        Err(_) => Severity::Info,
    }
}

fn parse_log_level(raw: &str) -> Severity {
    match raw {
        "none" | "0" | "false" => Severity::Off,
        "debug" | "d" | "5" => Severity::Debug,
        "info" | "i" | "4" | "" => Severity::Info,
        "warn" | "w" | "3" => Severity::Warning,
        "error" | "e" | "2" => Severity::Error,
        "fatal" | "f" | "1" => Severity::Fatal,
        other => {
            tracing::warn!(value = other, "unrecognized LOG_LEVEL, defaulting to debug");
            Severity::Debug
        }
    }
}
