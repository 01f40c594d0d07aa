//! Error taxonomy shared across the core. Every fallible core operation
//! returns [`SequentError`]; adapters are free to carry their own error
//! types and fold them into [`SequentError::Substrate`].

use std::fmt;

/// The error kinds a Sequent application can observe, per the error
/// handling design: schema violations never retry, ingestor/migrator
/// failures propagate and nack, substrate errors pass through verbatim,
/// and cancellation unwinds cleanly.
#[derive(Debug, thiserror::Error)]
pub enum SequentError {
    #[error("schema violation: {0}")]
    SchemaViolation(#[from] SchemaError),

    #[error("event type `{event_type}` is bound to an aggregate and requires a non-null `{id_field}` field")]
    MissingAggregateKey {
        event_type: String,
        id_field: String,
    },

    #[error("event type `{event_type}` is bound to an aggregate; callers must not supply an explicit partition key")]
    AggregateKeyConflict { event_type: String },

    #[error("ingestor `{ingestor}` failed: {source}")]
    IngestorFailure {
        ingestor: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("migrator `{source_topic}` -> `{destination_topic}` failed: {source}")]
    MigratorFailure {
        source_topic: String,
        destination_topic: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("substrate error: {0}")]
    Substrate(#[from] anyhow::Error),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SequentError>;

/// A tree-structured schema validation error. A single violation carries no
/// causes; two or more sibling violations (e.g. several missing required
/// fields) are collected into one node whose `causes` preserve field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub description: String,
    pub causes: Vec<SchemaError>,
}

impl SchemaError {
    pub fn leaf(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            causes: Vec::new(),
        }
    }

    /// Builds a `missing required "field"` leaf error.
    pub fn missing_required(field: &str) -> Self {
        Self::leaf(format!("missing required \"{field}\""))
    }

    /// Scopes an error one level deeper under a field or array index.
    pub fn at(path: impl fmt::Display, inner: SchemaError) -> Self {
        Self {
            description: format!("{path}: {}", inner.description),
            causes: inner.causes,
        }
    }

    /// Collects zero, one, or many sibling errors into a single result:
    /// `None` on zero, the lone error on one, and a tree node on two-or-more.
    pub fn collect(description: impl Into<String>, mut errors: Vec<SchemaError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(Self {
                description: description.into(),
                causes: errors,
            }),
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

impl SchemaError {
    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        writeln!(f, "{}{}", "  ".repeat(depth), self.description)?;
        for cause in &self.causes {
            cause.render(f, depth + 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for SchemaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_returns_none_on_empty() {
        assert!(SchemaError::collect("record", vec![]).is_none());
    }

    #[test]
    fn collect_propagates_single_error_directly() {
        let err = SchemaError::collect("record", vec![SchemaError::missing_required("id")]).unwrap();
        assert_eq!(err, SchemaError::missing_required("id"));
    }

    #[test]
    fn collect_wraps_multiple_errors_preserving_order() {
        let err = SchemaError::collect(
            "record",
            vec![
                SchemaError::missing_required("id"),
                SchemaError::missing_required("title"),
            ],
        )
        .unwrap();
        assert_eq!(err.causes.len(), 2);
        assert_eq!(err.causes[0].description, "missing required \"id\"");
        assert_eq!(err.causes[1].description, "missing required \"title\"");
    }

    #[test]
    fn display_indents_per_nesting_level() {
        let err = SchemaError::at(
            "title",
            SchemaError::collect(
                "union",
                vec![SchemaError::leaf("not a string"), SchemaError::leaf("not a number")],
            )
            .unwrap(),
        );
        let rendered = err.to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "title: union");
        assert_eq!(lines[1], "  not a string");
        assert_eq!(lines[2], "  not a number");
    }
}
