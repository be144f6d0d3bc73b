//! Transaction Context
//!
//! Per-request state for one profiled unit of work: name, service, custom
//! variables, collected error events, sampling tier, and the span tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sampling::SamplingTier;
use crate::span::{Scalar, Span, SpanData, SpanTree};

/// Root span category for every traced transaction
pub const ROOT_CATEGORY: &str = "app";

/// Kind of a recorded error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unrecoverable error that ended the transaction
    Fatal,
    /// Caught error reported by the host application
    Exception,
}

/// An error recorded against the running transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Error kind
    pub kind: ErrorKind,
    /// Error message
    pub message: String,
    /// Source file, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Source line, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// A sealed transaction, ready for export
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Random 64-bit transaction id
    pub id: u64,
    /// Transaction name
    pub name: String,
    /// Service name, when set
    pub service_name: Option<String>,
    /// Sampling tier the transaction ran at
    pub tier: SamplingTier,
    /// Custom variables, last write wins per key
    pub custom_variables: BTreeMap<String, Scalar>,
    /// Recorded error events
    pub errors: Vec<ErrorEvent>,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Total duration in microseconds
    pub duration_us: u64,
    /// The span tree; absent in wall-time-only mode
    pub spans: Option<SpanData>,
}

/// State of one in-flight transaction.
///
/// Created by `start`, sealed by `stop`. All mutators are tolerant: they
/// never fail, so instrumentation code needs no defensive checks.
pub struct TransactionContext {
    id: u64,
    name: Option<String>,
    service_name: Option<String>,
    tier: SamplingTier,
    custom_variables: BTreeMap<String, Scalar>,
    errors: Vec<ErrorEvent>,
    started_at: DateTime<Utc>,
    tree: Option<SpanTree>,
}

impl TransactionContext {
    /// Create a context for a transaction sampled at the given tier.
    ///
    /// A span tree (with a started root span) is allocated whenever the
    /// tier collects any data; in wall-time-only mode it only carries the
    /// root timer.
    pub fn new(tier: SamplingTier, service_name: Option<String>) -> Self {
        let tree = if tier.is_profiling() {
            Some(SpanTree::new(ROOT_CATEGORY))
        } else {
            None
        };

        Self {
            id: rand::random::<u64>(),
            name: None,
            service_name,
            tier,
            custom_variables: BTreeMap::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            tree,
        }
    }

    /// The transaction id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The sampling tier
    pub fn tier(&self) -> SamplingTier {
        self.tier
    }

    /// True when span creation is meaningful
    pub fn is_tracing(&self) -> bool {
        self.tier.is_tracing()
    }

    /// Set the transaction name; last write wins
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Set the service name; last write wins
    pub fn set_service_name(&mut self, name: impl Into<String>) {
        self.service_name = Some(name.into());
    }

    /// Set a custom variable from an already-typed scalar
    pub fn set_custom_variable(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.custom_variables.insert(name.into(), value.into());
    }

    /// Set a custom variable from a JSON value.
    ///
    /// Arrays and objects are silently dropped; only scalar values are
    /// retained. The key `"url"` is ordinary to the core.
    pub fn set_custom_variable_json(&mut self, name: impl Into<String>, value: &serde_json::Value) {
        let name = name.into();
        match Scalar::from_json(value) {
            Some(scalar) => {
                self.custom_variables.insert(name, scalar);
            }
            None => {
                tracing::debug!(%name, "non-scalar custom variable dropped");
            }
        }
    }

    /// Record an error event against this transaction
    pub fn record_error(&mut self, event: ErrorEvent) {
        self.errors.push(event);
    }

    /// Create a span; returns the inert handle when not tracing
    pub fn create_span(&self, category: &str) -> Span {
        match &self.tree {
            Some(tree) if self.tier.is_tracing() => tree.create_span(category),
            _ => Span::null(),
        }
    }

    /// The live span tree, when tracing
    pub fn tree(&self) -> Option<&SpanTree> {
        self.tree.as_ref().filter(|_| self.tier.is_tracing())
    }

    /// Seal the transaction.
    ///
    /// Finalizes the root timer if still running. Returns `None` when the
    /// tier is `Off` (nothing was collected) or when no transaction name
    /// was set: the collected data is discarded entirely, a data-quality
    /// gate rather than an error.
    pub fn seal(self) -> Option<Transaction> {
        let duration_us = match &self.tree {
            Some(tree) => {
                tree.finalize();
                tree.root_duration_us().unwrap_or(0)
            }
            None => 0,
        };

        if !self.tier.is_profiling() {
            return None;
        }

        let Some(name) = self.name else {
            tracing::debug!(
                id = self.id,
                "transaction discarded: no transaction name was set"
            );
            return None;
        };

        let spans = match (&self.tree, self.tier.is_tracing()) {
            (Some(tree), true) => Some(tree.collect()),
            _ => None,
        };

        Some(Transaction {
            id: self.id,
            name,
            service_name: self.service_name,
            tier: self.tier,
            custom_variables: self.custom_variables,
            errors: self.errors,
            started_at: self.started_at,
            duration_us,
            spans,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_without_name_discards() {
        let mut context = TransactionContext::new(SamplingTier::FullTrace, None);
        context.set_custom_variable("user_id", 42i64);

        assert!(context.seal().is_none());
    }

    #[test]
    fn test_seal_with_name_exports() {
        let mut context = TransactionContext::new(SamplingTier::FullTrace, None);
        context.set_name("checkout");

        let transaction = context.seal().expect("transaction should seal");
        assert_eq!(transaction.name, "checkout");
        assert_eq!(transaction.tier, SamplingTier::FullTrace);
        assert!(transaction.spans.is_some());
    }

    #[test]
    fn test_last_name_write_wins() {
        let mut context = TransactionContext::new(SamplingTier::WallTimeOnly, None);
        context.set_name("first");
        context.set_name("second");
        context.set_service_name("svc-a");
        context.set_service_name("svc-b");

        let transaction = context.seal().unwrap();
        assert_eq!(transaction.name, "second");
        assert_eq!(transaction.service_name.as_deref(), Some("svc-b"));
    }

    #[test]
    fn test_non_scalar_custom_variable_dropped() {
        let mut context = TransactionContext::new(SamplingTier::FullTrace, None);

        context.set_custom_variable_json("payload", &serde_json::json!({"a": 1}));
        context.set_custom_variable_json("items", &serde_json::json!([1, 2, 3]));
        context.set_name("tx");

        let transaction = context.seal().unwrap();
        assert!(transaction.custom_variables.is_empty());
    }

    #[test]
    fn test_scalar_custom_variables_retained() {
        let mut context = TransactionContext::new(SamplingTier::FullTrace, None);

        context.set_custom_variable_json("url", &serde_json::json!("/checkout"));
        context.set_custom_variable("retries", 2i64);
        context.set_custom_variable("retries", 3i64);
        context.set_name("tx");

        let transaction = context.seal().unwrap();
        assert_eq!(
            transaction.custom_variables.get("url"),
            Some(&Scalar::from("/checkout"))
        );
        assert_eq!(
            transaction.custom_variables.get("retries"),
            Some(&Scalar::Int(3))
        );
    }

    #[test]
    fn test_create_span_inert_when_not_tracing() {
        let context = TransactionContext::new(SamplingTier::WallTimeOnly, None);
        assert!(context.create_span("sql").is_null());

        let context = TransactionContext::new(SamplingTier::Off, None);
        assert!(context.create_span("sql").is_null());
    }

    #[test]
    fn test_wall_time_only_has_duration_but_no_spans() {
        let mut context = TransactionContext::new(SamplingTier::WallTimeOnly, None);
        context.set_name("worker");

        let transaction = context.seal().unwrap();
        assert!(transaction.spans.is_none());
        assert_eq!(transaction.tier, SamplingTier::WallTimeOnly);
    }

    #[test]
    fn test_off_tier_discards_even_when_named() {
        let mut context = TransactionContext::new(SamplingTier::Off, None);
        context.set_name("tx");

        assert!(context.seal().is_none());
    }

    #[test]
    fn test_record_error() {
        let mut context = TransactionContext::new(SamplingTier::FullTrace, None);
        context.set_name("tx");
        context.record_error(ErrorEvent {
            kind: ErrorKind::Fatal,
            message: "segfault".to_string(),
            file: Some("worker.rs".to_string()),
            line: Some(10),
        });

        let transaction = context.seal().unwrap();
        assert_eq!(transaction.errors.len(), 1);
        assert_eq!(transaction.errors[0].kind, ErrorKind::Fatal);
    }

    #[test]
    fn test_service_name_default_from_config() {
        let mut context =
            TransactionContext::new(SamplingTier::FullTrace, Some("billing".to_string()));
        context.set_name("tx");

        let transaction = context.seal().unwrap();
        assert_eq!(transaction.service_name.as_deref(), Some("billing"));
    }
}
