//! Transaction Export
//!
//! Serializes a sealed transaction into the wire format and hands it to
//! the transport collaborator. Exporting never raises: `stop()` may run
//! inside process-teardown paths where failures must stay invisible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::context::{ErrorEvent, Transaction};
use crate::sampling::SamplingTier;
use crate::span::{Scalar, SpanData};
use crate::transport::Transport;

/// Wire payload for one completed transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPayload {
    /// Transaction id as a 16-digit hex string
    pub id: String,
    /// Transaction name
    pub name: String,
    /// Service name, when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Sampling tier the transaction ran at
    pub tier: SamplingTier,
    /// Wall-clock start, RFC 3339
    pub started_at: DateTime<Utc>,
    /// Wall-clock start as unix microseconds
    pub start_unix_us: i64,
    /// Total duration in microseconds
    pub duration_us: u64,
    /// Custom variables
    pub custom_variables: BTreeMap<String, Scalar>,
    /// Recorded error events
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEvent>,
    /// API key for the collector, when configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Root span with nested children; absent in wall-time-only mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spans: Option<SpanData>,
}

impl TransactionPayload {
    /// Build the payload for a sealed transaction
    pub fn from_transaction(transaction: &Transaction, api_key: Option<&str>) -> Self {
        Self {
            id: format!("{:016x}", transaction.id),
            name: transaction.name.clone(),
            service_name: transaction.service_name.clone(),
            tier: transaction.tier,
            started_at: transaction.started_at,
            start_unix_us: transaction.started_at.timestamp_micros(),
            duration_us: transaction.duration_us,
            custom_variables: transaction.custom_variables.clone(),
            errors: transaction.errors.clone(),
            api_key: api_key.map(|k| k.to_string()),
            spans: transaction.spans.clone(),
        }
    }
}

/// Serializes sealed transactions and hands them to the transport
pub struct Exporter {
    transport: Box<dyn Transport>,
    api_key: Option<String>,
}

impl Exporter {
    /// Create an exporter over the given transport
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            api_key: None,
        }
    }

    /// Attach an API key to every payload
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Export one transaction.
    ///
    /// Serialization or transport failures drop the payload with a warning
    /// and never propagate to the caller.
    pub fn export(&self, transaction: &Transaction) {
        let payload = TransactionPayload::from_transaction(transaction, self.api_key.as_deref());

        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%err, name = %transaction.name, "payload serialization failed");
                return;
            }
        };

        if let Err(err) = self.transport.send(bytes) {
            tracing::warn!(
                %err,
                transport = self.transport.name(),
                name = %transaction.name,
                "payload dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TransactionContext;
    use crate::transport::MemoryTransport;

    fn sealed_transaction(name: &str) -> Transaction {
        let mut context = TransactionContext::new(SamplingTier::FullTrace, None);
        context.set_name(name);
        context.set_custom_variable("url", "/checkout");
        context.seal().expect("transaction should seal")
    }

    #[test]
    fn test_export_writes_one_payload() {
        let capture = MemoryTransport::new();
        let exporter = Exporter::new(Box::new(capture.clone()));

        exporter.export(&sealed_transaction("checkout"));

        assert_eq!(capture.len(), 1);
        let payload: TransactionPayload =
            serde_json::from_slice(&capture.payloads()[0]).expect("payload should parse");
        assert_eq!(payload.name, "checkout");
        assert_eq!(payload.tier, SamplingTier::FullTrace);
        assert_eq!(payload.id.len(), 16);
        assert!(payload.spans.is_some());
        assert_eq!(
            payload.custom_variables.get("url"),
            Some(&Scalar::from("/checkout"))
        );
    }

    #[test]
    fn test_export_attaches_api_key() {
        let capture = MemoryTransport::new();
        let exporter = Exporter::new(Box::new(capture.clone())).with_api_key("key-123");

        exporter.export(&sealed_transaction("tx"));

        let payload: TransactionPayload =
            serde_json::from_slice(&capture.payloads()[0]).unwrap();
        assert_eq!(payload.api_key.as_deref(), Some("key-123"));
    }

    #[test]
    fn test_transport_failure_never_raises() {
        struct FailingTransport;

        impl Transport for FailingTransport {
            fn send(&self, _payload: Vec<u8>) -> crate::error::Result<()> {
                Err(crate::error::MetronError::Transport("daemon down".to_string()))
            }

            fn name(&self) -> &'static str {
                "failing"
            }
        }

        let exporter = Exporter::new(Box::new(FailingTransport));
        exporter.export(&sealed_transaction("tx"));
    }

    #[test]
    fn test_payload_round_trip() {
        let transaction = sealed_transaction("round-trip");
        let payload = TransactionPayload::from_transaction(&transaction, None);

        let json = serde_json::to_string(&payload).unwrap();
        let parsed: TransactionPayload = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.name, payload.name);
        assert_eq!(parsed.start_unix_us, payload.start_unix_us);
        assert_eq!(parsed.duration_us, payload.duration_us);
    }
}
