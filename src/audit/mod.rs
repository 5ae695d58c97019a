//! Hash-chained, append-only audit log.
//!
//! Every record commits to its predecessor: `hash = SHA-256(canonical JSON of
//! the record fields ∥ prev_hash)`. The first record links to
//! [`GENESIS_HASH`]. Recomputing the chain from genesis detects any edit,
//! reordering or deletion.

pub mod service;

pub use service::{AuditService, ChainReport};

use crate::error::IntegrityError;
use crate::schemas::{Thought, timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use strum::{Display, EnumString};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum AuditOutcome {
    Ok,
    Error,
    Deferred,
    Blocked,
}

/// What a caller asks to be recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub direction: Direction,
    /// Who the event concerns: an agent, a channel, a Wise Authority.
    pub stakeholder: String,
    pub action: String,
    pub correlation_id: Option<String>,
    pub thought_id: Option<String>,
    pub task_id: Option<String>,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub guardrail_hits: Vec<String>,
    #[serde(default)]
    pub detail: Value,
}

impl AuditEntry {
    pub fn new(
        direction: Direction,
        stakeholder: impl Into<String>,
        action: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            direction,
            stakeholder: stakeholder.into(),
            action: action.into(),
            correlation_id: None,
            thought_id: None,
            task_id: None,
            outcome,
            guardrail_hits: Vec::new(),
            detail: Value::Null,
        }
    }

    pub fn for_thought(mut self, thought: &Thought, correlation_id: impl Into<String>) -> Self {
        self.thought_id = Some(thought.thought_id.clone());
        self.task_id = Some(thought.source_task_id.clone());
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_hits(mut self, hits: Vec<String>) -> Self {
        self.guardrail_hits = hits;
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// One persisted link of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: i64,
    pub entry_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: AuditEntry,
    pub prev_hash: String,
    pub hash: String,
    #[serde(default)]
    pub signature: Option<String>,
}

impl AuditRecord {
    /// Recompute this record's hash from its fields and `prev_hash`.
    pub fn compute_hash(&self) -> Result<String, IntegrityError> {
        let material = json!({
            "sequence": self.sequence,
            "entry_id": self.entry_id,
            "recorded_at": timestamp(self.recorded_at),
            "direction": self.entry.direction,
            "stakeholder": self.entry.stakeholder,
            "action": self.entry.action,
            "correlation_id": self.entry.correlation_id,
            "thought_id": self.entry.thought_id,
            "task_id": self.entry.task_id,
            "outcome": self.entry.outcome,
            "guardrail_hits": self.entry.guardrail_hits,
            "detail": self.entry.detail,
        });
        let mut bytes = serde_json::to_vec(&material)
            .map_err(|e| IntegrityError::Storage(format!("unserialisable audit record: {e}")))?;
        bytes.extend_from_slice(self.prev_hash.as_bytes());
        Ok(hash_bytes(&bytes))
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Read-side filter. All bounds are optional and inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub stakeholder: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub correlation_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl AuditFilter {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// Read path over the audit log.
pub trait AuditQueryService: Send + Sync {
    fn query<'a>(
        &'a self,
        filter: &'a AuditFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuditRecord>, IntegrityError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(prev_hash: &str) -> AuditRecord {
        let mut record = AuditRecord {
            sequence: 1,
            entry_id: "e1".into(),
            recorded_at: Utc::now(),
            entry: AuditEntry::new(Direction::Outbound, "channel:local", "SPEAK", AuditOutcome::Ok)
                .with_detail(json!({"content": "hi"})),
            prev_hash: prev_hash.into(),
            hash: String::new(),
            signature: None,
        };
        record.hash = record.compute_hash().unwrap();
        record
    }

    #[test]
    fn genesis_is_64_zeros() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }

    #[test]
    fn hash_depends_on_predecessor() {
        let a = record(GENESIS_HASH);
        let mut b = a.clone();
        b.prev_hash = "f".repeat(64);
        assert_ne!(a.hash, b.compute_hash().unwrap());
    }

    #[test]
    fn hash_depends_on_every_field() {
        let a = record(GENESIS_HASH);
        let mut edited = a.clone();
        edited.entry.outcome = AuditOutcome::Error;
        assert_ne!(a.hash, edited.compute_hash().unwrap());

        let mut hits = a.clone();
        hits.entry.guardrail_hits.push("depth".into());
        assert_ne!(a.hash, hits.compute_hash().unwrap());
    }

    #[test]
    fn hash_is_stable() {
        let a = record(GENESIS_HASH);
        assert_eq!(a.hash, a.compute_hash().unwrap());
        assert_eq!(a.hash.len(), 64);
    }
}
