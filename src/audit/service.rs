use super::{
    AuditEntry, AuditFilter, AuditOutcome, AuditQueryService, AuditRecord, Direction, GENESIS_HASH,
};
use crate::authority::{SigningKey, verify_signature};
use crate::error::IntegrityError;
use crate::schemas::timestamp;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const AUDIT_COLUMNS: &str = "sequence, entry_id, recorded_at, direction, stakeholder, action,
     correlation_id, thought_id, task_id, outcome, guardrail_hits, detail, prev_hash, hash,
     signature";
const VERIFY_PAGE: i64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainTail {
    sequence: i64,
    hash: String,
}

impl ChainTail {
    fn genesis() -> Self {
        Self {
            sequence: 0,
            hash: GENESIS_HASH.to_string(),
        }
    }
}

/// Outcome of a full chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub records: u64,
    pub last_sequence: i64,
    pub last_hash: String,
    pub signatures_checked: u64,
}

/// Append-only audit log on SQLite.
///
/// Appends are serialised through one async mutex that also guards the
/// in-memory chain tail. Any continuity fault halts the service: further
/// appends fail with [`IntegrityError::Halted`] until restart.
pub struct AuditService {
    pool: SqlitePool,
    tail: Mutex<ChainTail>,
    halted: AtomicBool,
    signer: Option<SigningKey>,
}

impl AuditService {
    pub async fn new(pool: SqlitePool, signer: Option<SigningKey>) -> Result<Self, IntegrityError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_log (
                 sequence INTEGER PRIMARY KEY,
                 entry_id TEXT NOT NULL UNIQUE,
                 recorded_at TEXT NOT NULL,
                 direction TEXT NOT NULL,
                 stakeholder TEXT NOT NULL,
                 action TEXT NOT NULL,
                 correlation_id TEXT,
                 thought_id TEXT,
                 task_id TEXT,
                 outcome TEXT NOT NULL,
                 guardrail_hits TEXT NOT NULL DEFAULT '[]',
                 detail TEXT NOT NULL DEFAULT 'null',
                 prev_hash TEXT NOT NULL,
                 hash TEXT NOT NULL,
                 signature TEXT
             )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_recorded
                 ON audit_log(recorded_at, stakeholder, outcome)",
        )
        .execute(&pool)
        .await?;

        let tail = Self::persisted_tail(&pool).await?;
        tracing::debug!(sequence = tail.sequence, "audit chain opened");

        Ok(Self {
            pool,
            tail: Mutex::new(tail),
            halted: AtomicBool::new(false),
            signer,
        })
    }

    async fn persisted_tail(pool: &SqlitePool) -> Result<ChainTail, IntegrityError> {
        let last: Option<(i64, String)> =
            sqlx::query_as("SELECT sequence, hash FROM audit_log ORDER BY sequence DESC LIMIT 1")
                .fetch_optional(pool)
                .await?;
        Ok(last.map_or_else(ChainTail::genesis, |(sequence, hash)| ChainTail {
            sequence,
            hash,
        }))
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn halt(&self, reason: &str) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            tracing::error!(reason, "audit chain integrity fault; halting audit-dependent dispatch");
        }
    }

    /// Append `entry` after the current tail and return the stored record.
    pub async fn record(&self, entry: AuditEntry) -> Result<AuditRecord, IntegrityError> {
        if self.is_halted() {
            return Err(IntegrityError::Halted("audit log is halted".into()));
        }

        let mut tail = self.tail.lock().await;

        let persisted = Self::persisted_tail(&self.pool).await?;
        if persisted != *tail {
            self.halt("persisted tail diverged from in-memory tail");
            return Err(IntegrityError::ChainBreak {
                sequence: persisted.sequence,
            });
        }

        let mut record = AuditRecord {
            sequence: tail.sequence + 1,
            entry_id: Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            entry,
            prev_hash: tail.hash.clone(),
            hash: String::new(),
            signature: None,
        };
        record.hash = record.compute_hash()?;
        record.signature = self
            .signer
            .as_ref()
            .map(|key| key.sign(record.hash.as_bytes()));

        let hits = serde_json::to_string(&record.entry.guardrail_hits)
            .map_err(|e| IntegrityError::Storage(e.to_string()))?;
        let detail = serde_json::to_string(&record.entry.detail)
            .map_err(|e| IntegrityError::Storage(e.to_string()))?;

        sqlx::query(
            "INSERT INTO audit_log (sequence, entry_id, recorded_at, direction, stakeholder,
                 action, correlation_id, thought_id, task_id, outcome, guardrail_hits, detail,
                 prev_hash, hash, signature)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(record.sequence)
        .bind(&record.entry_id)
        .bind(timestamp(record.recorded_at))
        .bind(record.entry.direction.to_string())
        .bind(&record.entry.stakeholder)
        .bind(&record.entry.action)
        .bind(&record.entry.correlation_id)
        .bind(&record.entry.thought_id)
        .bind(&record.entry.task_id)
        .bind(record.entry.outcome.to_string())
        .bind(hits)
        .bind(detail)
        .bind(&record.prev_hash)
        .bind(&record.hash)
        .bind(&record.signature)
        .execute(&self.pool)
        .await?;

        tail.sequence = record.sequence;
        tail.hash = record.hash.clone();

        tracing::debug!(
            sequence = record.sequence,
            action = %record.entry.action,
            outcome = %record.entry.outcome,
            "audit record appended"
        );
        Ok(record)
    }

    /// Recompute the whole chain from genesis. With a signer configured every
    /// row must carry a valid signature. Any fault other than a storage
    /// error halts the service, unreadable rows included.
    pub async fn verify_chain(&self) -> Result<ChainReport, IntegrityError> {
        match self.walk_chain().await {
            Ok(report) => Ok(report),
            Err(err @ IntegrityError::Storage(_)) => Err(err),
            Err(err) => {
                self.halt(&err.to_string());
                Err(err)
            }
        }
    }

    async fn walk_chain(&self) -> Result<ChainReport, IntegrityError> {
        let mut expected_prev = GENESIS_HASH.to_string();
        let mut expected_sequence = 1_i64;
        let mut signatures_checked = 0_u64;
        let public_key = self.signer.as_ref().map(SigningKey::public_key_b64);

        loop {
            let rows = sqlx::query(&format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE sequence >= $1
                 ORDER BY sequence ASC LIMIT $2"
            ))
            .bind(expected_sequence)
            .bind(VERIFY_PAGE)
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let record = map_audit_row(row)?;
                if record.sequence != expected_sequence || record.prev_hash != expected_prev {
                    return Err(IntegrityError::ChainBreak {
                        sequence: record.sequence,
                    });
                }

                let computed = record.compute_hash()?;
                if computed != record.hash {
                    return Err(IntegrityError::HashMismatch {
                        sequence: record.sequence,
                        stored: record.hash,
                        computed,
                    });
                }

                if let Some(key) = &public_key {
                    let signature = record
                        .signature
                        .as_deref()
                        .ok_or(IntegrityError::BadSignature(record.sequence))?;
                    verify_signature(key, record.hash.as_bytes(), signature, "audit record")
                        .map_err(|_| IntegrityError::BadSignature(record.sequence))?;
                    signatures_checked += 1;
                }

                expected_prev = record.hash;
                expected_sequence += 1;
            }
        }

        Ok(ChainReport {
            records: u64::try_from(expected_sequence - 1).unwrap_or_default(),
            last_sequence: expected_sequence - 1,
            last_hash: expected_prev,
            signatures_checked,
        })
    }

    /// Periodically run [`AuditService::verify_chain`] until `cancel` fires.
    pub fn spawn_verifier(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.verify_chain().await {
                            Ok(report) => tracing::debug!(records = report.records, "audit chain verified"),
                            Err(err) => {
                                tracing::error!(error = %err, "audit chain verification failed");
                                if self.is_halted() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    pub async fn count(&self) -> Result<u64, IntegrityError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub async fn last_hash(&self) -> String {
        self.tail.lock().await.hash.clone()
    }

    pub async fn records_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<AuditRecord>, IntegrityError> {
        let filter = AuditFilter {
            correlation_id: Some(correlation_id.to_string()),
            limit: 1000,
            ..AuditFilter::default()
        };
        self.query(&filter).await
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl AuditQueryService for AuditService {
    fn query<'a>(
        &'a self,
        filter: &'a AuditFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuditRecord>, IntegrityError>> + Send + 'a>> {
        Box::pin(async move {
            let limit = if filter.limit == 0 { 100 } else { filter.limit };
            let rows = sqlx::query(&format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_log
                 WHERE ($1 IS NULL OR recorded_at >= $1)
                   AND ($2 IS NULL OR recorded_at <= $2)
                   AND ($3 IS NULL OR stakeholder = $3)
                   AND ($4 IS NULL OR outcome = $4)
                   AND ($5 IS NULL OR correlation_id = $5)
                 ORDER BY sequence ASC
                 LIMIT $6 OFFSET $7"
            ))
            .bind(filter.start.map(timestamp))
            .bind(filter.end.map(timestamp))
            .bind(&filter.stakeholder)
            .bind(filter.outcome.map(|o| o.to_string()))
            .bind(&filter.correlation_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(map_audit_row).collect()
        })
    }
}

fn corrupt(sequence: i64, what: &str, e: impl std::fmt::Display) -> IntegrityError {
    IntegrityError::Corrupt {
        sequence,
        reason: format!("{what}: {e}"),
    }
}

fn column<'r, T>(row: &'r SqliteRow, sequence: i64, name: &str) -> Result<T, IntegrityError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(|e| corrupt(sequence, name, e))
}

fn map_audit_row(row: &SqliteRow) -> Result<AuditRecord, IntegrityError> {
    let sequence: i64 = row.try_get("sequence")?;
    let recorded_raw: String = column(row, sequence, "recorded_at")?;
    let direction_raw: String = column(row, sequence, "direction")?;
    let outcome_raw: String = column(row, sequence, "outcome")?;
    let hits_raw: String = column(row, sequence, "guardrail_hits")?;
    let detail_raw: String = column(row, sequence, "detail")?;

    let recorded_at = DateTime::parse_from_rfc3339(&recorded_raw)
        .map_err(|e| corrupt(sequence, "recorded_at", e))?
        .with_timezone(&Utc);

    Ok(AuditRecord {
        sequence,
        entry_id: column(row, sequence, "entry_id")?,
        recorded_at,
        entry: AuditEntry {
            direction: Direction::from_str(&direction_raw)
                .map_err(|e| corrupt(sequence, "direction", e))?,
            stakeholder: column(row, sequence, "stakeholder")?,
            action: column(row, sequence, "action")?,
            correlation_id: column(row, sequence, "correlation_id")?,
            thought_id: column(row, sequence, "thought_id")?,
            task_id: column(row, sequence, "task_id")?,
            outcome: AuditOutcome::from_str(&outcome_raw)
                .map_err(|e| corrupt(sequence, "outcome", e))?,
            guardrail_hits: serde_json::from_str(&hits_raw)
                .map_err(|e| corrupt(sequence, "guardrail_hits", e))?,
            detail: serde_json::from_str(&detail_raw)
                .map_err(|e| corrupt(sequence, "detail", e))?,
        },
        prev_hash: column(row, sequence, "prev_hash")?,
        hash: column(row, sequence, "hash")?,
        signature: column(row, sequence, "signature")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::sqlite::connect;
    use serde_json::json;

    async fn service(signer: Option<SigningKey>) -> AuditService {
        let pool = connect("sqlite::memory:").await.unwrap();
        AuditService::new(pool, signer).await.unwrap()
    }

    fn entry(action: &str, outcome: AuditOutcome) -> AuditEntry {
        AuditEntry::new(Direction::Internal, "agent:test", action, outcome)
            .with_correlation("corr-1")
    }

    #[tokio::test]
    async fn first_record_links_to_genesis() {
        let audit = service(None).await;
        let first = audit.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);

        let second = audit.record(entry("TASK_COMPLETE", AuditOutcome::Ok)).await.unwrap();
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(audit.last_hash().await, second.hash);
    }

    #[tokio::test]
    async fn untouched_chain_verifies() {
        let audit = service(Some(SigningKey::generate().unwrap())).await;
        for i in 0..5 {
            audit
                .record(entry("SPEAK", AuditOutcome::Ok).with_detail(json!({"i": i})))
                .await
                .unwrap();
        }
        let report = audit.verify_chain().await.unwrap();
        assert_eq!(report.records, 5);
        assert_eq!(report.signatures_checked, 5);
        assert!(!audit.is_halted());
    }

    #[tokio::test]
    async fn edited_row_is_detected_and_halts() {
        let audit = service(None).await;
        for _ in 0..3 {
            audit.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();
        }
        sqlx::query("UPDATE audit_log SET outcome = 'ERROR' WHERE sequence = 2")
            .execute(audit.pool())
            .await
            .unwrap();

        let err = audit.verify_chain().await.unwrap_err();
        assert!(matches!(err, IntegrityError::HashMismatch { sequence: 2, .. }));
        assert!(audit.is_halted());
        assert!(matches!(
            audit.record(entry("SPEAK", AuditOutcome::Ok)).await,
            Err(IntegrityError::Halted(_))
        ));
    }

    #[tokio::test]
    async fn deleted_row_breaks_chain() {
        let audit = service(None).await;
        for _ in 0..3 {
            audit.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();
        }
        sqlx::query("DELETE FROM audit_log WHERE sequence = 2")
            .execute(audit.pool())
            .await
            .unwrap();

        let err = audit.verify_chain().await.unwrap_err();
        assert!(matches!(err, IntegrityError::ChainBreak { sequence: 3 }));
    }

    #[tokio::test]
    async fn out_of_band_append_halts_next_record() {
        let audit = service(None).await;
        let first = audit.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();
        sqlx::query(
            "INSERT INTO audit_log (sequence, entry_id, recorded_at, direction, stakeholder,
                 action, outcome, prev_hash, hash)
             VALUES (2, 'rogue', $1, 'INTERNAL', 'x', 'SPEAK', 'OK', $2, 'bogus')",
        )
        .bind(timestamp(Utc::now()))
        .bind(&first.hash)
        .execute(audit.pool())
        .await
        .unwrap();

        let err = audit.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap_err();
        assert!(matches!(err, IntegrityError::ChainBreak { sequence: 2 }));
        assert!(audit.is_halted());
    }

    #[tokio::test]
    async fn forged_signature_is_detected() {
        let audit = service(Some(SigningKey::generate().unwrap())).await;
        audit.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();
        let forger = SigningKey::generate().unwrap();
        let hash: (String,) = sqlx::query_as("SELECT hash FROM audit_log WHERE sequence = 1")
            .fetch_one(audit.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE audit_log SET signature = $1 WHERE sequence = 1")
            .bind(forger.sign(hash.0.as_bytes()))
            .execute(audit.pool())
            .await
            .unwrap();

        let err = audit.verify_chain().await.unwrap_err();
        assert!(matches!(err, IntegrityError::BadSignature(1)));
    }

    #[tokio::test]
    async fn stripped_signature_is_detected() {
        let audit = service(Some(SigningKey::generate().unwrap())).await;
        for _ in 0..2 {
            audit.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();
        }
        sqlx::query("UPDATE audit_log SET signature = NULL WHERE sequence = 2")
            .execute(audit.pool())
            .await
            .unwrap();

        let err = audit.verify_chain().await.unwrap_err();
        assert!(matches!(err, IntegrityError::BadSignature(2)));
        assert!(audit.is_halted());
    }

    #[tokio::test]
    async fn unreadable_row_halts_the_service() {
        let audit = service(None).await;
        for _ in 0..3 {
            audit.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();
        }
        sqlx::query("UPDATE audit_log SET outcome = 'GARBAGE' WHERE sequence = 2")
            .execute(audit.pool())
            .await
            .unwrap();

        let err = audit.verify_chain().await.unwrap_err();
        assert!(matches!(err, IntegrityError::Corrupt { sequence: 2, .. }));
        assert!(audit.is_halted());
        assert!(matches!(
            audit.record(entry("SPEAK", AuditOutcome::Ok)).await,
            Err(IntegrityError::Halted(_))
        ));
    }

    #[tokio::test]
    async fn query_filters_by_outcome_and_stakeholder() {
        let audit = service(None).await;
        audit.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();
        audit.record(entry("TOOL", AuditOutcome::Error)).await.unwrap();
        audit
            .record(AuditEntry::new(
                Direction::Inbound,
                "wa:root",
                "EMERGENCY_SHUTDOWN",
                AuditOutcome::Error,
            ))
            .await
            .unwrap();

        let errors = audit
            .query(&AuditFilter {
                outcome: Some(AuditOutcome::Error),
                ..AuditFilter::recent(10)
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 2);

        let wa = audit
            .query(&AuditFilter {
                stakeholder: Some("wa:root".into()),
                ..AuditFilter::recent(10)
            })
            .await
            .unwrap();
        assert_eq!(wa.len(), 1);
        assert_eq!(wa[0].entry.direction, Direction::Inbound);

        let page = audit
            .query(&AuditFilter {
                offset: 1,
                ..AuditFilter::recent(1)
            })
            .await
            .unwrap();
        assert_eq!(page[0].sequence, 2);

        let correlated = audit.records_for_correlation("corr-1").await.unwrap();
        assert_eq!(correlated.len(), 2);
    }

    #[tokio::test]
    async fn reopened_service_continues_chain() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let first = AuditService::new(pool.clone(), None).await.unwrap();
        let a = first.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();

        let second = AuditService::new(pool, None).await.unwrap();
        let b = second.record(entry("SPEAK", AuditOutcome::Ok)).await.unwrap();
        assert_eq!(b.prev_hash, a.hash);
        assert_eq!(second.verify_chain().await.unwrap().records, 2);
    }

    #[tokio::test]
    async fn concurrent_appends_stay_linear() {
        let audit = Arc::new(service(None).await);
        let mut handles = Vec::new();
        for i in 0..8 {
            let audit = Arc::clone(&audit);
            handles.push(tokio::spawn(async move {
                audit
                    .record(entry("SPEAK", AuditOutcome::Ok).with_detail(json!({"i": i})))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(audit.verify_chain().await.unwrap().records, 8);
    }

    #[tokio::test]
    async fn verifier_stops_on_cancel() {
        let audit = Arc::new(service(None).await);
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&audit).spawn_verifier(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(!audit.is_halted());
    }
}
