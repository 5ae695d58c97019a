use super::support::Harness;
use ciris::audit::{AuditFilter, AuditQueryService, GENESIS_HASH};

#[tokio::test]
async fn every_prefix_of_the_chain_recomputes() {
    let mut harness = Harness::new().await;
    for description in ["Hello CIRIS", "remember colour=blue", "recall colour"] {
        let task = harness.submit(description).await;
        harness.drive(&task.task_id, 6).await;
    }

    let records = harness
        .runtime
        .audit()
        .query(&AuditFilter::recent(1000))
        .await
        .unwrap();
    assert!(records.len() >= 6);

    let mut prev = GENESIS_HASH.to_string();
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.sequence, i64::try_from(i).unwrap() + 1);
        assert_eq!(record.prev_hash, prev, "link {} broken", record.sequence);
        assert_eq!(record.compute_hash().unwrap(), record.hash);
        prev = record.hash.clone();
    }

    let report = harness.runtime.audit().verify_chain().await.unwrap();
    assert_eq!(report.records, records.len() as u64);
    assert_eq!(report.last_hash, prev);
    assert_eq!(harness.runtime.audit().last_hash().await, prev);
}
