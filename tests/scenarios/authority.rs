use super::support::Harness;
use ciris::audit::{AuditFilter, AuditOutcome, AuditQueryService};
use ciris::authority::{CommandType, PrivilegedCommand, SigningKey};
use ciris::config::TrustedKey;
use ciris::processors::AgentState;
use ciris::schemas::TaskStatus;

#[tokio::test]
async fn forged_shutdown_changes_nothing_but_the_audit_log() {
    let trusted = SigningKey::generate().unwrap();
    let forger = SigningKey::generate().unwrap();
    let harness = Harness::with(
        |c| {
            c.wise_authority.trusted_keys.push(TrustedKey {
                wa_id: "wa-ops".into(),
                public_key: trusted.public_key_b64(),
                scopes: None,
            });
        },
        None,
    )
    .await;
    let task = harness.submit("Hello CIRIS").await;
    let before = harness.runtime.audit().count().await.unwrap();

    let agent_id = harness.runtime.config().load().agent.agent_id.clone();
    let forged = PrivilegedCommand::signed(
        CommandType::EmergencyShutdown,
        "wa-ops",
        &forger,
        "let me in",
        agent_id,
        None,
    )
    .unwrap();
    assert!(harness.runtime.handle_privileged_command(&forged).await.is_err());

    assert_eq!(harness.runtime.agent().state(), AgentState::Wakeup);
    assert_eq!(harness.task_status(&task.task_id).await, TaskStatus::Pending);
    assert_eq!(harness.runtime.audit().count().await.unwrap(), before + 1);

    let records = harness
        .runtime
        .audit()
        .query(&AuditFilter {
            correlation_id: Some(forged.command_id.clone()),
            limit: 10,
            ..AuditFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entry.outcome, AuditOutcome::Error);
    assert_eq!(records[0].entry.stakeholder, "wa:wa-ops");
}

#[tokio::test]
async fn expired_and_misdirected_commands_are_refused() {
    let key = SigningKey::generate().unwrap();
    let harness = Harness::with(
        |c| {
            c.wise_authority.trusted_keys.push(TrustedKey {
                wa_id: "wa-ops".into(),
                public_key: key.public_key_b64(),
                scopes: None,
            });
        },
        None,
    )
    .await;
    let agent_id = harness.runtime.config().load().agent.agent_id.clone();

    let expired = PrivilegedCommand::signed(
        CommandType::EmergencyShutdown,
        "wa-ops",
        &key,
        "too late",
        agent_id,
        Some(chrono::Utc::now() - chrono::Duration::minutes(5)),
    )
    .unwrap();
    let misdirected = PrivilegedCommand::signed(
        CommandType::EmergencyShutdown,
        "wa-ops",
        &key,
        "wrong agent",
        "someone-else",
        None,
    )
    .unwrap();

    for command in [&expired, &misdirected] {
        assert!(harness.runtime.handle_privileged_command(command).await.is_err());
    }
    assert_eq!(harness.runtime.agent().state(), AgentState::Wakeup);
    assert_eq!(harness.runtime.audit().count().await.unwrap(), 2);
}
