//! S4: a policy violation never reaches the agent, but it always leaves an
//! audit trail — the hub fails closed, not silently.

use std::sync::Arc;

use manlab_audit::AuditLogger;
use manlab_persist::{InMemoryAuditStore, InMemorySessionStore, LogViewerPolicyRow};
use manlab_proto::ManlabError;
use manlab_sessions::PolicyRegistry;
use uuid::Uuid;

#[tokio::test]
async fn s4_log_read_outside_allowed_root_is_rejected_and_audited() {
    let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
    let policies = PolicyRegistry::new(Arc::new(InMemorySessionStore::new()), audit.clone());

    let policy = LogViewerPolicyRow {
        id: Uuid::new_v4(),
        display_name: "app logs".to_string(),
        allowed_root: "/var/log/app".to_string(),
        max_bytes_per_request: 1024 * 1024,
    };
    policies.upsert_log_viewer_policy(&policy).await.unwrap();

    let result = policies.check_log_path(policy.id, "/etc/passwd").await;
    assert!(matches!(result, Err(ManlabError::PolicyViolation(_))));

    // No agent-facing side effect of a rejected request: the only trace is
    // the audit record, there is no command queue entry to check against
    // because this registry never touches the dispatcher at all.
    let events = audit.recent(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_name, "log_viewer_policy_violation");
    assert!(!events[0].success);
    assert_eq!(events[0].target_id.as_deref(), Some(policy.id.to_string().as_str()));
}

#[tokio::test]
async fn s4_request_inside_allowed_root_is_not_audited() {
    let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
    let policies = PolicyRegistry::new(Arc::new(InMemorySessionStore::new()), audit.clone());

    let policy = LogViewerPolicyRow {
        id: Uuid::new_v4(),
        display_name: "app logs".to_string(),
        allowed_root: "/var/log/app".to_string(),
        max_bytes_per_request: 1024 * 1024,
    };
    policies.upsert_log_viewer_policy(&policy).await.unwrap();

    policies.check_log_path(policy.id, "/var/log/app/current.log").await.unwrap();
    assert!(audit.recent(10).await.unwrap().is_empty());
}
