//! Scenario: a full handover written to the hash-chained audit log.
//!
//! # Invariants under test
//!
//! 1. Every protocol event reaches the JSONL log in emission order.
//! 2. The resulting chain verifies.
//! 3. No raw access code appears anywhere in the log.

use std::sync::Arc;

use rsd_audit::{read_events, verify_hash_chain, JsonlAuditSink, VerifyResult};
use rsd_handover::{ActionType, ResidenceId};
use rsd_testkit::{identity, Harness};

#[tokio::test]
async fn handover_events_form_a_valid_chain() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("handover_audit.jsonl");
    let sink = Arc::new(JsonlAuditSink::open(&path).expect("open sink"));
    let h = Harness::with_audit_sink(sink);

    let owner = h.seed_syndic("owner@example.com", ResidenceId(42), 2);
    let claimant = h.seed_fresh("replacement@example.com");
    let intruder = h.seed_fresh("intruder@example.com");
    let code = h
        .coordinator
        .issue_code(owner.id, "replacement@example.com", ResidenceId(42), ActionType::ChangeRole)
        .await
        .expect("issue")
        .code
        .code;

    h.coordinator
        .validate_code(&code, &identity(&intruder))
        .await
        .expect("validate");
    h.coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect("complete");

    let logged: Vec<String> = read_events(&path)
        .expect("read")
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    let recorded: Vec<String> = h.audit.event_types().into_iter().map(str::to_string).collect();
    assert_eq!(logged, recorded);
    assert_eq!(logged.first().map(String::as_str), Some("CODE_ISSUED"));
    assert_eq!(logged.last().map(String::as_str), Some("CODE_CONSUMED"));

    let lines = recorded.len();
    assert_eq!(verify_hash_chain(&path).expect("verify"), VerifyResult::Valid { lines });

    let content = std::fs::read_to_string(&path).expect("read raw");
    assert!(!content.contains(&code));
}
