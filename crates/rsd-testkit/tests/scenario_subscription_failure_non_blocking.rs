//! Scenario: the payment gateway misbehaves during completion.
//!
//! # Invariants under test
//!
//! 1. Cancel errors are logged and reported in the sweep; the handover still
//!    completes and the code is consumed.
//! 2. A listing failure is reported the same way.
//! 3. A hanging gateway is cut off by the external call timeout.

use std::time::Duration;

use rsd_handover::{ActionType, HandoverSettings, ResidenceId, Role};
use rsd_testkit::{identity, BillingFault, Harness};

const RESIDENCE: ResidenceId = ResidenceId(42);

async fn run_with_fault(h: &Harness, fault: BillingFault) -> rsd_handover::CompletionReport {
    let owner = h.seed_syndic("owner@example.com", RESIDENCE, 1);
    let claimant = h.seed_fresh("replacement@example.com");
    h.billing.add_subscription(owner.id, "sub_a");
    h.billing.add_subscription(owner.id, "sub_b");
    h.billing.set_fault(fault);

    let code = h
        .coordinator
        .issue_code(owner.id, "replacement@example.com", RESIDENCE, ActionType::ChangeRole)
        .await
        .expect("issue")
        .code
        .code;
    let report = h
        .coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect("completion must not be blocked by billing");

    assert!(h.store.code(&code).expect("code").used);
    assert_eq!(h.store.account(claimant.id).expect("claimant").role, Role::Syndic);
    report
}

#[tokio::test]
async fn cancel_errors_are_swallowed() {
    let h = Harness::new();
    let report = run_with_fault(&h, BillingFault::FailCancel).await;

    let sweep = report.subscriptions.expect("sweep");
    assert!(sweep.cancelled.is_empty());
    assert_eq!(sweep.failed.len(), 2);
    assert!(!sweep.is_clean());
    assert_eq!(h.billing.cancel_calls(), 2);
}

#[tokio::test]
async fn listing_error_is_swallowed() {
    let h = Harness::new();
    let report = run_with_fault(&h, BillingFault::FailList).await;

    let sweep = report.subscriptions.expect("sweep");
    assert!(sweep.listing_failed);
    assert_eq!(h.billing.cancel_calls(), 0);
}

#[tokio::test]
async fn hanging_gateway_times_out() {
    let h = Harness::with_settings(HandoverSettings {
        external_call_timeout: Duration::from_millis(50),
        ..HandoverSettings::default()
    });
    let report = run_with_fault(&h, BillingFault::HangCancel(Duration::from_secs(30))).await;

    let sweep = report.subscriptions.expect("sweep");
    assert_eq!(sweep.failed.len(), 2);
    assert!(h.billing.cancelled().is_empty());
}
