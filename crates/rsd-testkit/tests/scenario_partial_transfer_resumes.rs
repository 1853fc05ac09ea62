//! Scenario: a transfer that fails part-way is resumed by retrying.
//!
//! # Invariants under test
//!
//! 1. A failing category surfaces PartialTransferFailure naming the completed
//!    categories (in transfer order) and the failed one.
//! 2. The code stays unused in DATA_TRANSFERRING; the owner can no longer
//!    cancel it; roles are not swapped yet.
//! 3. Retrying the same completion finishes the job: completed categories
//!    are skipped, the rest are moved, the code is consumed.
//! 4. Running the engine again after completion is a no-op.
//! 5. A failing final "mark used" fails the whole call; a retry completes.
//! 6. An in-flight transfer stays resumable after the code's expiry, by the
//!    claimant or by the owner. Those retries count no attempt, trigger no
//!    remediation and end with every row on the claimant.
//! 7. A failed run releases its transfer lease; the lease of a run that died
//!    holding it blocks other runs until it lapses.

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use rsd_handover::ports::{CodeRepository, TransferLease};
use rsd_handover::{
    ActionType, HandoverError, OwnershipCategory, OwnershipTransferEngine, ResidenceId, Role,
    TransferPhase,
};
use rsd_testkit::{identity, t0, Harness};

const RESIDENCE: ResidenceId = ResidenceId(42);

#[tokio::test]
async fn failed_category_is_reported_and_retry_completes() {
    let h = Harness::new();
    let owner = h.seed_syndic("owner@example.com", RESIDENCE, 2);
    let claimant = h.seed_fresh("replacement@example.com");
    let code = h
        .coordinator
        .issue_code(owner.id, "replacement@example.com", RESIDENCE, ActionType::ChangeRole)
        .await
        .expect("issue")
        .code
        .code;

    h.store.fail_repoint_of(Some(OwnershipCategory::Payments));
    let err = h
        .coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect_err("payments step fails");

    match &err {
        HandoverError::PartialTransferFailure(p) => {
            assert_eq!(
                p.completed,
                vec![
                    OwnershipCategory::Residence,
                    OwnershipCategory::Residents,
                    OwnershipCategory::Fees,
                    OwnershipCategory::ExpenseCategories,
                ]
            );
            assert_eq!(p.failed, OwnershipCategory::Payments);
        }
        other => panic!("expected partial transfer failure, got {other:?}"),
    }
    assert_eq!(h.audit.count("OWNERSHIP_TRANSFER_FAILED"), 1);

    let record = h.store.code(&code).expect("code");
    assert!(!record.used);
    assert_eq!(record.phase, TransferPhase::DataTransferring);
    assert_eq!(h.store.owned_count(OwnershipCategory::Fees, claimant.id), 2);
    assert_eq!(h.store.owned_count(OwnershipCategory::Payments, owner.id), 2);
    assert_eq!(h.store.account(owner.id).expect("owner").role, Role::Syndic);

    let cancel = h
        .coordinator
        .cancel_code(&code, owner.id)
        .await
        .expect_err("cancel refused once transferring");
    assert!(cancel.is_already_used(), "got {cancel:?}");

    h.store.fail_repoint_of(None);
    let report = h
        .coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect("retry completes");

    let steps = &report.transfer.as_ref().expect("transfer").steps;
    let skipped: Vec<_> = steps
        .iter()
        .filter(|s| s.already_complete)
        .map(|s| s.category)
        .collect();
    assert_eq!(skipped.len(), 4, "completed categories must be skipped on retry");
    assert_eq!(h.store.owned_total(owner.id), 0);
    assert_eq!(h.store.owned_total(claimant.id), 2 * OwnershipCategory::ALL.len());
    assert!(h.store.code(&code).expect("code").used);
    assert_eq!(h.store.account(claimant.id).expect("claimant").role, Role::Syndic);
}

#[tokio::test]
async fn engine_rerun_after_completion_is_noop() {
    let h = Harness::new();
    let owner = h.seed_syndic("owner@example.com", RESIDENCE, 3);
    let claimant = h.seed_fresh("replacement@example.com");
    let engine = OwnershipTransferEngine::new(h.store.clone());

    let first = engine.transfer(owner.id, claimant.id).await.expect("first");
    assert!(!first.was_noop());
    assert_eq!(first.rows_moved(), 3 * OwnershipCategory::ALL.len() as u64);

    let second = engine.transfer(owner.id, claimant.id).await.expect("second");
    assert!(second.was_noop());
    assert_eq!(second.rows_moved(), 0);
    assert_eq!(h.store.owned_total(claimant.id), 3 * OwnershipCategory::ALL.len());
}

#[tokio::test]
async fn engine_rejects_self_transfer() {
    let h = Harness::new();
    let owner = h.seed_syndic("owner@example.com", RESIDENCE, 1);
    let engine = OwnershipTransferEngine::new(h.store.clone());

    let err = engine
        .transfer(owner.id, owner.id)
        .await
        .expect_err("from == to");
    assert!(matches!(err, HandoverError::InvalidRequest(_)), "got {err:?}");
}

#[tokio::test]
async fn concurrent_engine_runs_move_every_row_once() {
    let h = Harness::new();
    let owner = h.seed_syndic("owner@example.com", RESIDENCE, 4);
    let claimant = h.seed_fresh("replacement@example.com");
    let engine = Arc::new(OwnershipTransferEngine::new(h.store.clone()));
    let (from, to) = (owner.id, claimant.id);

    let a = {
        let e = Arc::clone(&engine);
        tokio::spawn(async move { e.transfer(from, to).await })
    };
    let b = {
        let e = Arc::clone(&engine);
        tokio::spawn(async move { e.transfer(from, to).await })
    };
    let ra = a.await.expect("a").expect("a ok");
    let rb = b.await.expect("b").expect("b ok");

    assert_eq!(ra.rows_moved() + rb.rows_moved(), 4 * OwnershipCategory::ALL.len() as u64);
    assert_eq!(h.store.owned_total(owner.id), 0);
}

#[tokio::test]
async fn failing_mark_used_fails_the_call_and_retry_completes() {
    let h = Harness::new();
    let owner = h.seed_syndic("owner@example.com", RESIDENCE, 1);
    let claimant = h.seed_fresh("replacement@example.com");
    let code = h
        .coordinator
        .issue_code(owner.id, "replacement@example.com", RESIDENCE, ActionType::ChangeRole)
        .await
        .expect("issue")
        .code
        .code;

    h.store.fail_mark_used(true);
    let err = h
        .coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect_err("mark used fails");
    assert!(matches!(err, HandoverError::Store(_)), "got {err:?}");
    let record = h.store.code(&code).expect("code");
    assert!(!record.used);
    assert_eq!(record.phase, TransferPhase::SubscriptionsCancelled);

    // The claimant is already syndic of 42; the resumed call must still pass.
    h.store.fail_mark_used(false);
    h.coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect("retry completes");
    assert!(h.store.code(&code).expect("code").used);
}

#[tokio::test]
async fn expired_in_flight_transfer_is_resumed_by_claimant() {
    let h = Harness::new();
    let owner = h.seed_syndic("owner@example.com", RESIDENCE, 2);
    let claimant = h.seed_fresh("replacement@example.com");
    h.billing.add_subscription(owner.id, "sub_1");
    let code = h
        .coordinator
        .issue_code(owner.id, "replacement@example.com", RESIDENCE, ActionType::ChangeRole)
        .await
        .expect("issue")
        .code
        .code;

    h.store.fail_repoint_of(Some(OwnershipCategory::Payments));
    let err = h
        .coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect_err("payments step fails");
    assert!(matches!(err, HandoverError::PartialTransferFailure(_)), "got {err:?}");
    assert!(!h.store.has_transfer_lease(&code), "a failed run releases its lease");

    // Well past the 72h lifetime, and more retries than the attempt limit.
    h.clock.advance(Duration::hours(73));
    for _ in 0..3 {
        let err = h
            .coordinator
            .complete_claim(&code, &identity(&claimant))
            .await
            .expect_err("payments still failing");
        assert!(matches!(err, HandoverError::PartialTransferFailure(_)), "got {err:?}");
    }

    let validation = h
        .coordinator
        .validate_for_user(&code, "replacement@example.com")
        .await
        .expect("validate");
    assert!(validation.valid, "claimant may still resume: {validation:?}");

    h.store.fail_repoint_of(None);
    let report = h
        .coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect("resumed completion");
    assert_eq!(report.subscriptions.expect("sweep").cancelled.len(), 1);

    let record = h.store.code(&code).expect("code");
    assert!(record.used);
    assert_eq!(record.used_by_account_id, Some(claimant.id));
    assert_eq!(record.failed_attempts, 0);
    assert!(h.store.deleted_accounts().is_empty());
    assert_eq!(h.audit.count("ATTEMPTS_EXHAUSTED"), 0);
    assert_eq!(h.audit.count("REMEDIATION_EXECUTED"), 0);
    assert_eq!(h.store.account(claimant.id).expect("claimant").role, Role::Syndic);
    assert_eq!(h.store.account(owner.id).expect("owner").role, Role::Resident);
    assert_eq!(h.store.owned_total(owner.id), 0);
    assert_eq!(h.store.owned_total(claimant.id), 2 * OwnershipCategory::ALL.len());
}

#[tokio::test]
async fn expired_in_flight_transfer_is_resumed_by_owner() {
    let h = Harness::new();
    let owner = h.seed_syndic("owner@example.com", RESIDENCE, 1);
    let claimant = h.seed_fresh("replacement@example.com");
    let code = h
        .coordinator
        .issue_code(owner.id, "replacement@example.com", RESIDENCE, ActionType::ChangeRole)
        .await
        .expect("issue")
        .code
        .code;
    h.coordinator
        .claim_code(&code, &identity(&claimant))
        .await
        .expect("claim");

    h.store.fail_repoint_of(Some(OwnershipCategory::Fees));
    let err = h
        .coordinator
        .finalize_transfer(&code, owner.id)
        .await
        .expect_err("fees step fails");
    assert!(matches!(err, HandoverError::PartialTransferFailure(_)), "got {err:?}");

    h.clock.advance(Duration::hours(73));
    for _ in 0..3 {
        let err = h
            .coordinator
            .finalize_transfer(&code, owner.id)
            .await
            .expect_err("fees still failing");
        assert!(matches!(err, HandoverError::PartialTransferFailure(_)), "got {err:?}");
    }

    h.store.fail_repoint_of(None);
    h.coordinator
        .finalize_transfer(&code, owner.id)
        .await
        .expect("owner resumes to completion");

    let record = h.store.code(&code).expect("code");
    assert!(record.used);
    assert_eq!(record.failed_attempts, 0);
    assert!(h.store.account(claimant.id).is_some());
    assert!(h.store.deleted_accounts().is_empty());
    assert_eq!(h.store.owned_total(claimant.id), OwnershipCategory::ALL.len());
}

#[tokio::test]
async fn lease_of_a_dead_run_blocks_until_it_lapses() {
    let h = Harness::new();
    let owner = h.seed_syndic("owner@example.com", RESIDENCE, 1);
    let claimant = h.seed_fresh("replacement@example.com");
    h.billing.add_subscription(owner.id, "sub_1");
    let code = h
        .coordinator
        .issue_code(owner.id, "replacement@example.com", RESIDENCE, ActionType::ChangeRole)
        .await
        .expect("issue")
        .code
        .code;
    h.coordinator
        .claim_code(&code, &identity(&claimant))
        .await
        .expect("claim");

    // A run that took the lease and never came back.
    let lease = h.coordinator.settings().transfer_lease;
    let until = t0() + Duration::from_std(lease).expect("lease fits");
    let taken = h
        .store
        .acquire_transfer_lease(&code, Uuid::new_v4(), t0(), until)
        .await
        .expect("lease");
    assert_eq!(taken, TransferLease::Granted(TransferPhase::ClaimPending));

    let err = h
        .coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect_err("lease held");
    assert!(err.is_already_used(), "got {err:?}");
    assert_eq!(h.store.owned_total(claimant.id), 0);
    assert_eq!(h.billing.cancel_calls(), 0);
    assert!(!h.store.code(&code).expect("code").used);

    h.clock.advance(Duration::from_std(lease).expect("lease fits"));
    h.coordinator
        .complete_claim(&code, &identity(&claimant))
        .await
        .expect("lapsed lease is taken over");
    assert!(h.store.code(&code).expect("code").used);
    assert!(!h.store.has_transfer_lease(&code));
    assert_eq!(h.billing.cancel_calls(), 1);
}
