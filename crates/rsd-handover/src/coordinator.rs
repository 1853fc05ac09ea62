//! Transfer Coordinator.
//!
//! Drives a code through the protocol phases:
//!
//! ```text
//! ISSUED ─claim─► CLAIM_PENDING ─► DATA_TRANSFERRING ─► ROLE_SWAPPED
//!        ─► SUBSCRIPTIONS_CANCELLED ─► COMPLETE (used = true)
//! ```
//!
//! Two entry points complete a handover:
//! - [`Coordinator::finalize_transfer`]: the original owner confirms a code
//!   the claimant has already claimed (two-party).
//! - [`Coordinator::complete_claim`]: a fresh claimant account completes the
//!   code inline (one-party).
//!
//! Both call the same private `complete_transfer`, which ends with the single
//! atomic "mark used" write. Every step before that write is idempotent, so a
//! failed call is retried by calling it again, even after the code's expiry.
//! The transfer steps run under a per-code lease, so concurrent completions
//! never both execute them. No state is kept in process: the persisted code
//! record is the only protocol state.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::code_store::{CodeStore, IssuedCode};
use crate::error::{HandoverError, HandoverResult, RejectReason};
use crate::events::{code_fingerprint, HandoverEvent};
use crate::ports::{
    AccountDirectory, AuditSink, ClaimBinding, Clock, CodeRepository, MarkUsed, OwnershipStore,
    PaymentGateway, TransferLease,
};
use crate::remediation::Remediator;
use crate::settings::HandoverSettings;
use crate::transfer::{OwnershipTransferEngine, TransferReport};
use crate::types::{
    AccessCode, AccountId, ActionType, CodeStatus, ResidenceId, Role, SubscriptionId,
    TransferPhase, VerifiedIdentity,
};
use crate::validator::{emails_match, CodeValidator, UserValidation, Validation};

const PAYMENT_GATEWAY: &str = "payment_gateway";

/// Collaborators the coordinator is wired with.
#[derive(Clone)]
pub struct HandoverDeps {
    pub codes: Arc<dyn CodeRepository>,
    pub ownership: Arc<dyn OwnershipStore>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub billing: Arc<dyn PaymentGateway>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPath {
    OwnerConfirmed,
    ClaimantDirect,
}

/// Result of the best-effort subscription cancellation step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSweep {
    pub cancelled: Vec<SubscriptionId>,
    pub failed: Vec<SubscriptionId>,
    /// Active subscriptions could not be listed at all.
    pub listing_failed: bool,
}

impl SubscriptionSweep {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.listing_failed
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub code_ref: String,
    pub action: ActionType,
    pub path: CompletionPath,
    pub residence: ResidenceId,
    pub new_owner: AccountId,
    pub former_owner: AccountId,
    /// `None` for codes that close out without a transfer.
    pub transfer: Option<TransferReport>,
    pub subscriptions: Option<SubscriptionSweep>,
}

pub struct Coordinator {
    codes: Arc<dyn CodeRepository>,
    accounts: Arc<dyn AccountDirectory>,
    billing: Arc<dyn PaymentGateway>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    store: CodeStore,
    validator: CodeValidator,
    engine: OwnershipTransferEngine,
    settings: HandoverSettings,
}

impl Coordinator {
    pub fn new(deps: HandoverDeps, settings: HandoverSettings) -> Self {
        let remediator = Remediator::new(Arc::clone(&deps.accounts), settings.external_call_timeout);
        Self {
            store: CodeStore::new(
                Arc::clone(&deps.codes),
                Arc::clone(&deps.clock),
                settings.code_length,
            ),
            validator: CodeValidator::new(
                Arc::clone(&deps.codes),
                remediator,
                Arc::clone(&deps.audit),
            ),
            engine: OwnershipTransferEngine::new(deps.ownership),
            codes: deps.codes,
            accounts: deps.accounts,
            billing: deps.billing,
            audit: deps.audit,
            clock: deps.clock,
            settings,
        }
    }

    pub fn settings(&self) -> &HandoverSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Owner-side operations
    // -----------------------------------------------------------------------

    /// Issue a code naming `replacement_email` as the next syndic of
    /// `residence_id`. The owner must currently be that residence's syndic.
    pub async fn issue_code(
        &self,
        owner_id: AccountId,
        replacement_email: &str,
        residence_id: ResidenceId,
        action: ActionType,
    ) -> HandoverResult<IssuedCode> {
        let owner = self
            .accounts
            .find_by_id(owner_id)
            .await?
            .ok_or(HandoverError::Forbidden)?;
        if !owner.is_syndic_of(residence_id) {
            warn!(owner = %owner_id, residence = %residence_id, "issue refused: requester is not the residence syndic");
            return Err(HandoverError::Forbidden);
        }
        if emails_match(&owner.email, replacement_email) {
            return Err(HandoverError::InvalidRequest(
                "replacement email must belong to a different account".to_string(),
            ));
        }

        let issued = self
            .store
            .issue(
                owner_id,
                replacement_email,
                residence_id,
                action,
                self.settings.code_ttl,
            )
            .await?;

        self.audit.record(&HandoverEvent::CodeIssued {
            code_ref: code_fingerprint(&issued.code.code),
            owner: owner_id,
            residence: residence_id,
            action,
            superseded: issued.superseded,
        });
        Ok(issued)
    }

    pub async fn cancel_code(&self, code: &str, requester_id: AccountId) -> HandoverResult<()> {
        self.store.cancel(code, requester_id).await?;
        self.audit.record(&HandoverEvent::CodeCancelled {
            code_ref: code_fingerprint(code),
            owner: requester_id,
        });
        Ok(())
    }

    pub async fn list_codes(&self, owner_id: AccountId) -> HandoverResult<Vec<AccessCode>> {
        self.store.list_for_owner(owner_id).await
    }

    /// Two-party completion: the original owner confirms a claimed code.
    pub async fn finalize_transfer(
        &self,
        code: &str,
        owner_id: AccountId,
    ) -> HandoverResult<CompletionReport> {
        let record = self.store.find(code).await?;
        if record.original_owner_id != owner_id {
            return Err(HandoverError::Forbidden);
        }
        if record.used {
            return Err(HandoverError::rejected(
                RejectReason::AlreadyUsed,
                record.attempts_remaining(),
            ));
        }

        let claimant_id = record
            .claimed_by_account_id
            .ok_or(HandoverError::ClaimNotPending)?;
        let claimant = self
            .accounts
            .find_by_id(claimant_id)
            .await?
            .ok_or(HandoverError::ClaimNotPending)?;

        // Re-validate against the claimant's verified email, as recorded by
        // the directory at claim time. Not counted: the owner is not guessing.
        let record = self.accept_untracked(code, &claimant.email).await?;
        self.complete_transfer(record, claimant.id, CompletionPath::OwnerConfirmed)
            .await
    }

    // -----------------------------------------------------------------------
    // Claimant-side operations
    // -----------------------------------------------------------------------

    pub async fn validate_code(
        &self,
        code: &str,
        claimant: &VerifiedIdentity,
    ) -> HandoverResult<Validation> {
        self.validator
            .validate(code, &claimant.email, self.clock.now())
            .await
    }

    /// Pre-signup validation. `verified_email` must come from the identity
    /// provider, not from the client.
    pub async fn validate_for_user(
        &self,
        code: &str,
        verified_email: &str,
    ) -> HandoverResult<UserValidation> {
        self.validator
            .validate_for_user(code, verified_email, self.clock.now())
            .await
    }

    /// First-claim step: ISSUED → CLAIM_PENDING, bound to the claimant.
    pub async fn claim_code(
        &self,
        code: &str,
        claimant: &VerifiedIdentity,
    ) -> HandoverResult<AccessCode> {
        self.accept(code, &claimant.email).await?;
        self.bind(code, claimant.account_id).await?;
        self.store.find(code).await
    }

    /// One-party completion by the claimant itself.
    pub async fn complete_claim(
        &self,
        code: &str,
        claimant: &VerifiedIdentity,
    ) -> HandoverResult<CompletionReport> {
        let record = self.accept(code, &claimant.email).await?;
        if let Some(bound) = record.claimed_by_account_id {
            if bound != claimant.account_id {
                return Err(HandoverError::Conflict {
                    winner: Some(bound),
                });
            }
        }

        let account = self
            .accounts
            .find_by_id(claimant.account_id)
            .await?
            .ok_or_else(|| {
                HandoverError::InvalidRequest("claimant account does not exist".to_string())
            })?;
        // A resumed completion finds the claimant already promoted.
        if record.action_type == ActionType::ChangeRole
            && !account.is_fresh()
            && !account.is_syndic_of(record.residence_id)
        {
            warn!(
                claimant = %account.id,
                "one-party completion refused: claimant already runs another residence"
            );
            return Err(HandoverError::Forbidden);
        }

        self.bind(code, claimant.account_id).await?;
        self.complete_transfer(record, claimant.account_id, CompletionPath::ClaimantDirect)
            .await
    }

    // -----------------------------------------------------------------------
    // Read-only / maintenance
    // -----------------------------------------------------------------------

    pub async fn check_code_status(&self, code: &str) -> HandoverResult<CodeStatus> {
        let now = self.clock.now();
        Ok(match self.codes.fetch_code(code).await? {
            Some(record) => CodeStatus::of(&record, now),
            None => CodeStatus::missing(),
        })
    }

    pub async fn purge_expired(&self) -> HandoverResult<u64> {
        let count = self.store.purge_expired().await?;
        if count > 0 {
            info!(count, "expired access codes purged");
            self.audit.record(&HandoverEvent::ExpiredPurged { count });
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Shared completion routine
    // -----------------------------------------------------------------------

    async fn complete_transfer(
        &self,
        record: AccessCode,
        claimant_id: AccountId,
        path: CompletionPath,
    ) -> HandoverResult<CompletionReport> {
        let code_ref = code_fingerprint(&record.code);
        let owner_id = record.original_owner_id;
        if claimant_id == owner_id {
            return Err(HandoverError::InvalidRequest(
                "the code issuer cannot redeem its own code".to_string(),
            ));
        }

        let mut report = CompletionReport {
            code_ref,
            action: record.action_type,
            path,
            residence: record.residence_id,
            new_owner: claimant_id,
            former_owner: owner_id,
            transfer: None,
            subscriptions: None,
        };

        if record.action_type != ActionType::ChangeRole {
            return self.consume(&record, claimant_id, report).await;
        }

        let holder = Uuid::new_v4();
        let phase = self.take_lease(&record.code, holder, claimant_id).await?;
        let result = match self
            .run_transfer(&record, claimant_id, phase, &mut report)
            .await
        {
            Ok(()) => self.consume(&record, claimant_id, report).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.release_lease(&record.code, holder).await;
        }
        result
    }

    /// Data re-point, role swap and subscription sweep. The caller holds the
    /// transfer lease; `phase` is where the code stood when it was taken.
    async fn run_transfer(
        &self,
        record: &AccessCode,
        claimant_id: AccountId,
        phase: TransferPhase,
        report: &mut CompletionReport,
    ) -> HandoverResult<()> {
        let code_ref = code_fingerprint(&record.code);
        let owner_id = record.original_owner_id;

        // From here on the owner can no longer cancel.
        if !self.advance(&record.code, TransferPhase::DataTransferring).await? {
            return Err(self.lost_race(&record.code, claimant_id).await?);
        }

        let transfer = match self.engine.transfer(owner_id, claimant_id).await {
            Ok(t) => t,
            Err(HandoverError::PartialTransferFailure(partial)) => {
                self.audit.record(&HandoverEvent::OwnershipTransferFailed {
                    code_ref,
                    completed: partial.completed.clone(),
                    failed: partial.failed,
                });
                return Err(HandoverError::PartialTransferFailure(partial));
            }
            Err(e) => return Err(e),
        };
        self.audit.record(&HandoverEvent::OwnershipTransferred {
            code_ref: code_ref.clone(),
            from: owner_id,
            to: claimant_id,
            rows_moved: transfer.rows_moved(),
        });
        report.transfer = Some(transfer);

        self.swap_roles(record, claimant_id).await?;
        if !self.advance(&record.code, TransferPhase::RoleSwapped).await? {
            return Err(self.lost_race(&record.code, claimant_id).await?);
        }

        // An earlier run that got this far already swept the subscriptions.
        if phase >= TransferPhase::SubscriptionsCancelled {
            info!(code_ref = %code_ref, "subscriptions already swept; skipping");
            return Ok(());
        }
        let sweep = self.cancel_owner_subscriptions(&code_ref, owner_id).await;
        report.subscriptions = Some(sweep);
        if !self
            .advance(&record.code, TransferPhase::SubscriptionsCancelled)
            .await?
        {
            return Err(self.lost_race(&record.code, claimant_id).await?);
        }
        Ok(())
    }

    /// Final step. A failure here fails the whole call.
    async fn consume(
        &self,
        record: &AccessCode,
        claimant_id: AccountId,
        report: CompletionReport,
    ) -> HandoverResult<CompletionReport> {
        let code_ref = report.code_ref.clone();
        match self
            .codes
            .mark_used(&record.code, claimant_id, self.clock.now())
            .await?
        {
            MarkUsed::Marked => {
                info!(
                    code_ref = %code_ref,
                    claimant = %claimant_id,
                    path = ?report.path,
                    action = record.action_type.as_str(),
                    "handover complete"
                );
                self.audit.record(&HandoverEvent::CodeConsumed {
                    code_ref,
                    account: claimant_id,
                });
                Ok(report)
            }
            MarkUsed::AlreadyUsedBy(winner) => Err(self.race_outcome(&code_ref, winner, claimant_id)),
            MarkUsed::Missing => Err(HandoverError::rejected(RejectReason::NotFound, 0)),
        }
    }

    /// Claimant becomes syndic before the owner is demoted, so the residence
    /// is never left without one.
    async fn swap_roles(&self, record: &AccessCode, claimant_id: AccountId) -> HandoverResult<()> {
        let residence = Some(record.residence_id);
        self.accounts
            .set_role(claimant_id, Role::Syndic, residence)
            .await?;
        self.accounts
            .set_role(record.original_owner_id, Role::Resident, residence)
            .await?;

        info!(
            residence = %record.residence_id,
            new_syndic = %claimant_id,
            former_syndic = %record.original_owner_id,
            "syndic role swapped"
        );
        self.audit.record(&HandoverEvent::RolesSwapped {
            code_ref: code_fingerprint(&record.code),
            new_syndic: claimant_id,
            former_syndic: record.original_owner_id,
            residence: record.residence_id,
        });
        Ok(())
    }

    /// Best effort: failures are logged and reported, never propagated.
    async fn cancel_owner_subscriptions(&self, code_ref: &str, owner: AccountId) -> SubscriptionSweep {
        let mut sweep = SubscriptionSweep::default();

        let active = match self
            .external(PAYMENT_GATEWAY, self.billing.list_active_subscriptions(owner))
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(code_ref, %owner, error = %e, "listing owner subscriptions failed; continuing");
                sweep.listing_failed = true;
                Vec::new()
            }
        };

        for id in active {
            match self
                .external(PAYMENT_GATEWAY, self.billing.cancel_subscription(&id))
                .await
            {
                Ok(()) => sweep.cancelled.push(id),
                Err(e) => {
                    error!(code_ref, %owner, subscription = %id, error = %e, "subscription cancel failed; continuing");
                    sweep.failed.push(id);
                }
            }
        }

        self.audit.record(&HandoverEvent::SubscriptionsSwept {
            code_ref: code_ref.to_string(),
            owner,
            cancelled: sweep.cancelled.len(),
            failed: sweep.failed.len() + usize::from(sweep.listing_failed),
        });
        sweep
    }

    /// Run an external call under the configured timeout.
    async fn external<T>(
        &self,
        service: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> HandoverResult<T> {
        let timeout = self.settings.external_call_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(HandoverError::ExternalServiceFailure {
                service,
                message: format!("{e:#}"),
            }),
            Err(_) => Err(HandoverError::ExternalServiceFailure {
                service,
                message: format!("timed out after {}ms", timeout.as_millis()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn accept(&self, code: &str, claimant_email: &str) -> HandoverResult<AccessCode> {
        match self
            .validator
            .validate(code, claimant_email, self.clock.now())
            .await?
        {
            Validation::Accepted(record) => Ok(record),
            Validation::Rejected(rejection) => Err(HandoverError::Rejected(rejection)),
        }
    }

    async fn accept_untracked(&self, code: &str, claimant_email: &str) -> HandoverResult<AccessCode> {
        match self
            .validator
            .validate_untracked(code, claimant_email, self.clock.now())
            .await?
        {
            Validation::Accepted(record) => Ok(record),
            Validation::Rejected(rejection) => Err(HandoverError::Rejected(rejection)),
        }
    }

    async fn bind(&self, code: &str, claimant_id: AccountId) -> HandoverResult<()> {
        match self.codes.bind_claimant(code, claimant_id).await? {
            ClaimBinding::Bound => {
                self.audit.record(&HandoverEvent::ClaimBound {
                    code_ref: code_fingerprint(code),
                    claimant: claimant_id,
                });
                Ok(())
            }
            ClaimBinding::BoundToOther(winner) => Err(HandoverError::Conflict {
                winner: Some(winner),
            }),
            ClaimBinding::Closed => Err(HandoverError::rejected(RejectReason::AlreadyUsed, 0)),
            ClaimBinding::Missing => Err(HandoverError::rejected(RejectReason::NotFound, 0)),
        }
    }

    async fn advance(&self, code: &str, phase: TransferPhase) -> HandoverResult<bool> {
        let open = self.codes.advance_phase(code, phase).await?;
        if open {
            self.audit.record(&HandoverEvent::PhaseAdvanced {
                code_ref: code_fingerprint(code),
                phase,
            });
        }
        Ok(open)
    }

    /// Take the transfer lease, returning the phase the code stood in.
    async fn take_lease(
        &self,
        code: &str,
        holder: Uuid,
        claimant_id: AccountId,
    ) -> HandoverResult<TransferPhase> {
        let now = self.clock.now();
        let until = chrono::Duration::from_std(self.settings.transfer_lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .ok_or_else(|| HandoverError::InvalidRequest("transfer lease out of range".to_string()))?;

        match self
            .codes
            .acquire_transfer_lease(code, holder, now, until)
            .await?
        {
            TransferLease::Granted(phase) => Ok(phase),
            TransferLease::Held => {
                info!(code_ref = %code_fingerprint(code), claimant = %claimant_id, "transfer already running under another call");
                Err(HandoverError::rejected(RejectReason::AlreadyUsed, 0))
            }
            TransferLease::Closed => Err(self.lost_race(code, claimant_id).await?),
        }
    }

    /// Lets a retry take over at once instead of waiting for the lease to
    /// lapse. A failure here only delays that.
    async fn release_lease(&self, code: &str, holder: Uuid) {
        if let Err(e) = self.codes.release_transfer_lease(code, holder).await {
            warn!(code_ref = %code_fingerprint(code), error = %e, "transfer lease release failed; it will lapse");
        }
    }

    /// The code was consumed (or removed) while this call was mid-flight.
    async fn lost_race(&self, code: &str, claimant_id: AccountId) -> HandoverResult<HandoverError> {
        Ok(match self.codes.fetch_code(code).await? {
            Some(current) if current.used => {
                self.race_outcome(&code_fingerprint(code), current.used_by_account_id, claimant_id)
            }
            Some(current) => {
                HandoverError::rejected(RejectReason::AlreadyUsed, current.attempts_remaining())
            }
            None => HandoverError::rejected(RejectReason::NotFound, 0),
        })
    }

    fn race_outcome(
        &self,
        code_ref: &str,
        winner: Option<AccountId>,
        claimant_id: AccountId,
    ) -> HandoverError {
        if winner == Some(claimant_id) {
            info!(code_ref, claimant = %claimant_id, "concurrent completion already consumed this code (benign race)");
            HandoverError::rejected(RejectReason::AlreadyUsed, 0)
        } else {
            warn!(code_ref, claimant = %claimant_id, winner = ?winner, "access code consumed by a different account");
            HandoverError::Conflict { winner }
        }
    }
}
