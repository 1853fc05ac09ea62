//! Code Validator.
//!
//! [`check`] is the pure rule set. [`CodeValidator`] applies it to the stored
//! record and owns the single rejection path: attempt accounting and, on
//! exhaustion, remediation. Both entry points (`validate` for session callers,
//! `validate_for_user` for pre-signup callers) go through that one path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attempts::AttemptTracker;
use crate::error::{HandoverResult, RejectReason, Rejection};
use crate::events::{code_fingerprint, HandoverEvent};
use crate::ports::{AuditSink, CodeRepository};
use crate::remediation::Remediator;
use crate::types::AccessCode;

/// Case-insensitive, whitespace-trimmed email equality.
pub fn emails_match(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Apply the validation rules in order:
/// NotFound → AlreadyUsed → Expired → EmailMismatch → TooManyAttempts.
///
/// A code already in flight is accepted for its replacement email without
/// the expiry and attempt rules, so an interrupted transfer can always be
/// driven to completion.
pub fn check<'a>(
    record: Option<&'a AccessCode>,
    claimant_email: &str,
    now: DateTime<Utc>,
) -> Result<&'a AccessCode, RejectReason> {
    let record = record.ok_or(RejectReason::NotFound)?;
    if record.used {
        return Err(RejectReason::AlreadyUsed);
    }
    if record.is_in_flight() && emails_match(claimant_email, &record.replacement_email) {
        return Ok(record);
    }
    if record.is_expired(now) {
        return Err(RejectReason::Expired);
    }
    if !emails_match(claimant_email, &record.replacement_email) {
        return Err(RejectReason::EmailMismatch);
    }
    if record.attempts_exhausted() {
        return Err(RejectReason::TooManyAttempts);
    }
    Ok(record)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Validation {
    Accepted(AccessCode),
    Rejected(Rejection),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted(_))
    }
}

/// Flattened validation result for callers outside an authenticated session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserValidation {
    pub valid: bool,
    pub reason: Option<RejectReason>,
    pub attempts_remaining: i32,
    /// The code can no longer be redeemed by anyone.
    pub code_deleted: bool,
    pub account_deleted: bool,
}

pub struct CodeValidator {
    repo: Arc<dyn CodeRepository>,
    tracker: AttemptTracker,
    remediator: Remediator,
    audit: Arc<dyn AuditSink>,
}

impl CodeValidator {
    pub fn new(
        repo: Arc<dyn CodeRepository>,
        remediator: Remediator,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            tracker: AttemptTracker::new(Arc::clone(&repo)),
            repo,
            remediator,
            audit,
        }
    }

    /// Validate a presented (code, verified claimant email) pair at `now`.
    pub async fn validate(
        &self,
        code: &str,
        claimant_email: &str,
        now: DateTime<Utc>,
    ) -> HandoverResult<Validation> {
        let record = self.repo.fetch_code(code).await?;
        match check(record.as_ref(), claimant_email, now) {
            Ok(accepted) => Ok(Validation::Accepted(accepted.clone())),
            Err(RejectReason::NotFound) => {
                // Nothing to protect; no counter to touch.
                Ok(Validation::Rejected(Rejection::untracked(RejectReason::NotFound, 0)))
            }
            Err(reason) => {
                // `check` only yields NotFound for a missing record.
                let Some(record) = record else {
                    return Ok(Validation::Rejected(Rejection::untracked(
                        RejectReason::NotFound,
                        0,
                    )));
                };
                let rejection = self.reject(&record, reason, claimant_email).await?;
                Ok(Validation::Rejected(rejection))
            }
        }
    }

    /// Same rules as [`validate`](Self::validate), but a refusal counts no
    /// attempt and never remediates. For the issuer confirming a claim: the
    /// issuer is not guessing, and its retries must not cost the claimant.
    pub async fn validate_untracked(
        &self,
        code: &str,
        claimant_email: &str,
        now: DateTime<Utc>,
    ) -> HandoverResult<Validation> {
        let record = self.repo.fetch_code(code).await?;
        Ok(match check(record.as_ref(), claimant_email, now) {
            Ok(accepted) => Validation::Accepted(accepted.clone()),
            Err(reason) => {
                let remaining = record.as_ref().map_or(0, AccessCode::attempts_remaining);
                let rejection = Rejection::untracked(reason, remaining);
                self.emit_rejected(&code_fingerprint(code), &rejection);
                Validation::Rejected(rejection)
            }
        })
    }

    /// Same rules as [`validate`](Self::validate), flattened for UIs.
    pub async fn validate_for_user(
        &self,
        code: &str,
        claimant_email: &str,
        now: DateTime<Utc>,
    ) -> HandoverResult<UserValidation> {
        Ok(match self.validate(code, claimant_email, now).await? {
            Validation::Accepted(record) => UserValidation {
                valid: true,
                reason: None,
                attempts_remaining: record.attempts_remaining(),
                code_deleted: false,
                account_deleted: false,
            },
            Validation::Rejected(r) => UserValidation {
                valid: false,
                reason: Some(r.reason),
                attempts_remaining: r.attempts_remaining,
                code_deleted: r.code_invalidated || r.reason == RejectReason::TooManyAttempts,
                account_deleted: r.account_deleted(),
            },
        })
    }

    /// The one rejection path: count the attempt, remediate on exhaustion.
    async fn reject(
        &self,
        record: &AccessCode,
        reason: RejectReason,
        claimant_email: &str,
    ) -> HandoverResult<Rejection> {
        let code_ref = code_fingerprint(&record.code);

        // The rightful claimant re-presenting a code it already redeemed is a
        // replay, not a guess. Counting it would let the new syndic's own
        // retries delete the new syndic.
        if reason == RejectReason::AlreadyUsed
            && emails_match(claimant_email, &record.replacement_email)
        {
            info!(code_ref = %code_ref, "access code replayed by its rightful claimant");
            let rejection = Rejection::untracked(reason, record.attempts_remaining());
            self.emit_rejected(&code_ref, &rejection);
            return Ok(rejection);
        }

        let Some(outcome) = self.tracker.record_failure(&record.code, claimant_email).await?
        else {
            let rejection = Rejection::untracked(reason, 0);
            self.emit_rejected(&code_ref, &rejection);
            return Ok(rejection);
        };

        // The exhausting attempt is reported as such, whatever rule it broke.
        let reason = if outcome.code_invalidated {
            RejectReason::TooManyAttempts
        } else {
            reason
        };
        let mut rejection = Rejection {
            reason,
            attempts_remaining: outcome.attempts_remaining,
            code_invalidated: outcome.code_invalidated,
            remediation: None,
        };
        self.emit_rejected(&code_ref, &rejection);

        if outcome.code_invalidated {
            self.audit.record(&HandoverEvent::AttemptsExhausted {
                code_ref: code_ref.clone(),
            });
            let remediation = self.remediator.remediate(record, claimant_email).await;
            self.audit.record(&HandoverEvent::RemediationExecuted {
                code_ref,
                outcome: remediation.clone(),
            });
            rejection.remediation = Some(remediation);
        }

        Ok(rejection)
    }

    fn emit_rejected(&self, code_ref: &str, rejection: &Rejection) {
        self.audit.record(&HandoverEvent::ValidationRejected {
            code_ref: code_ref.to_string(),
            reason: rejection.reason,
            attempts_remaining: rejection.attempts_remaining,
        });
    }
}
