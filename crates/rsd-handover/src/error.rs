//! Error taxonomy for the handover protocol.
//!
//! Validation failures (`NotFound` … `TooManyAttempts`) travel as a
//! [`Rejection`] so callers also receive the attempt accounting and the
//! advisory remediation outcome. Everything else is a dedicated variant.

use serde::{Deserialize, Serialize};

use crate::remediation::RemediationOutcome;
use crate::types::{AccountId, OwnershipCategory};

/// Why a presented (code, identity) pair was refused. Checked in declaration
/// order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    NotFound,
    AlreadyUsed,
    Expired,
    EmailMismatch,
    TooManyAttempts,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotFound => "NOT_FOUND",
            RejectReason::AlreadyUsed => "ALREADY_USED",
            RejectReason::Expired => "EXPIRED",
            RejectReason::EmailMismatch => "EMAIL_MISMATCH",
            RejectReason::TooManyAttempts => "TOO_MANY_ATTEMPTS",
        }
    }

    /// User-facing message.
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::NotFound => "This access code does not exist.",
            RejectReason::AlreadyUsed => "This access code has already been used.",
            RejectReason::Expired => "This access code has expired.",
            RejectReason::EmailMismatch => {
                "This access code was issued for a different email address."
            }
            RejectReason::TooManyAttempts => {
                "Too many failed attempts; this access code is no longer valid."
            }
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused validation, with its side effects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub attempts_remaining: i32,
    /// The attempt that produced this rejection exhausted the code.
    pub code_invalidated: bool,
    /// Present only when `code_invalidated` triggered the remediation path.
    pub remediation: Option<RemediationOutcome>,
}

impl Rejection {
    /// A rejection that touched no counter.
    pub fn untracked(reason: RejectReason, attempts_remaining: i32) -> Self {
        Self {
            reason,
            attempts_remaining,
            code_invalidated: false,
            remediation: None,
        }
    }

    /// Best-effort flag: the claimant account was removed by remediation.
    pub fn account_deleted(&self) -> bool {
        self.remediation
            .as_ref()
            .map(RemediationOutcome::account_deleted)
            .unwrap_or(false)
    }
}

/// Steps completed before a transfer category failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialTransfer {
    pub completed: Vec<OwnershipCategory>,
    pub failed: OwnershipCategory,
    pub cause: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HandoverError {
    #[error("access code rejected: {}", .0.reason)]
    Rejected(Rejection),

    #[error("requester is not the owner of this access code")]
    Forbidden,

    #[error("access code has not been claimed by a replacement account")]
    ClaimNotPending,

    #[error("access code was consumed by another account ({winner:?})")]
    Conflict { winner: Option<AccountId> },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("external service failure ({service}): {message}")]
    ExternalServiceFailure {
        service: &'static str,
        message: String,
    },

    #[error(
        "partial transfer failure at {} after {} completed categories: {}",
        .0.failed,
        .0.completed.len(),
        .0.cause
    )]
    PartialTransferFailure(PartialTransfer),

    #[error("store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl HandoverError {
    pub fn rejected(reason: RejectReason, attempts_remaining: i32) -> Self {
        HandoverError::Rejected(Rejection::untracked(reason, attempts_remaining))
    }

    /// Validation reason, when this error is a rejection.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            HandoverError::Rejected(r) => Some(r.reason),
            _ => None,
        }
    }

    pub fn is_already_used(&self) -> bool {
        self.reject_reason() == Some(RejectReason::AlreadyUsed)
    }
}

pub type HandoverResult<T> = std::result::Result<T, HandoverError>;
