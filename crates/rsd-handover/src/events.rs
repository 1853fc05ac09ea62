//! Protocol events emitted to the [`AuditSink`](crate::ports::AuditSink).
//!
//! Codes are bearer secrets: events and log lines carry
//! [`code_fingerprint`] instead of the raw token.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RejectReason;
use crate::remediation::RemediationOutcome;
use crate::types::{AccountId, ActionType, OwnershipCategory, ResidenceId, TransferPhase};

/// Short stable identifier for a code, safe to log.
pub fn code_fingerprint(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..12].to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandoverEvent {
    CodeIssued {
        code_ref: String,
        owner: AccountId,
        residence: ResidenceId,
        action: ActionType,
        superseded: u64,
    },
    CodeCancelled {
        code_ref: String,
        owner: AccountId,
    },
    ValidationRejected {
        code_ref: String,
        reason: RejectReason,
        attempts_remaining: i32,
    },
    AttemptsExhausted {
        code_ref: String,
    },
    RemediationExecuted {
        code_ref: String,
        outcome: RemediationOutcome,
    },
    ClaimBound {
        code_ref: String,
        claimant: AccountId,
    },
    PhaseAdvanced {
        code_ref: String,
        phase: TransferPhase,
    },
    OwnershipTransferred {
        code_ref: String,
        from: AccountId,
        to: AccountId,
        rows_moved: u64,
    },
    OwnershipTransferFailed {
        code_ref: String,
        completed: Vec<OwnershipCategory>,
        failed: OwnershipCategory,
    },
    RolesSwapped {
        code_ref: String,
        new_syndic: AccountId,
        former_syndic: AccountId,
        residence: ResidenceId,
    },
    SubscriptionsSwept {
        code_ref: String,
        owner: AccountId,
        cancelled: usize,
        failed: usize,
    },
    CodeConsumed {
        code_ref: String,
        account: AccountId,
    },
    ExpiredPurged {
        count: u64,
    },
}

impl HandoverEvent {
    /// Stable event name for audit records.
    pub fn event_type(&self) -> &'static str {
        match self {
            HandoverEvent::CodeIssued { .. } => "CODE_ISSUED",
            HandoverEvent::CodeCancelled { .. } => "CODE_CANCELLED",
            HandoverEvent::ValidationRejected { .. } => "VALIDATION_REJECTED",
            HandoverEvent::AttemptsExhausted { .. } => "ATTEMPTS_EXHAUSTED",
            HandoverEvent::RemediationExecuted { .. } => "REMEDIATION_EXECUTED",
            HandoverEvent::ClaimBound { .. } => "CLAIM_BOUND",
            HandoverEvent::PhaseAdvanced { .. } => "PHASE_ADVANCED",
            HandoverEvent::OwnershipTransferred { .. } => "OWNERSHIP_TRANSFERRED",
            HandoverEvent::OwnershipTransferFailed { .. } => "OWNERSHIP_TRANSFER_FAILED",
            HandoverEvent::RolesSwapped { .. } => "ROLES_SWAPPED",
            HandoverEvent::SubscriptionsSwept { .. } => "SUBSCRIPTIONS_SWEPT",
            HandoverEvent::CodeConsumed { .. } => "CODE_CONSUMED",
            HandoverEvent::ExpiredPurged { .. } => "EXPIRED_PURGED",
        }
    }

    /// Fingerprint of the code this event concerns, if any.
    pub fn code_ref(&self) -> Option<&str> {
        match self {
            HandoverEvent::CodeIssued { code_ref, .. }
            | HandoverEvent::CodeCancelled { code_ref, .. }
            | HandoverEvent::ValidationRejected { code_ref, .. }
            | HandoverEvent::AttemptsExhausted { code_ref }
            | HandoverEvent::RemediationExecuted { code_ref, .. }
            | HandoverEvent::ClaimBound { code_ref, .. }
            | HandoverEvent::PhaseAdvanced { code_ref, .. }
            | HandoverEvent::OwnershipTransferred { code_ref, .. }
            | HandoverEvent::OwnershipTransferFailed { code_ref, .. }
            | HandoverEvent::RolesSwapped { code_ref, .. }
            | HandoverEvent::SubscriptionsSwept { code_ref, .. }
            | HandoverEvent::CodeConsumed { code_ref, .. } => Some(code_ref),
            HandoverEvent::ExpiredPurged { .. } => None,
        }
    }
}
