//! Domain types for the handover protocol.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Failed validation attempts tolerated against one code before it is
/// invalidated and the claimant account is removed.
pub const MAX_FAILED_ATTEMPTS: i32 = 3;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Account identity as issued by the identity provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub Uuid);

impl AccountId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Residence (tenant) identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResidenceId(pub i64);

impl std::fmt::Display for ResidenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque subscription handle owned by the payment gateway.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller identity supplied by the identity/session provider.
///
/// The email here is the provider-verified address. Client-supplied strings
/// must never be turned into a `VerifiedIdentity`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub account_id: AccountId,
    pub email: String,
}

impl VerifiedIdentity {
    pub fn new(account_id: AccountId, email: impl Into<String>) -> Self {
        Self {
            account_id,
            email: email.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionType
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Replace the syndic and move the residence's data to the claimant.
    ChangeRole,
    /// Confirms an account deletion handoff; consumed without a transfer.
    DeleteAccount,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ChangeRole => "CHANGE_ROLE",
            ActionType::DeleteAccount => "DELETE_ACCOUNT",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "CHANGE_ROLE" => Ok(ActionType::ChangeRole),
            "DELETE_ACCOUNT" => Ok(ActionType::DeleteAccount),
            other => Err(anyhow!("invalid action type: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// TransferPhase
// ---------------------------------------------------------------------------

/// Persisted protocol phase of a code.
///
/// ```text
/// ISSUED ─claim─► CLAIM_PENDING ─finalize/complete─► DATA_TRANSFERRING
///     ─► ROLE_SWAPPED ─► SUBSCRIPTIONS_CANCELLED ─► COMPLETE
/// ```
///
/// Phases only move forward. Cancellation deletes the record and is only
/// possible while the phase is still cancellable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferPhase {
    Issued,
    ClaimPending,
    DataTransferring,
    RoleSwapped,
    SubscriptionsCancelled,
    Complete,
}

impl TransferPhase {
    pub const ALL: [TransferPhase; 6] = [
        TransferPhase::Issued,
        TransferPhase::ClaimPending,
        TransferPhase::DataTransferring,
        TransferPhase::RoleSwapped,
        TransferPhase::SubscriptionsCancelled,
        TransferPhase::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferPhase::Issued => "ISSUED",
            TransferPhase::ClaimPending => "CLAIM_PENDING",
            TransferPhase::DataTransferring => "DATA_TRANSFERRING",
            TransferPhase::RoleSwapped => "ROLE_SWAPPED",
            TransferPhase::SubscriptionsCancelled => "SUBSCRIPTIONS_CANCELLED",
            TransferPhase::Complete => "COMPLETE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        TransferPhase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| anyhow!("invalid transfer phase: {}", s))
    }

    /// The owner may still abort the handover.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, TransferPhase::Issued | TransferPhase::ClaimPending)
    }

    /// Every phase strictly before `self`, in order.
    pub fn predecessors(&self) -> Vec<TransferPhase> {
        TransferPhase::ALL
            .iter()
            .copied()
            .filter(|p| p < self)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// AccessCode
// ---------------------------------------------------------------------------

/// One issued access code and its protocol state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCode {
    pub code: String,
    pub original_owner_id: AccountId,
    pub replacement_email: String,
    pub action_type: ActionType,
    pub residence_id: ResidenceId,
    pub failed_attempts: i32,
    pub used: bool,
    pub phase: TransferPhase,
    /// Set by the first-claim step (ISSUED → CLAIM_PENDING).
    pub claimed_by_account_id: Option<AccountId>,
    pub used_by_account_id: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl AccessCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn attempts_remaining(&self) -> i32 {
        (MAX_FAILED_ATTEMPTS - self.failed_attempts).max(0)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.failed_attempts >= MAX_FAILED_ATTEMPTS
    }

    /// Data transfer has started and the code is not yet consumed. The owner
    /// can no longer cancel, and the bound claimant may resume regardless of
    /// expiry or attempts.
    pub fn is_in_flight(&self) -> bool {
        !self.used && self.phase >= TransferPhase::DataTransferring
    }

    /// `!used && failed_attempts < 3 && now <= expires_at`
    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.attempts_exhausted() && !self.is_expired(now)
    }
}

/// Read-only status view returned by `check_code_status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeStatus {
    pub exists: bool,
    pub used: bool,
    pub attempts_remaining: i32,
    pub expired: bool,
    pub phase: Option<TransferPhase>,
}

impl CodeStatus {
    pub fn missing() -> Self {
        Self {
            exists: false,
            used: false,
            attempts_remaining: 0,
            expired: false,
            phase: None,
        }
    }

    pub fn of(code: &AccessCode, now: DateTime<Utc>) -> Self {
        Self {
            exists: true,
            used: code.used,
            attempts_remaining: code.attempts_remaining(),
            expired: code.is_expired(now),
            phase: Some(code.phase),
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Syndic,
    Resident,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Syndic => "SYNDIC",
            Role::Resident => "RESIDENT",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "SYNDIC" => Ok(Role::Syndic),
            "RESIDENT" => Ok(Role::Resident),
            other => Err(anyhow!("invalid role: {}", other)),
        }
    }
}

/// Account directory entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub role: Role,
    pub residence_id: Option<ResidenceId>,
}

impl Account {
    /// Eligible for the one-party completion path: not already running a
    /// residence of its own.
    pub fn is_fresh(&self) -> bool {
        self.role != Role::Syndic
    }

    pub fn is_syndic_of(&self, residence: ResidenceId) -> bool {
        self.role == Role::Syndic && self.residence_id == Some(residence)
    }
}

// ---------------------------------------------------------------------------
// OwnershipCategory (the residence ownership set)
// ---------------------------------------------------------------------------

/// Record categories whose owning account is re-pointed during a transfer.
///
/// The residence record comes first, dependent child records after. The order
/// of [`OwnershipCategory::ALL`] is the transfer order and must stay stable so
/// a partially applied transfer is recognizable and resumable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipCategory {
    Residence,
    Residents,
    Fees,
    ExpenseCategories,
    Payments,
    ContributionPlans,
    DocumentSubmissions,
}

impl OwnershipCategory {
    pub const ALL: [OwnershipCategory; 7] = [
        OwnershipCategory::Residence,
        OwnershipCategory::Residents,
        OwnershipCategory::Fees,
        OwnershipCategory::ExpenseCategories,
        OwnershipCategory::Payments,
        OwnershipCategory::ContributionPlans,
        OwnershipCategory::DocumentSubmissions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipCategory::Residence => "residence",
            OwnershipCategory::Residents => "residents",
            OwnershipCategory::Fees => "fees",
            OwnershipCategory::ExpenseCategories => "expense_categories",
            OwnershipCategory::Payments => "payments",
            OwnershipCategory::ContributionPlans => "contribution_plans",
            OwnershipCategory::DocumentSubmissions => "document_submissions",
        }
    }
}

impl std::fmt::Display for OwnershipCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_and_orders() {
        for p in TransferPhase::ALL {
            assert_eq!(TransferPhase::parse(p.as_str()).unwrap(), p);
        }
        assert!(TransferPhase::Issued < TransferPhase::Complete);
        assert_eq!(
            TransferPhase::RoleSwapped.predecessors(),
            vec![
                TransferPhase::Issued,
                TransferPhase::ClaimPending,
                TransferPhase::DataTransferring
            ]
        );
        assert!(TransferPhase::ClaimPending.is_cancellable());
        assert!(!TransferPhase::DataTransferring.is_cancellable());
    }

    #[test]
    fn ownership_order_starts_with_residence() {
        assert_eq!(OwnershipCategory::ALL[0], OwnershipCategory::Residence);
        let mut sorted = OwnershipCategory::ALL;
        sorted.sort();
        assert_eq!(sorted, OwnershipCategory::ALL, "declaration order is transfer order");
    }

    #[test]
    fn attempts_remaining_never_negative() {
        let now = Utc::now();
        let mut code = AccessCode {
            code: "ABCD2345".to_string(),
            original_owner_id: AccountId::new_v4(),
            replacement_email: "r@example.com".to_string(),
            action_type: ActionType::ChangeRole,
            residence_id: ResidenceId(1),
            failed_attempts: 0,
            used: false,
            phase: TransferPhase::Issued,
            claimed_by_account_id: None,
            used_by_account_id: None,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            used_at: None,
        };
        assert_eq!(code.attempts_remaining(), 3);
        assert!(code.is_consumable(now));
        code.failed_attempts = 5;
        assert_eq!(code.attempts_remaining(), 0);
        assert!(!code.is_consumable(now));
    }
}
