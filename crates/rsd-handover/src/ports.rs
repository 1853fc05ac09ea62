//! Collaborator seams.
//!
//! The protocol logic only talks to storage, the account directory and the
//! payment gateway through these traits. `rsd-db` implements the storage
//! traits over Postgres, `rsd-billing` the gateway, `rsd-testkit` all of them
//! in memory.
//!
//! Every storage method that changes protocol state is a single conditional
//! write. Implementations MUST keep that atomicity; the coordinator relies on
//! it instead of holding locks.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::HandoverEvent;
use crate::types::{
    AccessCode, Account, AccountId, ActionType, OwnershipCategory, ResidenceId, Role,
    SubscriptionId, TransferPhase,
};

// ---------------------------------------------------------------------------
// Code persistence
// ---------------------------------------------------------------------------

/// Result of the atomic `used: false → true` write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkUsed {
    /// This call flipped the flag.
    Marked,
    /// Someone already consumed the code (possibly this same account).
    AlreadyUsedBy(Option<AccountId>),
    Missing,
}

/// Result of binding a claimant to a code (ISSUED → CLAIM_PENDING).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimBinding {
    /// Bound now, or was already bound to this same account.
    Bound,
    /// Already bound to a different account.
    BoundToOther(AccountId),
    /// Used, or past the phases in which a claim may be recorded.
    Closed,
    Missing,
}

/// Result of trying to take the transfer lease on a code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferLease {
    /// The caller holds the lease; carries the phase the code is in.
    Granted(TransferPhase),
    /// Another live caller holds it.
    Held,
    /// Used or missing.
    Closed,
}

#[async_trait]
pub trait CodeRepository: Send + Sync {
    /// Insert a new code. Returns `false` on a duplicate token.
    async fn insert_code(&self, code: &AccessCode) -> Result<bool>;

    async fn fetch_code(&self, code: &str) -> Result<Option<AccessCode>>;

    async fn list_codes_for_owner(&self, owner: AccountId) -> Result<Vec<AccessCode>>;

    /// Delete iff owned by `owner`, unused, and still in a cancellable phase.
    async fn delete_cancellable_code(&self, code: &str, owner: AccountId) -> Result<bool>;

    /// Delete the owner's outstanding cancellable codes for this residence
    /// and action. Returns the number removed.
    async fn supersede_outstanding(
        &self,
        owner: AccountId,
        residence: ResidenceId,
        action: ActionType,
    ) -> Result<u64>;

    /// Atomic `failed_attempts = failed_attempts + 1`, returning the new
    /// value, or `None` when the code does not exist.
    async fn increment_failed_attempts(&self, code: &str) -> Result<Option<i32>>;

    /// Bind `claimant` to an unused code. An unbound code must still be
    /// ISSUED and moves to CLAIM_PENDING; re-binding the same account is a
    /// no-op in any unused phase.
    async fn bind_claimant(&self, code: &str, claimant: AccountId) -> Result<ClaimBinding>;

    /// Move an unused code forward to `to` (never backwards). Returns `true`
    /// iff the code exists and is still unused.
    async fn advance_phase(&self, code: &str, to: TransferPhase) -> Result<bool>;

    /// Take the lease guarding a code's transfer steps for `holder` until
    /// `until`. Granted iff the code is unused and the lease is free, lapsed
    /// at `now`, or already held by `holder`.
    async fn acquire_transfer_lease(
        &self,
        code: &str,
        holder: Uuid,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<TransferLease>;

    /// Drop the lease iff `holder` still holds it.
    async fn release_transfer_lease(&self, code: &str, holder: Uuid) -> Result<()>;

    /// Atomic conditional `used: false → true`, binding `account`, moving
    /// the phase to COMPLETE and dropping any transfer lease.
    async fn mark_used(&self, code: &str, account: AccountId, at: DateTime<Utc>)
        -> Result<MarkUsed>;

    /// Delete expired codes that are unused and still cancellable.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Residence-scoped data
// ---------------------------------------------------------------------------

#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// Rows in `category` whose owning account is `owner`.
    async fn count_owned(&self, category: OwnershipCategory, owner: AccountId) -> Result<u64>;

    /// Re-point every row in `category` owned by `from` to `to`.
    async fn repoint(
        &self,
        category: OwnershipCategory,
        from: AccountId,
        to: AccountId,
    ) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Account directory
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Case-insensitive lookup.
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>>;

    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>>;

    async fn set_role(
        &self,
        id: AccountId,
        role: Role,
        residence: Option<ResidenceId>,
    ) -> Result<()>;

    /// Irreversibly delete the account and every record that only exists
    /// because of it.
    async fn delete_account_cascade(&self, id: AccountId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Payment gateway
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn list_active_subscriptions(&self, owner: AccountId) -> Result<Vec<SubscriptionId>>;

    async fn cancel_subscription(&self, id: &SubscriptionId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Audit + time
// ---------------------------------------------------------------------------

/// Receives protocol events. Implementations swallow their own failures;
/// auditing never changes a protocol outcome.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &HandoverEvent);
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _event: &HandoverEvent) {}
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
