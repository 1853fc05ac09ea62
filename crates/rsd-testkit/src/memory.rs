//! In-memory implementation of the storage ports.
//!
//! One mutex guards the whole state, so every conditional write is atomic in
//! the same way a single-row `update … where … returning` is in Postgres.
//! Fault switches let scenarios fail individual steps.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use rsd_handover::ports::{
    AccountDirectory, ClaimBinding, CodeRepository, MarkUsed, OwnershipStore, TransferLease,
};
use rsd_handover::types::{
    AccessCode, Account, AccountId, ActionType, OwnershipCategory, ResidenceId, Role,
    TransferPhase,
};

/// One residence-scoped row; only the owning account matters here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedRow {
    pub id: u64,
    pub owner: AccountId,
}

#[derive(Default)]
struct State {
    codes: BTreeMap<String, AccessCode>,
    /// code → (holder, lapses at)
    leases: BTreeMap<String, (Uuid, DateTime<Utc>)>,
    accounts: BTreeMap<AccountId, Account>,
    rows: BTreeMap<OwnershipCategory, Vec<OwnedRow>>,
    next_row_id: u64,

    fail_repoint: Option<OwnershipCategory>,
    fail_deletion: bool,
    fail_mark_used: bool,
    deleted_accounts: Vec<AccountId>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store mutex poisoned"))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    pub fn add_account(&self, email: &str, role: Role, residence: Option<ResidenceId>) -> Account {
        let account = Account {
            id: AccountId::new_v4(),
            email: email.to_string(),
            role,
            residence_id: residence,
        };
        self.state().accounts.insert(account.id, account.clone());
        account
    }

    /// Give `owner` `count` rows in every ownership category.
    pub fn seed_residence_data(&self, owner: AccountId, count: usize) {
        let mut st = self.state();
        for category in OwnershipCategory::ALL {
            for _ in 0..count {
                st.next_row_id += 1;
                let id = st.next_row_id;
                st.rows
                    .entry(category)
                    .or_default()
                    .push(OwnedRow { id, owner });
            }
        }
    }

    pub fn put_code(&self, code: AccessCode) {
        self.state().codes.insert(code.code.clone(), code);
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    pub fn fail_repoint_of(&self, category: Option<OwnershipCategory>) {
        self.state().fail_repoint = category;
    }

    pub fn fail_account_deletion(&self, fail: bool) {
        self.state().fail_deletion = fail;
    }

    pub fn fail_mark_used(&self, fail: bool) {
        self.state().fail_mark_used = fail;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn code(&self, code: &str) -> Option<AccessCode> {
        self.state().codes.get(code).cloned()
    }

    /// A transfer lease is recorded for `code`, lapsed or not.
    pub fn has_transfer_lease(&self, code: &str) -> bool {
        self.state().leases.contains_key(code)
    }

    pub fn code_count(&self) -> usize {
        self.state().codes.len()
    }

    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.state().accounts.get(&id).cloned()
    }

    pub fn deleted_accounts(&self) -> Vec<AccountId> {
        self.state().deleted_accounts.clone()
    }

    pub fn owned_count(&self, category: OwnershipCategory, owner: AccountId) -> usize {
        self.state()
            .rows
            .get(&category)
            .map(|rows| rows.iter().filter(|r| r.owner == owner).count())
            .unwrap_or(0)
    }

    pub fn owned_total(&self, owner: AccountId) -> usize {
        OwnershipCategory::ALL
            .iter()
            .map(|c| self.owned_count(*c, owner))
            .sum()
    }
}

// ---------------------------------------------------------------------------
// CodeRepository
// ---------------------------------------------------------------------------

#[async_trait]
impl CodeRepository for MemoryStore {
    async fn insert_code(&self, code: &AccessCode) -> Result<bool> {
        let mut st = self.lock()?;
        if st.codes.contains_key(&code.code) {
            return Ok(false);
        }
        st.codes.insert(code.code.clone(), code.clone());
        Ok(true)
    }

    async fn fetch_code(&self, code: &str) -> Result<Option<AccessCode>> {
        Ok(self.lock()?.codes.get(code).cloned())
    }

    async fn list_codes_for_owner(&self, owner: AccountId) -> Result<Vec<AccessCode>> {
        let st = self.lock()?;
        let mut out: Vec<AccessCode> = st
            .codes
            .values()
            .filter(|c| c.original_owner_id == owner)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn delete_cancellable_code(&self, code: &str, owner: AccountId) -> Result<bool> {
        let mut st = self.lock()?;
        let deletable = st
            .codes
            .get(code)
            .map(|c| c.original_owner_id == owner && !c.used && c.phase.is_cancellable())
            .unwrap_or(false);
        if deletable {
            st.codes.remove(code);
        }
        Ok(deletable)
    }

    async fn supersede_outstanding(
        &self,
        owner: AccountId,
        residence: ResidenceId,
        action: ActionType,
    ) -> Result<u64> {
        let mut st = self.lock()?;
        let before = st.codes.len();
        st.codes.retain(|_, c| {
            !(c.original_owner_id == owner
                && c.residence_id == residence
                && c.action_type == action
                && !c.used
                && c.phase.is_cancellable())
        });
        Ok((before - st.codes.len()) as u64)
    }

    async fn increment_failed_attempts(&self, code: &str) -> Result<Option<i32>> {
        let mut st = self.lock()?;
        Ok(st.codes.get_mut(code).map(|c| {
            c.failed_attempts += 1;
            c.failed_attempts
        }))
    }

    async fn bind_claimant(&self, code: &str, claimant: AccountId) -> Result<ClaimBinding> {
        let mut st = self.lock()?;
        let Some(c) = st.codes.get_mut(code) else {
            return Ok(ClaimBinding::Missing);
        };
        if c.used {
            return Ok(ClaimBinding::Closed);
        }
        let current = c.claimed_by_account_id;
        match current {
            Some(bound) if bound == claimant => Ok(ClaimBinding::Bound),
            Some(other) => Ok(ClaimBinding::BoundToOther(other)),
            None if c.phase == TransferPhase::Issued => {
                c.claimed_by_account_id = Some(claimant);
                c.phase = TransferPhase::ClaimPending;
                Ok(ClaimBinding::Bound)
            }
            None => Ok(ClaimBinding::Closed),
        }
    }

    async fn advance_phase(&self, code: &str, to: TransferPhase) -> Result<bool> {
        let mut st = self.lock()?;
        match st.codes.get_mut(code) {
            Some(c) if !c.used => {
                if c.phase < to {
                    c.phase = to;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn acquire_transfer_lease(
        &self,
        code: &str,
        holder: Uuid,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<TransferLease> {
        let mut st = self.lock()?;
        let phase = match st.codes.get(code) {
            Some(c) if !c.used => c.phase,
            _ => return Ok(TransferLease::Closed),
        };
        if let Some((current, lapses_at)) = st.leases.get(code) {
            if *current != holder && *lapses_at > now {
                return Ok(TransferLease::Held);
            }
        }
        st.leases.insert(code.to_string(), (holder, until));
        Ok(TransferLease::Granted(phase))
    }

    async fn release_transfer_lease(&self, code: &str, holder: Uuid) -> Result<()> {
        let mut st = self.lock()?;
        if st.leases.get(code).is_some_and(|(current, _)| *current == holder) {
            st.leases.remove(code);
        }
        Ok(())
    }

    async fn mark_used(
        &self,
        code: &str,
        account: AccountId,
        at: DateTime<Utc>,
    ) -> Result<MarkUsed> {
        let mut st = self.lock()?;
        if st.fail_mark_used {
            bail!("injected failure: mark_used");
        }
        let Some(c) = st.codes.get_mut(code) else {
            return Ok(MarkUsed::Missing);
        };
        if c.used {
            return Ok(MarkUsed::AlreadyUsedBy(c.used_by_account_id));
        }
        c.used = true;
        c.used_by_account_id = Some(account);
        c.used_at = Some(at);
        c.phase = TransferPhase::Complete;
        st.leases.remove(code);
        Ok(MarkUsed::Marked)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut st = self.lock()?;
        let before = st.codes.len();
        st.codes
            .retain(|_, c| !(c.is_expired(now) && !c.used && c.phase.is_cancellable()));
        Ok((before - st.codes.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// OwnershipStore
// ---------------------------------------------------------------------------

#[async_trait]
impl OwnershipStore for MemoryStore {
    async fn count_owned(&self, category: OwnershipCategory, owner: AccountId) -> Result<u64> {
        let st = self.lock()?;
        Ok(st
            .rows
            .get(&category)
            .map(|rows| rows.iter().filter(|r| r.owner == owner).count() as u64)
            .unwrap_or(0))
    }

    async fn repoint(
        &self,
        category: OwnershipCategory,
        from: AccountId,
        to: AccountId,
    ) -> Result<u64> {
        let mut st = self.lock()?;
        if st.fail_repoint == Some(category) {
            bail!("injected failure: repoint {}", category);
        }
        let mut moved = 0;
        for row in st.rows.entry(category).or_default().iter_mut() {
            if row.owner == from {
                row.owner = to;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

// ---------------------------------------------------------------------------
// AccountDirectory
// ---------------------------------------------------------------------------

#[async_trait]
impl AccountDirectory for MemoryStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let needle = email.trim().to_lowercase();
        let st = self.lock()?;
        Ok(st
            .accounts
            .values()
            .find(|a| a.email.to_lowercase() == needle)
            .cloned())
    }

    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.lock()?.accounts.get(&id).cloned())
    }

    async fn set_role(
        &self,
        id: AccountId,
        role: Role,
        residence: Option<ResidenceId>,
    ) -> Result<()> {
        let mut st = self.lock()?;
        let Some(account) = st.accounts.get_mut(&id) else {
            bail!("set_role: account {} not found", id);
        };
        account.role = role;
        account.residence_id = residence;
        Ok(())
    }

    async fn delete_account_cascade(&self, id: AccountId) -> Result<()> {
        let mut st = self.lock()?;
        if st.fail_deletion {
            bail!("injected failure: delete account {}", id);
        }
        if st.accounts.remove(&id).is_none() {
            bail!("delete: account {} not found", id);
        }
        for rows in st.rows.values_mut() {
            rows.retain(|r| r.owner != id);
        }
        st.codes.retain(|_, c| c.original_owner_id != id);
        st.deleted_accounts.push(id);
        Ok(())
    }
}
