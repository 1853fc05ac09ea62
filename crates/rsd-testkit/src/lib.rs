//! In-memory doubles for every handover port, plus a [`Harness`] wiring
//! them into a [`Coordinator`]. Used by the scenario tests under `tests/`.

mod fakes;
mod memory;

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use rsd_handover::ports::AuditSink;
use rsd_handover::types::{Account, ResidenceId, Role, VerifiedIdentity};
use rsd_handover::{Coordinator, HandoverDeps, HandoverSettings};

pub use fakes::{BillingFault, FakeBilling, ManualClock, RecordingAudit};
pub use memory::{MemoryStore, OwnedRow};

/// Fixed start instant for scenarios.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn identity(account: &Account) -> VerifiedIdentity {
    VerifiedIdentity::new(account.id, account.email.clone())
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub billing: Arc<FakeBilling>,
    pub audit: Arc<RecordingAudit>,
    pub clock: Arc<ManualClock>,
    pub coordinator: Arc<Coordinator>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::build(HandoverSettings::default(), RecordingAudit::new())
    }

    pub fn with_settings(settings: HandoverSettings) -> Self {
        Self::build(settings, RecordingAudit::new())
    }

    /// Events are recorded and also passed to `sink`.
    pub fn with_audit_sink(sink: Arc<dyn AuditSink>) -> Self {
        Self::build(HandoverSettings::default(), RecordingAudit::forwarding(sink))
    }

    fn build(settings: HandoverSettings, audit: RecordingAudit) -> Self {
        let store = Arc::new(MemoryStore::new());
        let billing = Arc::new(FakeBilling::new());
        let audit = Arc::new(audit);
        let clock = Arc::new(ManualClock::new(t0()));

        let deps = HandoverDeps {
            codes: store.clone(),
            ownership: store.clone(),
            accounts: store.clone(),
            billing: billing.clone(),
            audit: audit.clone(),
            clock: clock.clone(),
        };
        let coordinator = Arc::new(Coordinator::new(deps, settings));

        Self {
            store,
            billing,
            audit,
            clock,
            coordinator,
        }
    }

    /// A syndic running `residence`, owning `rows_per_category` rows in every
    /// ownership category.
    pub fn seed_syndic(&self, email: &str, residence: ResidenceId, rows_per_category: usize) -> Account {
        let account = self
            .store
            .add_account(email, Role::Syndic, Some(residence));
        self.store.seed_residence_data(account.id, rows_per_category);
        account
    }

    /// An account with no residence of its own.
    pub fn seed_fresh(&self, email: &str) -> Account {
        self.store.add_account(email, Role::Resident, None)
    }
}
