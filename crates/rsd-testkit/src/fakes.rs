//! Fake payment gateway, recording audit sink and manual clock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rsd_handover::events::HandoverEvent;
use rsd_handover::ports::{AuditSink, Clock, PaymentGateway};
use rsd_handover::types::{AccountId, SubscriptionId};

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// FakeBilling
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BillingFault {
    #[default]
    None,
    /// Every cancel returns an error.
    FailCancel,
    /// Listing returns an error.
    FailList,
    /// Every cancel sleeps for this long before succeeding.
    HangCancel(Duration),
}

#[derive(Default)]
struct BillingState {
    active: BTreeMap<AccountId, BTreeSet<String>>,
    cancelled: Vec<SubscriptionId>,
    cancel_calls: usize,
}

/// Payment gateway double keyed by owner account.
#[derive(Default)]
pub struct FakeBilling {
    state: Mutex<BillingState>,
    fault: Mutex<BillingFault>,
}

impl FakeBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(&self, owner: AccountId, id: &str) {
        guard(&self.state)
            .active
            .entry(owner)
            .or_default()
            .insert(id.to_string());
    }

    pub fn set_fault(&self, fault: BillingFault) {
        *guard(&self.fault) = fault;
    }

    pub fn active_for(&self, owner: AccountId) -> Vec<String> {
        guard(&self.state)
            .active
            .get(&owner)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cancelled(&self) -> Vec<SubscriptionId> {
        guard(&self.state).cancelled.clone()
    }

    pub fn cancel_calls(&self) -> usize {
        guard(&self.state).cancel_calls
    }
}

#[async_trait]
impl PaymentGateway for FakeBilling {
    async fn list_active_subscriptions(&self, owner: AccountId) -> Result<Vec<SubscriptionId>> {
        if *guard(&self.fault) == BillingFault::FailList {
            bail!("injected failure: list subscriptions");
        }
        Ok(self
            .active_for(owner)
            .into_iter()
            .map(SubscriptionId)
            .collect())
    }

    async fn cancel_subscription(&self, id: &SubscriptionId) -> Result<()> {
        guard(&self.state).cancel_calls += 1;
        let fault = *guard(&self.fault);
        match fault {
            BillingFault::FailCancel => bail!("injected failure: cancel {}", id),
            BillingFault::HangCancel(d) => tokio::time::sleep(d).await,
            BillingFault::None | BillingFault::FailList => {}
        }

        let mut st = guard(&self.state);
        let mut found = false;
        for subs in st.active.values_mut() {
            found |= subs.remove(&id.0);
        }
        if !found {
            bail!("no such subscription: {}", id);
        }
        st.cancelled.push(id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingAudit
// ---------------------------------------------------------------------------

/// Keeps every emitted event in memory, optionally passing it on.
#[derive(Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<HandoverEvent>>,
    forward: Option<Arc<dyn AuditSink>>,
}

impl RecordingAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            forward: Some(sink),
        }
    }

    pub fn events(&self) -> Vec<HandoverEvent> {
        guard(&self.events).clone()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        guard(&self.events).iter().map(|e| e.event_type()).collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        guard(&self.events)
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, event: &HandoverEvent) {
        guard(&self.events).push(event.clone());
        if let Some(sink) = &self.forward {
            sink.record(event);
        }
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *guard(&self.now) = t;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = guard(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *guard(&self.now)
    }
}
