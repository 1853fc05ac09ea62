//! Ownership Transfer Engine.
//!
//! Re-points every category of the ownership set from one account to
//! another, in the fixed order of [`OwnershipCategory::ALL`]. There is no
//! cross-category transaction: each category checks the current owner before
//! writing, so a failed run can simply be re-run until it completes and a
//! completed run re-runs as a no-op.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{HandoverError, HandoverResult, PartialTransfer};
use crate::ports::OwnershipStore;
use crate::types::{AccountId, OwnershipCategory};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStep {
    pub category: OwnershipCategory,
    pub rows_moved: u64,
    /// Nothing was left under the old owner; no write issued.
    pub already_complete: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub steps: Vec<CategoryStep>,
}

impl TransferReport {
    pub fn rows_moved(&self) -> u64 {
        self.steps.iter().map(|s| s.rows_moved).sum()
    }

    /// True when the run found nothing left to move.
    pub fn was_noop(&self) -> bool {
        self.steps.iter().all(|s| s.already_complete)
    }
}

pub struct OwnershipTransferEngine {
    store: Arc<dyn OwnershipStore>,
}

impl OwnershipTransferEngine {
    pub fn new(store: Arc<dyn OwnershipStore>) -> Self {
        Self { store }
    }

    pub async fn transfer(&self, from: AccountId, to: AccountId) -> HandoverResult<TransferReport> {
        if from == to {
            return Err(HandoverError::InvalidRequest(
                "ownership transfer source and target are the same account".to_string(),
            ));
        }

        let mut report = TransferReport::default();
        for category in OwnershipCategory::ALL {
            match self.transfer_category(category, from, to).await {
                Ok(step) => report.steps.push(step),
                Err(e) => {
                    let completed: Vec<_> = report.steps.iter().map(|s| s.category).collect();
                    error!(
                        %from, %to, %category,
                        completed = completed.len(),
                        error = %format!("{e:#}"),
                        "ownership transfer stopped at category"
                    );
                    return Err(HandoverError::PartialTransferFailure(PartialTransfer {
                        completed,
                        failed: category,
                        cause: format!("{e:#}"),
                    }));
                }
            }
        }

        info!(%from, %to, rows_moved = report.rows_moved(), "ownership transfer complete");
        Ok(report)
    }

    async fn transfer_category(
        &self,
        category: OwnershipCategory,
        from: AccountId,
        to: AccountId,
    ) -> anyhow::Result<CategoryStep> {
        let pending = self.store.count_owned(category, from).await?;
        if pending == 0 {
            debug!(%category, "category already re-pointed; skipping");
            return Ok(CategoryStep {
                category,
                rows_moved: 0,
                already_complete: true,
            });
        }

        let rows_moved = self.store.repoint(category, from, to).await?;
        debug!(%category, rows_moved, "category re-pointed");
        Ok(CategoryStep {
            category,
            rows_moved,
            already_complete: false,
        })
    }
}
