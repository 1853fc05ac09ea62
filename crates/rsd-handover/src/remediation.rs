//! Destructive remediation on attempt exhaustion.
//!
//! When a code's third failed attempt lands, the account behind the
//! *claimant* email that made it is deleted with cascade. The code's issuer
//! is never the target. The outcome is advisory: it is reported alongside the
//! rejection and never replaces it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::events::code_fingerprint;
use crate::ports::AccountDirectory;
use crate::types::{AccessCode, AccountId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemediationOutcome {
    AccountDeleted { account: AccountId },
    NoAccount,
    /// The email belongs to the code's issuer; left untouched.
    SkippedCodeOwner { account: AccountId },
    DeletionFailed {
        account: Option<AccountId>,
        error: String,
    },
}

impl RemediationOutcome {
    pub fn account_deleted(&self) -> bool {
        matches!(self, RemediationOutcome::AccountDeleted { .. })
    }
}

pub struct Remediator {
    accounts: Arc<dyn AccountDirectory>,
    timeout: Duration,
}

impl Remediator {
    pub fn new(accounts: Arc<dyn AccountDirectory>, timeout: Duration) -> Self {
        Self { accounts, timeout }
    }

    /// Delete the account bound to `claimant_email`, best effort.
    pub async fn remediate(&self, code: &AccessCode, claimant_email: &str) -> RemediationOutcome {
        let code_ref = code_fingerprint(&code.code);

        let lookup = tokio::time::timeout(self.timeout, self.accounts.find_by_email(claimant_email));
        let account = match lookup.await {
            Ok(Ok(Some(account))) => account,
            Ok(Ok(None)) => {
                info!(code_ref = %code_ref, claimant = claimant_email, "remediation: no account for claimant email");
                return RemediationOutcome::NoAccount;
            }
            Ok(Err(e)) => {
                error!(code_ref = %code_ref, claimant = claimant_email, error = %format!("{e:#}"), "remediation: account lookup failed");
                return RemediationOutcome::DeletionFailed {
                    account: None,
                    error: format!("{e:#}"),
                };
            }
            Err(_) => {
                error!(code_ref = %code_ref, claimant = claimant_email, "remediation: account lookup timed out");
                return RemediationOutcome::DeletionFailed {
                    account: None,
                    error: "account lookup timed out".to_string(),
                };
            }
        };

        if account.id == code.original_owner_id {
            warn!(code_ref = %code_ref, account = %account.id, "remediation: claimant is the code issuer; not deleting");
            return RemediationOutcome::SkippedCodeOwner { account: account.id };
        }

        let delete =
            tokio::time::timeout(self.timeout, self.accounts.delete_account_cascade(account.id));
        match delete.await {
            Ok(Ok(())) => {
                warn!(code_ref = %code_ref, account = %account.id, "remediation: claimant account deleted after attempt exhaustion");
                RemediationOutcome::AccountDeleted { account: account.id }
            }
            Ok(Err(e)) => {
                error!(code_ref = %code_ref, account = %account.id, error = %format!("{e:#}"), "remediation: account deletion failed");
                RemediationOutcome::DeletionFailed {
                    account: Some(account.id),
                    error: format!("{e:#}"),
                }
            }
            Err(_) => {
                error!(code_ref = %code_ref, account = %account.id, "remediation: account deletion timed out");
                RemediationOutcome::DeletionFailed {
                    account: Some(account.id),
                    error: "account deletion timed out".to_string(),
                }
            }
        }
    }
}
