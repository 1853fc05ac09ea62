//! Attempt Tracker.
//!
//! The counter is per code, not per claimant: three guesses in total against
//! one code, whoever makes them. It lives in the persisted record and is
//! incremented by a single atomic write, so concurrent guesses cannot slip
//! past the threshold and a restart does not reset it.

use std::sync::Arc;

use tracing::warn;

use crate::error::HandoverResult;
use crate::events::code_fingerprint;
use crate::ports::CodeRepository;
use crate::types::MAX_FAILED_ATTEMPTS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub failed_attempts: i32,
    pub attempts_remaining: i32,
    /// This increment is the one that reached the threshold. Exactly one
    /// caller ever observes `true` for a given code.
    pub code_invalidated: bool,
}

impl AttemptOutcome {
    pub fn from_count(failed_attempts: i32) -> Self {
        Self {
            failed_attempts,
            attempts_remaining: (MAX_FAILED_ATTEMPTS - failed_attempts).max(0),
            code_invalidated: failed_attempts == MAX_FAILED_ATTEMPTS,
        }
    }
}

pub struct AttemptTracker {
    repo: Arc<dyn CodeRepository>,
}

impl AttemptTracker {
    pub fn new(repo: Arc<dyn CodeRepository>) -> Self {
        Self { repo }
    }

    /// Count one failed attempt against `code` made by `claimant_email`.
    ///
    /// Returns `None` if the code disappeared in the meantime (cancelled or
    /// purged); there is nothing left to protect in that case.
    pub async fn record_failure(
        &self,
        code: &str,
        claimant_email: &str,
    ) -> HandoverResult<Option<AttemptOutcome>> {
        let Some(count) = self.repo.increment_failed_attempts(code).await? else {
            return Ok(None);
        };

        let outcome = AttemptOutcome::from_count(count);
        warn!(
            code_ref = %code_fingerprint(code),
            claimant = claimant_email,
            failed_attempts = outcome.failed_attempts,
            attempts_remaining = outcome.attempts_remaining,
            code_invalidated = outcome.code_invalidated,
            "failed access code attempt recorded"
        );
        Ok(Some(outcome))
    }
}
