//! Code Store: issuing, looking up and cancelling access codes.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::error::{HandoverError, HandoverResult, RejectReason};
use crate::events::code_fingerprint;
use crate::ports::{Clock, CodeRepository};
use crate::types::{AccessCode, AccountId, ActionType, ResidenceId, TransferPhase};

/// Code alphabet: uppercase letters and digits minus the look-alikes
/// 0/O and 1/I.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const MAX_ISSUE_COLLISIONS: usize = 5;

/// Outcome of [`CodeStore::issue`].
#[derive(Clone, Debug)]
pub struct IssuedCode {
    pub code: AccessCode,
    /// Outstanding codes for the same owner/residence/action that this issue
    /// replaced.
    pub superseded: u64,
}

pub struct CodeStore {
    repo: Arc<dyn CodeRepository>,
    clock: Arc<dyn Clock>,
    code_length: usize,
}

impl CodeStore {
    pub fn new(repo: Arc<dyn CodeRepository>, clock: Arc<dyn Clock>, code_length: usize) -> Self {
        Self {
            repo,
            clock,
            code_length,
        }
    }

    /// Create a fresh code. Prior outstanding codes for the same
    /// (owner, residence, action) are superseded.
    pub async fn issue(
        &self,
        original_owner_id: AccountId,
        replacement_email: &str,
        residence_id: ResidenceId,
        action_type: ActionType,
        ttl: Duration,
    ) -> HandoverResult<IssuedCode> {
        let replacement_email = normalize_email(replacement_email).ok_or_else(|| {
            HandoverError::InvalidRequest(format!(
                "replacement email is not a valid address: {:?}",
                replacement_email
            ))
        })?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| HandoverError::InvalidRequest("code ttl out of range".to_string()))?;
        if ttl <= chrono::Duration::zero() {
            return Err(HandoverError::InvalidRequest("code ttl must be > 0".to_string()));
        }
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| HandoverError::InvalidRequest("code ttl out of range".to_string()))?;

        let superseded = self
            .repo
            .supersede_outstanding(original_owner_id, residence_id, action_type)
            .await?;

        for _ in 0..MAX_ISSUE_COLLISIONS {
            let record = AccessCode {
                code: generate_code(self.code_length),
                original_owner_id,
                replacement_email: replacement_email.clone(),
                action_type,
                residence_id,
                failed_attempts: 0,
                used: false,
                phase: TransferPhase::Issued,
                claimed_by_account_id: None,
                used_by_account_id: None,
                created_at: now,
                expires_at,
                used_at: None,
            };

            if self.repo.insert_code(&record).await? {
                info!(
                    code_ref = %code_fingerprint(&record.code),
                    owner = %original_owner_id,
                    residence = %residence_id,
                    action = action_type.as_str(),
                    superseded,
                    "access code issued"
                );
                return Ok(IssuedCode {
                    code: record,
                    superseded,
                });
            }
            debug!("generated access code collided; regenerating");
        }

        Err(HandoverError::Store(anyhow::anyhow!(
            "could not generate a unique access code after {} attempts",
            MAX_ISSUE_COLLISIONS
        )))
    }

    pub async fn find(&self, code: &str) -> HandoverResult<AccessCode> {
        self.repo
            .fetch_code(code)
            .await?
            .ok_or_else(|| HandoverError::rejected(RejectReason::NotFound, 0))
    }

    /// Owner-initiated abort. Only possible while the code is unused and no
    /// data transfer has begun.
    pub async fn cancel(&self, code: &str, requester_id: AccountId) -> HandoverResult<AccessCode> {
        let record = self.find(code).await?;

        // Ownership first: a non-owner learns nothing about the code's state.
        if record.original_owner_id != requester_id {
            return Err(HandoverError::Forbidden);
        }
        if record.used || !record.phase.is_cancellable() {
            return Err(HandoverError::rejected(
                RejectReason::AlreadyUsed,
                record.attempts_remaining(),
            ));
        }

        if self.repo.delete_cancellable_code(code, requester_id).await? {
            info!(code_ref = %code_fingerprint(code), owner = %requester_id, "access code cancelled");
            return Ok(record);
        }

        // Lost a race against a completion or another cancel.
        match self.repo.fetch_code(code).await? {
            None => Err(HandoverError::rejected(RejectReason::NotFound, 0)),
            Some(current) => Err(HandoverError::rejected(
                RejectReason::AlreadyUsed,
                current.attempts_remaining(),
            )),
        }
    }

    pub async fn list_for_owner(&self, owner: AccountId) -> HandoverResult<Vec<AccessCode>> {
        Ok(self.repo.list_codes_for_owner(owner).await?)
    }

    pub async fn purge_expired(&self) -> HandoverResult<u64> {
        Ok(self.repo.purge_expired(self.clock.now()).await?)
    }
}

/// Draw a code from [`CODE_ALPHABET`].
pub fn generate_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Trimmed, lowercased address, or `None` when it cannot be an email.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || email.chars().any(char::is_whitespace)
    {
        return None;
    }
    Some(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_use_unambiguous_alphabet() {
        for _ in 0..200 {
            let c = generate_code(8);
            assert_eq!(c.len(), 8);
            assert!(c.bytes().all(|b| CODE_ALPHABET.contains(&b)), "bad char in {c}");
            assert!(!c.contains('0') && !c.contains('O') && !c.contains('1') && !c.contains('I'));
        }
    }

    #[test]
    fn normalize_email_accepts_and_rejects() {
        assert_eq!(
            normalize_email("  Replacement@Example.COM "),
            Some("replacement@example.com".to_string())
        );
        assert_eq!(normalize_email("no-at-sign.example.com"), None);
        assert_eq!(normalize_email("@example.com"), None);
        assert_eq!(normalize_email("a@b@example.com"), None);
        assert_eq!(normalize_email("a@localhost"), None);
        assert_eq!(normalize_email("a b@example.com"), None);
    }
}
