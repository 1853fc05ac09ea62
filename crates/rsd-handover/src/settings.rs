//! Tunables for the handover protocol. Loaded by `rsd-config`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverSettings {
    /// Lifetime of a freshly issued code.
    pub code_ttl: Duration,
    /// Characters per generated code.
    pub code_length: usize,
    /// Upper bound for each external call (gateway, account deletion).
    pub external_call_timeout: Duration,
    /// How long one completion call holds a code's transfer steps before
    /// another call may take over. Must outlast the external calls.
    pub transfer_lease: Duration,
}

impl HandoverSettings {
    pub const MIN_CODE_LENGTH: usize = 6;
    pub const MAX_CODE_LENGTH: usize = 32;
    /// Longest lifetime a code may be issued with (30 days).
    pub const MAX_CODE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.code_ttl.is_zero() {
            anyhow::bail!("handover.code_ttl must be > 0");
        }
        if self.code_ttl > Self::MAX_CODE_TTL {
            anyhow::bail!(
                "handover.code_ttl must be at most {}h (got {}h)",
                Self::MAX_CODE_TTL.as_secs() / 3600,
                self.code_ttl.as_secs() / 3600
            );
        }
        if !(Self::MIN_CODE_LENGTH..=Self::MAX_CODE_LENGTH).contains(&self.code_length) {
            anyhow::bail!(
                "handover.code_length must be within {}..={} (got {})",
                Self::MIN_CODE_LENGTH,
                Self::MAX_CODE_LENGTH,
                self.code_length
            );
        }
        if self.external_call_timeout.is_zero() {
            anyhow::bail!("handover.external_call_timeout must be > 0");
        }
        if self.transfer_lease <= self.external_call_timeout {
            anyhow::bail!(
                "handover.transfer_lease ({}ms) must exceed external_call_timeout ({}ms)",
                self.transfer_lease.as_millis(),
                self.external_call_timeout.as_millis()
            );
        }
        Ok(())
    }
}

impl Default for HandoverSettings {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(72 * 3600),
            code_length: 8,
            external_call_timeout: Duration::from_secs(10),
            transfer_lease: Duration::from_secs(300),
        }
    }
}
