//! Typed readers over the merged config JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;

use rsd_handover::{HandoverSettings, MAX_FAILED_ATTEMPTS};

fn read_u64(config: &Value, pointer: &str) -> Result<Option<u64>> {
    match config.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(n) => Ok(Some(n)),
            None => bail!("CONFIG_INVALID {}: expected a non-negative integer, got {}", pointer, v),
        },
    }
}

fn read_string(config: &Value, pointer: &str) -> Result<Option<String>> {
    match config.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(v) => bail!("CONFIG_INVALID {}: expected a string, got {}", pointer, v),
    }
}

/// Build [`HandoverSettings`] from the `handover` section, defaulting absent
/// keys. `max_failed_attempts` may be stated but never changed.
pub fn handover_settings(config: &Value) -> Result<HandoverSettings> {
    let defaults = HandoverSettings::default();

    if let Some(n) = read_u64(config, "/handover/max_failed_attempts")? {
        if n != MAX_FAILED_ATTEMPTS as u64 {
            bail!(
                "CONFIG_INVALID /handover/max_failed_attempts: fixed at {}, got {}",
                MAX_FAILED_ATTEMPTS,
                n
            );
        }
    }

    let code_ttl = match read_u64(config, "/handover/code_ttl_hours")? {
        Some(h) => Duration::from_secs(h.saturating_mul(3600)),
        None => defaults.code_ttl,
    };
    let code_length = match read_u64(config, "/handover/code_length")? {
        Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
        None => defaults.code_length,
    };
    let external_call_timeout = match read_u64(config, "/handover/external_call_timeout_ms")? {
        Some(ms) => Duration::from_millis(ms),
        None => defaults.external_call_timeout,
    };
    let transfer_lease = match read_u64(config, "/handover/transfer_lease_secs")? {
        Some(secs) => Duration::from_secs(secs),
        None => defaults.transfer_lease,
    };

    let settings = HandoverSettings {
        code_ttl,
        code_length,
        external_call_timeout,
        transfer_lease,
    };
    settings.validate()?;
    Ok(settings)
}

pub fn billing_base_url(config: &Value) -> Result<Option<String>> {
    read_string(config, "/billing/base_url")
}

pub fn audit_log_path(config: &Value) -> Result<Option<PathBuf>> {
    Ok(read_string(config, "/audit/path")?.map(PathBuf::from))
}
