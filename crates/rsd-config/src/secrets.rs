//! Runtime secret resolution.
//!
//! Config stores env var NAMES only. [`resolve_secrets`] reads them once at
//! startup; the result is passed into constructors. `Debug` output redacts
//! values and errors mention names, never values.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::ConfigMode;

pub const DEFAULT_DATABASE_URL_ENV: &str = "RSD_DATABASE_URL";
pub const DEFAULT_BILLING_API_KEY_ENV: &str = "RSD_BILLING_API_KEY";

#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Env var the database URL was read from.
    pub database_url_env: String,
    pub database_url: Option<String>,
    pub billing_api_key_env: String,
    pub billing_api_key: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("database_url_env", &self.database_url_env)
            .field("database_url", &self.database_url.as_ref().map(|_| "<REDACTED>"))
            .field("billing_api_key_env", &self.billing_api_key_env)
            .field(
                "billing_api_key",
                &self.billing_api_key.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve secrets for `mode`.
///
/// | Mode    | Required                    |
/// |---------|-----------------------------|
/// | SERVICE | billing api key             |
/// | OFFLINE | nothing                     |
///
/// The database URL is always optional here; commands that need it fail
/// with the env var name when it is missing.
pub fn resolve_secrets(config_json: &Value, mode: ConfigMode) -> Result<ResolvedSecrets> {
    let database_url_env = read_str_at(config_json, "/database/url_env")
        .unwrap_or_else(|| DEFAULT_DATABASE_URL_ENV.to_string());
    let billing_api_key_env = read_str_at(config_json, "/billing/keys_env/api_key")
        .unwrap_or_else(|| DEFAULT_BILLING_API_KEY_ENV.to_string());

    let database_url = resolve_env(&database_url_env);
    let billing_api_key = resolve_env(&billing_api_key_env);

    if mode == ConfigMode::Service && billing_api_key.is_none() {
        bail!(
            "SECRETS_MISSING mode={}: required env var '{}' (billing api_key) is not set or empty",
            mode.as_str(),
            billing_api_key_env,
        );
    }

    Ok(ResolvedSecrets {
        database_url_env,
        database_url,
        billing_api_key_env,
        billing_api_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn debug_redacts_values() {
        let s = ResolvedSecrets {
            database_url_env: "RSD_DATABASE_URL".to_string(),
            database_url: Some("postgres://user:hunter2@db/rsd".to_string()),
            billing_api_key_env: "RSD_BILLING_API_KEY".to_string(),
            billing_api_key: Some("sk_test_abcdef123456".to_string()),
        };
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("sk_test_abcdef123456"));
        assert!(dbg.contains("<REDACTED>"));
        assert!(dbg.contains("RSD_BILLING_API_KEY"));
    }

    #[test]
    fn service_mode_names_the_missing_variable() {
        let cfg = json!({"billing": {"keys_env": {"api_key": "RSD_TEST_BILLING_KEY_THAT_IS_NEVER_SET"}}});
        let err = resolve_secrets(&cfg, ConfigMode::Service)
            .unwrap_err()
            .to_string();
        assert!(err.contains("RSD_TEST_BILLING_KEY_THAT_IS_NEVER_SET"), "{err}");

        let offline = resolve_secrets(&cfg, ConfigMode::Offline).unwrap();
        assert!(offline.billing_api_key.is_none());
    }
}
