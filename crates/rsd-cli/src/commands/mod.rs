//! Command handler modules for rsd-cli.
//!
//! Shared wiring (config, secrets, coordinator) lives here.
//! Command-specific logic lives in the submodules.

pub mod code;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use rsd_audit::JsonlAuditSink;
use rsd_billing::{StripeGateway, UnconfiguredGateway};
use rsd_config::{ConfigMode, LoadedConfig, UnusedKeyPolicy};
use rsd_db::PgHandoverStore;
use rsd_handover::ports::AccountDirectory;
use rsd_handover::{
    Account, AuditSink, Coordinator, HandoverDeps, NoopAudit, PaymentGateway, SystemClock,
};

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub fn load_config(paths: &[String]) -> Result<LoadedConfig> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    rsd_config::load_layered_yaml(&path_refs)
}

/// Everything a handover command needs, wired from layered config.
pub struct Wiring {
    pub store: Arc<PgHandoverStore>,
    pub coordinator: Coordinator,
}

impl Wiring {
    pub async fn from_config(config_paths: &[String], mode: ConfigMode) -> Result<Self> {
        let loaded = load_config(config_paths)?;
        let cfg = &loaded.config_json;

        let report = rsd_config::report_unused_keys(mode, cfg, UnusedKeyPolicy::Warn)?;
        if !report.is_clean() {
            warn!(mode = mode.as_str(), unused = ?report.unused_leaf_pointers, "config has unused keys");
        }

        let secrets = rsd_config::resolve_secrets(cfg, mode)?;
        let settings = rsd_config::handover_settings(cfg)?;

        let url = secrets
            .database_url
            .clone()
            .with_context(|| format!("missing env var {}", secrets.database_url_env))?;
        let pool = rsd_db::connect(&url).await?;
        let store = Arc::new(PgHandoverStore::new(pool));

        let audit: Arc<dyn AuditSink> = match rsd_config::audit_log_path(cfg)? {
            Some(path) => Arc::new(JsonlAuditSink::open(path)?),
            None => Arc::new(NoopAudit),
        };

        let billing: Arc<dyn PaymentGateway> = match (mode, secrets.billing_api_key.clone()) {
            (ConfigMode::Service, Some(key)) => match rsd_config::billing_base_url(cfg)? {
                Some(base) => Arc::new(StripeGateway::new_with_base_url(key, base)),
                None => Arc::new(StripeGateway::new(key)),
            },
            _ => Arc::new(UnconfiguredGateway),
        };

        let coordinator = Coordinator::new(
            HandoverDeps {
                codes: store.clone(),
                ownership: store.clone(),
                accounts: store.clone(),
                billing,
                audit,
                clock: Arc::new(SystemClock),
            },
            settings,
        );

        Ok(Self { store, coordinator })
    }

    pub async fn account(&self, email: &str) -> Result<Account> {
        self.store
            .find_by_email(email)
            .await?
            .with_context(|| format!("no account with email {}", email.trim()))
    }
}
