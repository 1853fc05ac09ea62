//! Scenario: unused config keys are reported per mode.
//!
//! # Invariants under test
//!
//! 1. Keys nobody reads are listed, sorted.
//! 2. Warn returns the report; Fail returns an error naming the count.
//! 3. Billing keys are consumed in SERVICE mode only.

use rsd_config::{load_layered_yaml_from_strings, report_unused_keys, ConfigMode, UnusedKeyPolicy};

const YAML: &str = r#"
handover:
  code_ttl_hours: 72
  code_lenght: 8
billing:
  base_url: "https://api.stripe.com"
audit:
  path: "var/audit/handover.jsonl"
"#;

#[test]
fn warn_reports_unused_leaves() {
    let cfg = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let report =
        report_unused_keys(ConfigMode::Service, &cfg.config_json, UnusedKeyPolicy::Warn).unwrap();
    assert_eq!(report.mode, "SERVICE");
    assert_eq!(report.unused_leaf_pointers, vec!["/handover/code_lenght".to_string()]);
    assert!(!report.is_clean());
}

#[test]
fn fail_policy_errors() {
    let cfg = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let err = report_unused_keys(ConfigMode::Offline, &cfg.config_json, UnusedKeyPolicy::Fail)
        .unwrap_err()
        .to_string();
    assert!(err.contains("CONFIG_UNUSED_KEYS (mode=OFFLINE): 2 unused"), "{err}");
    assert!(err.contains("/billing/base_url"), "{err}");
}

#[test]
fn clean_config_passes_fail_policy() {
    let yaml = "handover:\n  code_length: 10\naudit:\n  path: a.jsonl\n";
    let cfg = load_layered_yaml_from_strings(&[yaml]).unwrap();
    let report =
        report_unused_keys(ConfigMode::Offline, &cfg.config_json, UnusedKeyPolicy::Fail).unwrap();
    assert!(report.is_clean());
}
