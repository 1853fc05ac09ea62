//! `rsd code …` handlers. Output is `key=value` lines on stdout.

use anyhow::Result;

use rsd_handover::{code_fingerprint, AccessCode, ActionType, ResidenceId};

use super::Wiring;

fn print_code(c: &AccessCode) {
    println!(
        "code={} ref={} action={} residence={} phase={} used={} attempts={} expires_at={}",
        c.code,
        code_fingerprint(&c.code),
        c.action_type.as_str(),
        c.residence_id,
        c.phase.as_str(),
        c.used,
        c.failed_attempts,
        c.expires_at.to_rfc3339()
    );
}

pub async fn issue(
    w: &Wiring,
    owner_email: &str,
    replacement_email: &str,
    residence: i64,
    action: &str,
) -> Result<()> {
    let owner = w.account(owner_email).await?;
    let action = ActionType::parse(action.trim().to_ascii_uppercase().as_str())?;
    let issued = w
        .coordinator
        .issue_code(owner.id, replacement_email, ResidenceId(residence), action)
        .await?;

    print_code(&issued.code);
    println!("superseded={}", issued.superseded);
    Ok(())
}

pub async fn cancel(w: &Wiring, owner_email: &str, code: &str) -> Result<()> {
    let owner = w.account(owner_email).await?;
    w.coordinator.cancel_code(code, owner.id).await?;
    println!("cancelled=true ref={}", code_fingerprint(code));
    Ok(())
}

pub async fn list(w: &Wiring, owner_email: &str) -> Result<()> {
    let owner = w.account(owner_email).await?;
    let codes = w.coordinator.list_codes(owner.id).await?;
    println!("count={}", codes.len());
    for c in &codes {
        print_code(c);
    }
    Ok(())
}

pub async fn status(w: &Wiring, code: &str) -> Result<()> {
    let s = w.coordinator.check_code_status(code).await?;
    println!(
        "exists={} used={} expired={} attempts_remaining={} phase={}",
        s.exists,
        s.used,
        s.expired,
        s.attempts_remaining,
        s.phase.map(|p| p.as_str()).unwrap_or("")
    );
    Ok(())
}

pub async fn finalize(w: &Wiring, owner_email: &str, code: &str) -> Result<()> {
    let owner = w.account(owner_email).await?;
    let report = w.coordinator.finalize_transfer(code, owner.id).await?;
    println!("finalized=true");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn purge_expired(w: &Wiring) -> Result<()> {
    let n = w.coordinator.purge_expired().await?;
    println!("purged={}", n);
    Ok(())
}
