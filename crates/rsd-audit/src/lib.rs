//! Append-only, hash-chained JSONL audit log for handover events.
//!
//! Each line is one [`AuditEvent`] serialized as canonical JSON (keys sorted
//! recursively). With chaining on, `hash_prev` links to the previous line's
//! `hash_self`, so any edit, deletion or reordering breaks the chain at the
//! first affected line.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use rsd_handover::events::HandoverEvent;
use rsd_handover::ports::AuditSink;

/// Namespace for deterministic event ids.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5d1c_7a8e_3f04_4b2a_9c61_0e8f_d2b7_a413);

pub struct AuditWriter {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    /// Number of events already in the log; the next event's sequence.
    seq: u64,
}

impl AuditWriter {
    /// Creates the audit writer and ensures parent dirs exist.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        Ok(Self {
            path,
            hash_chain,
            last_hash: None,
            seq: 0,
        })
    }

    /// Open an existing log (or a new one) and continue its chain.
    pub fn resume(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let mut writer = Self::new(path, hash_chain)?;
        if writer.path.exists() {
            let events = read_events(&writer.path)?;
            writer.seq = events.len() as u64;
            writer.last_hash = events.last().and_then(|e| e.hash_self.clone());
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Append one event.
    pub fn append(&mut self, stream_id: Uuid, event_type: &str, payload: Value) -> Result<AuditEvent> {
        let event_id = derive_event_id(self.last_hash.as_deref(), &payload, self.seq)?;

        let mut ev = AuditEvent {
            event_id,
            stream_id,
            seq: self.seq,
            ts_utc: Utc::now(),
            event_type: event_type.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            ev.hash_prev = self.last_hash.clone();
            ev.hash_self = Some(compute_event_hash(&ev)?);
        }

        let line = canonical_json_line(&ev)?;
        append_line(&self.path, &line)?;

        self.seq += 1;
        if self.hash_chain {
            self.last_hash = ev.hash_self.clone();
        }
        Ok(ev)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    /// Identifies one writer process/session.
    pub stream_id: Uuid,
    pub seq: u64,
    pub ts_utc: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Event id as a v5 UUID over (previous hash, canonical payload, seq). Same
/// chain position and payload always give the same id.
pub fn derive_event_id(prev_hash: Option<&str>, payload: &Value, seq: u64) -> Result<Uuid> {
    let canonical = serde_json::to_string(&sort_keys(payload)).context("serialize payload")?;
    let name = format!("{}|{}|{}", prev_hash.unwrap_or("GENESIS"), seq, canonical);
    Ok(Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes()))
}

/// Write a single line to file (with trailing newline).
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {:?}", path))?;
    f.write_all(line.as_bytes())
        .context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit event failed")?;
    serde_json::to_string(&sort_keys(&raw)).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash of the canonical event with `hash_self` cleared.
pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut clone = ev.clone();
    clone.hash_self = None;

    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l.trim())
                .with_context(|| format!("parse audit event at line {}", i + 1))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

/// Same as [`verify_hash_chain`] over in-memory JSONL.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let ev: AuditEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("parse audit event at line {}", i + 1))?;

        if ev.seq != line_count as u64 {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!("seq mismatch: expected {}, got {}", line_count, ev.seq),
            });
        }
        line_count += 1;

        if ev.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, ev.hash_prev
                ),
            });
        }

        if let Some(ref claimed_hash) = ev.hash_self {
            let recomputed = compute_event_hash(&ev)?;
            if *claimed_hash != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!(
                        "hash_self mismatch: claimed {}, recomputed {}",
                        claimed_hash, recomputed
                    ),
                });
            }
        }

        prev_hash = ev.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

// ---------------------------------------------------------------------------
// AuditSink
// ---------------------------------------------------------------------------

/// [`AuditSink`] that appends every handover event to a JSONL log.
///
/// Write failures are logged and dropped; auditing never changes a protocol
/// outcome.
pub struct JsonlAuditSink {
    stream_id: Uuid,
    writer: Mutex<AuditWriter>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            stream_id: Uuid::new_v4(),
            writer: Mutex::new(AuditWriter::resume(path, true)?),
        })
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    fn try_record(&self, event: &HandoverEvent) -> Result<()> {
        let payload = serde_json::to_value(event).context("serialize handover event")?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("audit writer mutex poisoned"))?;
        writer.append(self.stream_id, event.event_type(), payload)?;
        Ok(())
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: &HandoverEvent) {
        if let Err(e) = self.try_record(event) {
            warn!(event_type = event.event_type(), error = %format!("{e:#}"), "audit append failed");
        }
    }
}
