//! Audit trail for flows marked `audited`.
//!
//! An entry holds the state before the flow, the state after, and the record
//! changes it produced. Secrets are redacted before the entry leaves the
//! engine; the digest is computed over the redacted content.

use crate::store::RecordChange;
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use weft::{RuntimeError, Value, ValueMap};

pub const REDACTED: &str = "[REDACTED]";

static SENSITIVE_KEY_PARTS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["secret", "token", "password", "key", "credential", "authorization"]);

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit entry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<AuditError> for RuntimeError {
    fn from(err: AuditError) -> Self {
        RuntimeError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub flow_name: String,
    pub action_name: Option<String>,
    pub actor: String,
    pub before: Value,
    pub after: Value,
    pub record_changes: Vec<RecordChange>,
    pub timestamp: String,
}

impl AuditEntry {
    pub fn new(
        flow_name: &str,
        action_name: Option<String>,
        actor: String,
        before: Value,
        after: Value,
        record_changes: Vec<RecordChange>,
    ) -> Self {
        Self {
            flow_name: flow_name.to_string(),
            action_name,
            actor,
            before,
            after,
            record_changes,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Apply redaction to every value-carrying field.
    pub fn redacted(mut self, secrets: &[String]) -> Self {
        self.before = redact_value(&self.before, secrets);
        self.after = redact_value(&self.after, secrets);
        for change in &mut self.record_changes {
            change.before = change.before.as_ref().map(|v| redact_value(v, secrets));
            change.after = change.after.as_ref().map(|v| redact_value(v, secrets));
        }
        self
    }

    /// SHA-256 over the entry content, timestamp excluded.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.flow_name.as_bytes());
        if let Some(action) = &self.action_name {
            hasher.update(action.as_bytes());
        }
        hasher.update(self.actor.as_bytes());
        hasher.update(self.before.to_json().to_string().as_bytes());
        hasher.update(self.after.to_json().to_string().as_bytes());
        for change in &self.record_changes {
            hasher.update(serde_json::to_string(change).unwrap_or_default().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lowered.contains(part))
}

/// Replace values under sensitive keys, and any text equal to a known secret.
pub fn redact_value(value: &Value, secrets: &[String]) -> Value {
    match value {
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| {
                    let redacted = if is_sensitive_key(k) {
                        Value::text(REDACTED)
                    } else {
                        redact_value(v, secrets)
                    };
                    (k.clone(), redacted)
                })
                .collect(),
        ),
        Value::List(items) => Value::List(items.iter().map(|v| redact_value(v, secrets)).collect()),
        Value::String(s) if secrets.iter().any(|secret| !secret.is_empty() && s.contains(secret.as_str())) => {
            let mut text = s.clone();
            for secret in secrets.iter().filter(|s| !s.is_empty()) {
                text = text.replace(secret.as_str(), REDACTED);
            }
            Value::String(text)
        }
        other => other.clone(),
    }
}

/// Actor label: identity id, then email, then name.
pub fn resolve_actor(identity: &ValueMap) -> String {
    ["id", "email", "name"]
        .iter()
        .filter_map(|key| identity.get(*key))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "anonymous".to_string())
}

pub trait AuditRecorder: fmt::Debug + Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().clone()
    }
}

impl AuditRecorder for InMemoryAuditLog {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.lock().push(entry.clone());
        Ok(())
    }
}

/// One JSON object per line, appended.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AuditError::from))
            .collect()
    }
}

impl AuditRecorder for JsonlAuditLog {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}
