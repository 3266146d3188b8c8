//! Append-only audit trail for entity mutations.
//!
//! Every create/update/destroy of an audited entity appends one entry.
//! Entries are never mutated after being written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::habit::AccountId;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Created,
    Updated,
    Destroyed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Updated => "updated",
            AuditAction::Destroyed => "destroyed",
        }
    }
}

/// One audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    /// Field names touched by an update; all fields for create/destroy.
    pub changed_fields: Vec<String>,
    pub actor: Option<AccountId>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        entity_type: &str,
        entity_id: impl ToString,
        action: AuditAction,
        changed_fields: Vec<String>,
        actor: Option<AccountId>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action,
            changed_fields,
            actor,
            at,
        }
    }
}

/// Append-only sink for audit entries.
///
/// The sink is written to after the audited mutation has been persisted,
/// so a failing `append` never undoes the mutation itself.
pub trait AuditSink {
    fn append(&self, entry: &AuditEntry) -> Result<(), StorageError>;
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: std::cell::RefCell<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.borrow().clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        self.entries.borrow_mut().push(entry.clone());
        Ok(())
    }
}
