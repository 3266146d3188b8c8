//! Check-in records: one attempted completion event per habit per
//! calendar day, plus the typed delta values attached to it.
//!
//! Record lifecycle:
//!
//!   absent ──> active(checked=false) <──> active(checked=true)
//!                      │                          │
//!                      └────────> soft-deleted <──┘   (terminal)
//!
//! A soft-deleted record is excluded from every lookup, including
//! dependency resolution, but is retained for the audit trail.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::habit::{AccountId, DeltaId, DeltaKind, HabitId};

pub type CheckinId = Uuid;

/// A value for one of the habit's delta definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DeltaPayload {
    Number(f64),
    String(String),
    Time(NaiveTime),
}

impl DeltaPayload {
    pub fn kind(&self) -> DeltaKind {
        match self {
            DeltaPayload::Number(_) => DeltaKind::Number,
            DeltaPayload::String(_) => DeltaKind::String,
            DeltaPayload::Time(_) => DeltaKind::Time,
        }
    }
}

/// A stored delta value on a check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaValue {
    pub habit_delta_id: DeltaId,
    pub value: DeltaPayload,
}

/// One completion event for one habit on one calendar day.
///
/// At most one non-deleted record exists per `(habit_id, date)`; the
/// storage layer enforces this with a uniqueness constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinRecord {
    pub id: CheckinId,
    pub habit_id: HabitId,
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub checked: bool,
    /// Set iff `checked` is true.
    pub completed_at: Option<DateTime<Utc>>,
    pub deltas: Vec<DeltaValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CheckinRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn delta(&self, id: DeltaId) -> Option<&DeltaValue> {
        self.deltas.iter().find(|d| d.habit_delta_id == id)
    }
}

/// One entry of a delta upsert list: create or replace the value for
/// `habit_delta_id`, or remove it when `destroy` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaUpsert {
    pub habit_delta_id: DeltaId,
    #[serde(default)]
    pub value: Option<DeltaPayload>,
    #[serde(default)]
    pub destroy: bool,
}

impl DeltaUpsert {
    pub fn set(id: DeltaId, value: DeltaPayload) -> Self {
        Self {
            habit_delta_id: id,
            value: Some(value),
            destroy: false,
        }
    }

    pub fn remove(id: DeltaId) -> Self {
        Self {
            habit_delta_id: id,
            value: None,
            destroy: true,
        }
    }
}

/// Mutation applied to an existing check-in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckinPatch {
    #[serde(default)]
    pub checked: Option<bool>,
    #[serde(default)]
    pub deltas: Vec<DeltaUpsert>,
}
