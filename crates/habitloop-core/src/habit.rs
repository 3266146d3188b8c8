//! Habit domain types: the habit itself, its measurement slot definitions,
//! and the dependency logic that can derive a parent habit's completion
//! from child habits.
//!
//! Validation happens once, at construction: a [`HabitDraft`] either builds
//! into a fully well-formed [`Habit`] or is rejected. Downstream code
//! matches on [`DependencyLogic`] variants instead of re-checking shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::recurrence::{RecurrenceSpec, FREQUENCIES};

pub type HabitId = Uuid;
pub type AccountId = Uuid;
pub type DeltaId = Uuid;

/// Value kind of a delta measurement slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Number,
    String,
    Time,
}

/// The closed set of accepted delta kinds.
pub const DELTA_KINDS: [DeltaKind; 3] = [DeltaKind::Number, DeltaKind::String, DeltaKind::Time];

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Number => "number",
            DeltaKind::String => "string",
            DeltaKind::Time => "time",
        }
    }
}

/// A typed measurement slot declared on a habit.
///
/// A disabled definition stops appearing in UIs but stays referenceable:
/// existing check-ins may still carry values for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaDefinition {
    pub id: DeltaId,
    pub name: String,
    pub description: Option<String>,
    pub kind: DeltaKind,
    pub enabled: bool,
}

/// Boolean operator for dependency logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    And,
    Or,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::And => "and",
            Operator::Or => "or",
        }
    }
}

/// How a habit's completion derives from other habits.
///
/// `Disabled` habits are purely self-reported. `Enabled` habits compose the
/// completion state of the operand habits with the given operator; operand
/// duplicates are permitted but redundant, and the list may be empty (an
/// empty `and` is vacuously satisfied, an empty `or` never is).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DependencyLogic {
    Disabled,
    Enabled {
        operator: Operator,
        operands: Vec<HabitId>,
    },
}

impl DependencyLogic {
    pub fn is_enabled(&self) -> bool {
        matches!(self, DependencyLogic::Enabled { .. })
    }

    fn disabled() -> Self {
        DependencyLogic::Disabled
    }

    /// Operand ids with duplicates removed, in first-seen order.
    pub fn distinct_operands(&self) -> Vec<HabitId> {
        match self {
            DependencyLogic::Disabled => Vec::new(),
            DependencyLogic::Enabled { operands, .. } => {
                let mut seen = Vec::with_capacity(operands.len());
                for id in operands {
                    if !seen.contains(id) {
                        seen.push(*id);
                    }
                }
                seen
            }
        }
    }
}

/// A recurring habit owned by one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Habit {
    pub id: HabitId,
    pub account_id: AccountId,
    pub name: String,
    pub description: Option<String>,
    pub recurrence: RecurrenceSpec,
    pub dependency: DependencyLogic,
    pub deltas: Vec<DeltaDefinition>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Habit {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Find a delta definition by id, enabled or not.
    pub fn delta_definition(&self, id: DeltaId) -> Option<&DeltaDefinition> {
        self.deltas.iter().find(|d| d.id == id)
    }
}

/// Whole-object re-check of a recurrence spec that arrived as structured
/// data rather than as a rule string. Redundant with the grammar for
/// parsed specs, intentional for deserialized ones.
pub fn validate_recurrence(spec: &RecurrenceSpec) -> Result<(), ValidationError> {
    if !FREQUENCIES.contains(&spec.frequency) {
        return Err(ValidationError::Missing("frequency"));
    }
    Ok(())
}

/// Delta definition as submitted at habit creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaDraft {
    pub name: String,
    pub description: Option<String>,
    pub kind: DeltaKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Habit as submitted by a caller, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HabitDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Raw recurrence rule string, e.g. `FREQ=DAILY;UNTIL=20250327T000000Z`.
    pub rule: String,
    #[serde(default = "DependencyLogic::disabled")]
    pub dependency: DependencyLogic,
    #[serde(default)]
    pub deltas: Vec<DeltaDraft>,
}

impl HabitDraft {
    /// Validate the draft and build a habit.
    ///
    /// Cross-habit checks (operands existing and belonging to the same
    /// account) need a repository lookup and are performed by the store
    /// that persists the habit.
    pub fn build(self, account_id: AccountId, now: DateTime<Utc>) -> Result<Habit> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Missing("name").into());
        }
        if self.rule.trim().is_empty() {
            return Err(ValidationError::Missing("recurrence rule").into());
        }
        let recurrence = RecurrenceSpec::parse(&self.rule)?;
        validate_recurrence(&recurrence)?;

        let mut deltas = Vec::with_capacity(self.deltas.len());
        for draft in self.deltas {
            if draft.name.trim().is_empty() {
                return Err(ValidationError::Missing("delta name").into());
            }
            deltas.push(DeltaDefinition {
                id: Uuid::new_v4(),
                name: draft.name,
                description: draft.description,
                kind: draft.kind,
                enabled: draft.enabled,
            });
        }

        Ok(Habit {
            id: Uuid::new_v4(),
            account_id,
            name: self.name,
            description: self.description,
            recurrence,
            dependency: self.dependency,
            deltas,
            created_at: now,
            deleted_at: None,
        })
    }
}
