//! Dependency graph evaluation and the check-in gate.
//!
//! [`DependencyGraph`] answers "are this habit's child dependencies
//! satisfied on a date"; [`RuleEngine`] composes that with the recurrence
//! rule into a single allow/deny decision for a check-in attempt.
//!
//! Rule failures are deny reasons the caller can retry later (e.g. after a
//! sibling habit has been checked); only storage faults are errors.

use chrono::NaiveDate;

use crate::checkin::CheckinRecord;
use crate::error::{RuleError, StorageError};
use crate::habit::{DependencyLogic, Habit, HabitId, Operator};

/// Read-only completion lookup, provided by the storage collaborator.
///
/// Implementations must never return soft-deleted records.
pub trait CompletionLookup {
    fn completion_on(
        &self,
        habit_id: HabitId,
        date: NaiveDate,
    ) -> Result<Option<CheckinRecord>, StorageError>;
}

/// Outcome of evaluating dependency logic for a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Satisfied,
    Unsatisfied(RuleError),
}

impl RuleOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, RuleOutcome::Satisfied)
    }
}

/// Resolves a habit's dependency logic against recorded completions.
pub struct DependencyGraph<'a, L: CompletionLookup> {
    lookup: &'a L,
}

impl<'a, L: CompletionLookup> DependencyGraph<'a, L> {
    pub fn new(lookup: &'a L) -> Self {
        Self { lookup }
    }

    /// Evaluate `logic` for `date`.
    ///
    /// Presence is tested before truth: every distinct operand must have a
    /// check-in on the date at all, otherwise the outcome is
    /// [`RuleError::MissingDependencies`] regardless of operator.
    ///
    /// With zero operands, `and` is vacuously satisfied while `or` is
    /// never satisfied; "every" over an empty set is true, "at least one"
    /// is false.
    pub fn evaluate(
        &self,
        logic: &DependencyLogic,
        date: NaiveDate,
    ) -> Result<RuleOutcome, StorageError> {
        let (operator, operands) = match logic {
            DependencyLogic::Disabled => return Ok(RuleOutcome::Satisfied),
            DependencyLogic::Enabled { operator, .. } => (*operator, logic.distinct_operands()),
        };

        let mut resolved = Vec::with_capacity(operands.len());
        for id in &operands {
            if let Some(record) = self.lookup.completion_on(*id, date)? {
                resolved.push(record);
            }
        }

        if resolved.len() != operands.len() {
            return Ok(RuleOutcome::Unsatisfied(RuleError::MissingDependencies {
                expected: operands.len(),
                found: resolved.len(),
            }));
        }

        let outcome = match operator {
            Operator::And => {
                if resolved.iter().all(|r| r.checked) {
                    RuleOutcome::Satisfied
                } else {
                    RuleOutcome::Unsatisfied(RuleError::NotAllChecked)
                }
            }
            Operator::Or => {
                if resolved.iter().any(|r| r.checked) {
                    RuleOutcome::Satisfied
                } else {
                    RuleOutcome::Unsatisfied(RuleError::NoneChecked)
                }
            }
        };
        Ok(outcome)
    }
}

/// Why a check-in attempt was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The recurrence rule does not permit this date
    NotScheduled { date: NaiveDate },
    /// Dependency logic is enabled and not satisfied
    Rule(RuleError),
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::NotScheduled { date } => {
                write!(f, "habit is not scheduled on {date}")
            }
            DenyReason::Rule(err) => err.fmt(f),
        }
    }
}

/// Allow/deny decision for a check-in attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Allowed,
    Denied(DenyReason),
}

impl Gate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Gate::Allowed)
    }
}

/// Composes the recurrence rule with dependency evaluation.
pub struct RuleEngine<'a, L: CompletionLookup> {
    lookup: &'a L,
}

impl<'a, L: CompletionLookup> RuleEngine<'a, L> {
    pub fn new(lookup: &'a L) -> Self {
        Self { lookup }
    }

    /// May a check-in be recorded for `habit` on `date`?
    ///
    /// The recurrence rule is consulted first; dependency logic only runs
    /// for dates the rule permits.
    pub fn can_check_in(&self, habit: &Habit, date: NaiveDate) -> Result<Gate, StorageError> {
        if !habit.recurrence.is_occurrence_on(date) {
            return Ok(Gate::Denied(DenyReason::NotScheduled { date }));
        }
        match DependencyGraph::new(self.lookup).evaluate(&habit.dependency, date)? {
            RuleOutcome::Satisfied => Ok(Gate::Allowed),
            RuleOutcome::Unsatisfied(err) => Ok(Gate::Denied(DenyReason::Rule(err))),
        }
    }
}
