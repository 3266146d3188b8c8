//! Core error types for habitloop-core.
//!
//! This module defines the error hierarchy using thiserror. Rule failures
//! and conflicts are ordinary deny conditions surfaced to the caller;
//! storage failures pass through unmodified.

use chrono::NaiveDate;
use thiserror::Error;

use crate::checkin::CheckinId;
use crate::habit::{DeltaId, HabitId};

/// Core error type for habitloop-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed recurrence grammar or unparseable date input
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Occurrence assertion failed
    #[error("Recurrence error: {0}")]
    Recurrence(#[from] RecurrenceError),

    /// Dependency logic not satisfied
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Duplicate check-in for the same calendar day
    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// Invalid habit or check-in data
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage failure from the persistence collaborator
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from parsing a recurrence rule string or a date argument.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The rule string does not match the RRULE-subset grammar
    #[error("Invalid recurrence rule: {0:?}")]
    MalformedGrammar(String),

    /// A date/time argument could not be parsed
    #[error("Invalid date: {0:?}")]
    InvalidDate(String),
}

/// Occurrence check failures, for callers that want assertion-style flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecurrenceError {
    /// The date is not a valid occurrence of the rule
    #[error("Date {date} is not in range for the recurrence rule")]
    OutOfRange { date: NaiveDate },
}

/// Dependency rule evaluation failures.
///
/// These are deny reasons, not system faults: the caller may retry later,
/// e.g. after the missing sibling check-ins have been recorded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// Not every referenced child habit has a check-in on this date
    #[error("Not all dependency check-ins are present ({found} of {expected})")]
    MissingDependencies { expected: usize, found: usize },

    /// AND logic: at least one child check-in is unchecked
    #[error("Not all dependency check-ins are checked")]
    NotAllChecked,

    /// OR logic: no child check-in is checked
    #[error("No dependency check-in is checked")]
    NoneChecked,
}

/// Duplicate check-in conflicts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// An authoritative check-in already exists for this habit and day
    #[error("Habit {habit_id} already has a check-in for {date}")]
    AlreadyCheckedToday { habit_id: HabitId, date: NaiveDate },
}

/// Validation errors for habits, check-ins, and their deltas.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Missing required field
    #[error("'{0}' is required")]
    Missing(&'static str),

    /// A delta value references a delta definition the habit does not have
    #[error("Unknown habit delta: {0} doesn't exist")]
    UnknownDelta(DeltaId),

    /// A delta value's payload kind does not match its definition
    #[error("Delta {delta_id} expects a {expected} value, got {actual}")]
    DeltaTypeMismatch {
        delta_id: DeltaId,
        expected: &'static str,
        actual: &'static str,
    },

    /// An operand references a habit that does not exist for this account
    #[error("Dependency operand {0} does not reference a habit of this account")]
    UnknownOperand(HabitId),

    /// The check-in targets a soft-deleted record
    #[error("Check-in {0} has been deleted")]
    CheckinDeleted(CheckinId),

    /// The check-in record does not belong to the given habit
    #[error("Check-in {checkin_id} does not belong to habit {habit_id}")]
    CheckinHabitMismatch {
        checkin_id: CheckinId,
        habit_id: HabitId,
    },
}

/// Storage-layer failures, passed through from the persistence collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A uniqueness constraint was violated
    #[error("Uniqueness constraint violated: {0}")]
    UniqueViolation(String),

    /// Referenced row not found
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Failed to access the data directory
    #[error("Failed to access data directory: {0}")]
    DataDir(String),

    /// Stored value could not be decoded
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, msg) => {
                if inner.code == rusqlite::ErrorCode::ConstraintViolation {
                    StorageError::UniqueViolation(
                        msg.clone().unwrap_or_else(|| inner.to_string()),
                    )
                } else {
                    StorageError::QueryFailed(err.to_string())
                }
            }
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
