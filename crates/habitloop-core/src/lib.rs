//! # Habitloop Core Library
//!
//! This library provides the core business logic for Habitloop, a recurring
//! habit tracker. It follows a CLI-first philosophy: all operations are
//! available through a standalone CLI binary that is a thin layer over this
//! crate.
//!
//! ## Architecture
//!
//! - **Recurrence**: a constrained RFC-5545-like RRULE dialect deciding
//!   whether a calendar date is a legal occurrence of a habit
//! - **Rule engine**: AND/OR dependency logic deriving a parent habit's
//!   completion from child habits, composed with the recurrence rule into
//!   a single allow/deny gate
//! - **Ledger**: idempotent check-in recording with typed delta
//!   measurements and an append-only audit trail
//! - **Storage**: SQLite-backed persistence; the one-check-in-per-day
//!   invariant is enforced by a uniqueness constraint
//!
//! ## Key Components
//!
//! - [`RecurrenceSpec`]: parsed recurrence rule and occurrence checks
//! - [`RuleEngine`] / [`DependencyGraph`]: check-in gating
//! - [`CheckinLedger`]: idempotent check-in writes
//! - [`Database`]: habits, check-ins, and audit persistence

pub mod audit;
pub mod checkin;
pub mod clock;
pub mod engine;
pub mod error;
pub mod habit;
pub mod ledger;
pub mod recurrence;
pub mod storage;

pub use audit::{AuditAction, AuditEntry, AuditSink};
pub use checkin::{CheckinId, CheckinPatch, CheckinRecord, DeltaPayload, DeltaUpsert, DeltaValue};
pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{CompletionLookup, DenyReason, DependencyGraph, Gate, RuleEngine, RuleOutcome};
pub use error::{
    ConflictError, CoreError, ParseError, RecurrenceError, Result, RuleError, StorageError,
    ValidationError,
};
pub use habit::{
    AccountId, DeltaDefinition, DeltaDraft, DeltaId, DeltaKind, DependencyLogic, Habit,
    HabitDraft, HabitId, Operator,
};
pub use ledger::{CheckinLedger, CompletionStore};
pub use recurrence::{Frequency, RecurrenceSpec};
pub use storage::Database;
