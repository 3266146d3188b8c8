//! Idempotent check-in recording.
//!
//! The ledger enforces at most one authoritative check-in per habit per
//! calendar day, validates delta values against the habit's definitions,
//! and appends an audit entry for every mutation. A failed call leaves no
//! new record and no partially written deltas; the store persists a record
//! and its deltas as one unit.

use chrono::NaiveDate;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditSink};
use crate::checkin::{CheckinPatch, CheckinRecord, DeltaUpsert, DeltaValue};
use crate::clock::Clock;
use crate::engine::CompletionLookup;
use crate::error::{ConflictError, CoreError, Result, StorageError, ValidationError};
use crate::habit::{Habit, HabitId};

const CHECKIN_ENTITY: &str = "checkin";

/// Persistence capability the ledger writes through.
///
/// `insert_checkin` must be atomic with respect to concurrent inserts for
/// the same `(habit_id, date)`: the store backs it with a uniqueness
/// constraint and reports a violation as [`StorageError::UniqueViolation`].
/// The ledger does not trust its own read-then-write check alone.
///
/// The ledger commits the record before appending to the audit sink. If
/// the sink then fails, the record stays persisted and the call returns
/// the sink's error; callers must not take an `Err` from a ledger write
/// to mean the record was rolled back.
pub trait CompletionStore: CompletionLookup {
    /// Non-deleted record for the habit's UTC calendar day, if any.
    fn existing_checkin(
        &self,
        habit_id: HabitId,
        date: NaiveDate,
    ) -> Result<Option<CheckinRecord>, StorageError>;

    /// Insert a new record plus its deltas as one unit.
    fn insert_checkin(&self, record: &CheckinRecord) -> Result<(), StorageError>;

    /// Replace an existing record plus its deltas as one unit.
    fn update_checkin(&self, record: &CheckinRecord) -> Result<(), StorageError>;
}

/// Records and mutates check-ins.
pub struct CheckinLedger<'a, S, A, C>
where
    S: CompletionStore,
    A: AuditSink,
    C: Clock,
{
    store: &'a S,
    audit: &'a A,
    clock: &'a C,
}

impl<'a, S, A, C> CheckinLedger<'a, S, A, C>
where
    S: CompletionStore,
    A: AuditSink,
    C: Clock,
{
    pub fn new(store: &'a S, audit: &'a A, clock: &'a C) -> Self {
        Self { store, audit, clock }
    }

    /// Record a new check-in for `habit` on `date`.
    ///
    /// Fails with [`ConflictError::AlreadyCheckedToday`] when a record for
    /// the day already exists; callers that mean to change an existing
    /// record use [`Self::update_checkin`] instead.
    pub fn record_checkin(
        &self,
        habit: &Habit,
        date: NaiveDate,
        checked: bool,
        deltas: Vec<DeltaValue>,
    ) -> Result<CheckinRecord> {
        if self.store.existing_checkin(habit.id, date)?.is_some() {
            return Err(ConflictError::AlreadyCheckedToday {
                habit_id: habit.id,
                date,
            }
            .into());
        }

        let mut stored: Vec<DeltaValue> = Vec::with_capacity(deltas.len());
        for delta in deltas {
            validate_delta(habit, &delta)?;
            // Last entry for a given definition wins.
            stored.retain(|d| d.habit_delta_id != delta.habit_delta_id);
            stored.push(delta);
        }

        let now = self.clock.now();
        let record = CheckinRecord {
            id: Uuid::new_v4(),
            habit_id: habit.id,
            account_id: habit.account_id,
            date,
            checked,
            completed_at: checked.then_some(now),
            deltas: stored,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.store.insert_checkin(&record).map_err(|err| match err {
            StorageError::UniqueViolation(_) => CoreError::Conflict(
                ConflictError::AlreadyCheckedToday {
                    habit_id: habit.id,
                    date,
                },
            ),
            other => other.into(),
        })?;

        self.audit.append(&AuditEntry::new(
            CHECKIN_ENTITY,
            record.id,
            AuditAction::Created,
            vec!["checked".into(), "completed_at".into(), "deltas".into()],
            Some(habit.account_id),
            now,
        ))?;

        Ok(record)
    }

    /// Apply a patch to an existing check-in.
    ///
    /// `record` must belong to `habit`; its delta values are validated
    /// against that habit's definitions.
    ///
    /// Delta upserts are deduplicated by definition id with the last entry
    /// winning; a matching stored value is updated in place, an upsert
    /// flagged `destroy` removes it. Toggling `checked` sets or clears
    /// `completed_at`. A patch that changes nothing writes nothing.
    pub fn update_checkin(
        &self,
        habit: &Habit,
        mut record: CheckinRecord,
        patch: CheckinPatch,
    ) -> Result<CheckinRecord> {
        if record.is_deleted() {
            return Err(ValidationError::CheckinDeleted(record.id).into());
        }
        if record.habit_id != habit.id {
            return Err(ValidationError::CheckinHabitMismatch {
                checkin_id: record.id,
                habit_id: habit.id,
            }
            .into());
        }

        let now = self.clock.now();
        let mut changed: Vec<String> = Vec::new();

        if let Some(checked) = patch.checked {
            if checked != record.checked {
                record.checked = checked;
                record.completed_at = checked.then_some(now);
                changed.push("checked".into());
                changed.push("completed_at".into());
            }
        }

        let mut deltas_changed = false;
        for upsert in dedupe_last_wins(patch.deltas) {
            deltas_changed |= apply_upsert(habit, &mut record, upsert)?;
        }
        if deltas_changed {
            changed.push("deltas".into());
        }

        if changed.is_empty() {
            return Ok(record);
        }

        record.updated_at = now;
        self.store.update_checkin(&record)?;

        self.audit.append(&AuditEntry::new(
            CHECKIN_ENTITY,
            record.id,
            AuditAction::Updated,
            changed,
            Some(habit.account_id),
            now,
        ))?;

        Ok(record)
    }

    /// Soft-delete a check-in. Terminal: the record disappears from all
    /// lookups (including dependency resolution) but stays in storage for
    /// the audit trail.
    pub fn soft_delete_checkin(&self, mut record: CheckinRecord) -> Result<CheckinRecord> {
        if record.is_deleted() {
            return Err(ValidationError::CheckinDeleted(record.id).into());
        }

        let now = self.clock.now();
        record.deleted_at = Some(now);
        record.updated_at = now;
        self.store.update_checkin(&record)?;

        self.audit.append(&AuditEntry::new(
            CHECKIN_ENTITY,
            record.id,
            AuditAction::Destroyed,
            vec!["deleted_at".into()],
            Some(record.account_id),
            now,
        ))?;

        Ok(record)
    }
}

/// Fail-fast delta validation: the definition must exist on the habit
/// (enabled or not) and the payload kind must match it.
fn validate_delta(habit: &Habit, delta: &DeltaValue) -> Result<(), ValidationError> {
    let definition = habit
        .delta_definition(delta.habit_delta_id)
        .ok_or(ValidationError::UnknownDelta(delta.habit_delta_id))?;
    if delta.value.kind() != definition.kind {
        return Err(ValidationError::DeltaTypeMismatch {
            delta_id: delta.habit_delta_id,
            expected: definition.kind.as_str(),
            actual: delta.value.kind().as_str(),
        });
    }
    Ok(())
}

/// Keep only the last upsert for each definition id, preserving the order
/// of last appearance.
fn dedupe_last_wins(upserts: Vec<DeltaUpsert>) -> Vec<DeltaUpsert> {
    let mut out: Vec<DeltaUpsert> = Vec::with_capacity(upserts.len());
    for upsert in upserts {
        out.retain(|u| u.habit_delta_id != upsert.habit_delta_id);
        out.push(upsert);
    }
    out
}

/// Apply one deduplicated upsert. Returns whether anything changed.
fn apply_upsert(
    habit: &Habit,
    record: &mut CheckinRecord,
    upsert: DeltaUpsert,
) -> Result<bool, ValidationError> {
    let id = upsert.habit_delta_id;
    if habit.delta_definition(id).is_none() {
        return Err(ValidationError::UnknownDelta(id));
    }

    if upsert.destroy {
        let before = record.deltas.len();
        record.deltas.retain(|d| d.habit_delta_id != id);
        return Ok(record.deltas.len() != before);
    }

    let value = match upsert.value {
        Some(value) => value,
        None => return Err(ValidationError::Missing("delta value")),
    };
    let delta = DeltaValue {
        habit_delta_id: id,
        value,
    };
    validate_delta(habit, &delta)?;

    match record.deltas.iter_mut().find(|d| d.habit_delta_id == id) {
        Some(existing) if *existing == delta => Ok(false),
        Some(existing) => {
            // Update in place rather than duplicating.
            existing.value = delta.value;
            Ok(true)
        }
        None => {
            record.deltas.push(delta);
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use uuid::Uuid;

    use crate::audit::MemoryAuditLog;
    use crate::checkin::DeltaPayload;
    use crate::clock::FixedClock;
    use crate::habit::{DeltaDraft, DeltaKind, DependencyLogic, HabitDraft};

    /// In-memory store with the same uniqueness guarantee as the database.
    #[derive(Default)]
    struct FakeStore {
        by_key: RefCell<HashMap<(HabitId, NaiveDate), CheckinRecord>>,
    }

    impl CompletionLookup for FakeStore {
        fn completion_on(
            &self,
            habit_id: HabitId,
            date: NaiveDate,
        ) -> Result<Option<CheckinRecord>, StorageError> {
            self.existing_checkin(habit_id, date)
        }
    }

    impl CompletionStore for FakeStore {
        fn existing_checkin(
            &self,
            habit_id: HabitId,
            date: NaiveDate,
        ) -> Result<Option<CheckinRecord>, StorageError> {
            Ok(self
                .by_key
                .borrow()
                .get(&(habit_id, date))
                .filter(|r| !r.is_deleted())
                .cloned())
        }

        fn insert_checkin(&self, record: &CheckinRecord) -> Result<(), StorageError> {
            let mut map = self.by_key.borrow_mut();
            let key = (record.habit_id, record.date);
            if map.get(&key).is_some_and(|r| !r.is_deleted()) {
                return Err(StorageError::UniqueViolation(
                    "checkins.habit_id, checkins.date".into(),
                ));
            }
            map.insert(key, record.clone());
            Ok(())
        }

        fn update_checkin(&self, record: &CheckinRecord) -> Result<(), StorageError> {
            self.by_key
                .borrow_mut()
                .insert((record.habit_id, record.date), record.clone());
            Ok(())
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        "2025-03-24T09:00:00Z".parse().unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 24).unwrap()
    }

    fn habit_with_deltas() -> Habit {
        HabitDraft {
            name: "Run".into(),
            description: None,
            rule: "FREQ=DAILY".into(),
            dependency: DependencyLogic::Disabled,
            deltas: vec![
                DeltaDraft {
                    name: "distance".into(),
                    description: None,
                    kind: DeltaKind::Number,
                    enabled: true,
                },
                DeltaDraft {
                    name: "route".into(),
                    description: None,
                    kind: DeltaKind::String,
                    enabled: false,
                },
            ],
        }
        .build(Uuid::new_v4(), fixed_now())
        .unwrap()
    }

    #[test]
    fn second_create_for_the_same_day_conflicts() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();

        let record = ledger.record_checkin(&habit, day(), true, vec![]).unwrap();
        assert_eq!(record.completed_at, Some(fixed_now()));

        let err = ledger.record_checkin(&habit, day(), true, vec![]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict(ConflictError::AlreadyCheckedToday { .. })
        ));

        // A different day is fine.
        let next = day().succ_opt().unwrap();
        assert!(ledger.record_checkin(&habit, next, false, vec![]).is_ok());
    }

    #[test]
    fn unique_violation_from_the_store_maps_to_conflict() {
        // Simulates the lost read-then-write race: the store already holds
        // a record the ledger's existence check did not observe.
        struct RacyStore(FakeStore);
        impl CompletionLookup for RacyStore {
            fn completion_on(
                &self,
                habit_id: HabitId,
                date: NaiveDate,
            ) -> Result<Option<CheckinRecord>, StorageError> {
                self.0.completion_on(habit_id, date)
            }
        }
        impl CompletionStore for RacyStore {
            fn existing_checkin(
                &self,
                _habit_id: HabitId,
                _date: NaiveDate,
            ) -> Result<Option<CheckinRecord>, StorageError> {
                Ok(None)
            }
            fn insert_checkin(&self, record: &CheckinRecord) -> Result<(), StorageError> {
                self.0.insert_checkin(record)
            }
            fn update_checkin(&self, record: &CheckinRecord) -> Result<(), StorageError> {
                self.0.update_checkin(record)
            }
        }

        let store = RacyStore(FakeStore::default());
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();

        ledger.record_checkin(&habit, day(), true, vec![]).unwrap();
        let err = ledger.record_checkin(&habit, day(), true, vec![]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict(ConflictError::AlreadyCheckedToday { .. })
        ));
    }

    #[test]
    fn unknown_delta_is_rejected_and_nothing_persists() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();

        let stranger = Uuid::new_v4();
        let err = ledger
            .record_checkin(
                &habit,
                day(),
                true,
                vec![DeltaValue {
                    habit_delta_id: stranger,
                    value: DeltaPayload::Number(5.0),
                }],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::UnknownDelta(id)) if id == stranger
        ));
        assert!(store.existing_checkin(habit.id, day()).unwrap().is_none());
        assert!(audit.entries().is_empty());
    }

    #[test]
    fn disabled_definitions_still_accept_values() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();
        let route = habit.deltas[1].id;

        let record = ledger
            .record_checkin(
                &habit,
                day(),
                true,
                vec![DeltaValue {
                    habit_delta_id: route,
                    value: DeltaPayload::String("river loop".into()),
                }],
            )
            .unwrap();
        assert_eq!(record.deltas.len(), 1);
    }

    #[test]
    fn payload_kind_must_match_definition() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();
        let distance = habit.deltas[0].id;

        let err = ledger
            .record_checkin(
                &habit,
                day(),
                true,
                vec![DeltaValue {
                    habit_delta_id: distance,
                    value: DeltaPayload::String("far".into()),
                }],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::DeltaTypeMismatch { .. })
        ));
    }

    #[test]
    fn update_dedupes_upserts_last_wins() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();
        let distance = habit.deltas[0].id;

        let record = ledger.record_checkin(&habit, day(), true, vec![]).unwrap();
        let patch = CheckinPatch {
            checked: None,
            deltas: vec![
                DeltaUpsert::set(distance, DeltaPayload::Number(3.0)),
                DeltaUpsert::set(distance, DeltaPayload::Number(5.5)),
            ],
        };
        let updated = ledger.update_checkin(&habit, record, patch).unwrap();

        assert_eq!(updated.deltas.len(), 1);
        assert_eq!(
            updated.delta(distance).unwrap().value,
            DeltaPayload::Number(5.5)
        );
    }

    #[test]
    fn update_replaces_in_place_and_destroy_removes() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();
        let distance = habit.deltas[0].id;

        let record = ledger
            .record_checkin(
                &habit,
                day(),
                true,
                vec![DeltaValue {
                    habit_delta_id: distance,
                    value: DeltaPayload::Number(3.0),
                }],
            )
            .unwrap();

        let patch = CheckinPatch {
            checked: None,
            deltas: vec![DeltaUpsert::set(distance, DeltaPayload::Number(4.0))],
        };
        let updated = ledger.update_checkin(&habit, record, patch).unwrap();
        assert_eq!(updated.deltas.len(), 1);
        assert_eq!(
            updated.delta(distance).unwrap().value,
            DeltaPayload::Number(4.0)
        );

        let patch = CheckinPatch {
            checked: None,
            deltas: vec![DeltaUpsert::remove(distance)],
        };
        let updated = ledger.update_checkin(&habit, updated, patch).unwrap();
        assert!(updated.deltas.is_empty());
    }

    #[test]
    fn update_rejects_a_record_from_another_habit() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();
        let other = habit_with_deltas();

        let record = ledger.record_checkin(&other, day(), true, vec![]).unwrap();
        let err = ledger
            .update_checkin(
                &habit,
                record,
                CheckinPatch {
                    checked: Some(false),
                    deltas: vec![],
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::CheckinHabitMismatch { habit_id, .. })
                if habit_id == habit.id
        ));

        // The other habit's record is untouched.
        let stored = store.existing_checkin(other.id, day()).unwrap().unwrap();
        assert!(stored.checked);
    }

    #[test]
    fn audit_failure_leaves_the_record_persisted() {
        struct BrokenAudit;
        impl AuditSink for BrokenAudit {
            fn append(&self, _entry: &AuditEntry) -> Result<(), StorageError> {
                Err(StorageError::QueryFailed("audit_log is gone".into()))
            }
        }

        let store = FakeStore::default();
        let audit = BrokenAudit;
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();

        let err = ledger.record_checkin(&habit, day(), true, vec![]).unwrap_err();
        assert!(matches!(err, CoreError::Storage(StorageError::QueryFailed(_))));

        // Record-then-audit ordering: the write itself stands.
        assert!(store.existing_checkin(habit.id, day()).unwrap().is_some());
    }

    #[test]
    fn toggling_checked_tracks_completed_at() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();

        let record = ledger.record_checkin(&habit, day(), false, vec![]).unwrap();
        assert_eq!(record.completed_at, None);

        let updated = ledger
            .update_checkin(
                &habit,
                record,
                CheckinPatch {
                    checked: Some(true),
                    deltas: vec![],
                },
            )
            .unwrap();
        assert_eq!(updated.completed_at, Some(fixed_now()));

        let updated = ledger
            .update_checkin(
                &habit,
                updated,
                CheckinPatch {
                    checked: Some(false),
                    deltas: vec![],
                },
            )
            .unwrap();
        assert_eq!(updated.completed_at, None);
    }

    #[test]
    fn noop_patch_writes_no_audit_entry() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();

        let record = ledger.record_checkin(&habit, day(), true, vec![]).unwrap();
        let before = audit.entries().len();

        let same = ledger
            .update_checkin(
                &habit,
                record,
                CheckinPatch {
                    checked: Some(true),
                    deltas: vec![],
                },
            )
            .unwrap();
        assert_eq!(audit.entries().len(), before);
        assert_eq!(same.updated_at, fixed_now());
    }

    #[test]
    fn soft_delete_is_terminal() {
        let store = FakeStore::default();
        let audit = MemoryAuditLog::new();
        let clock = FixedClock(fixed_now());
        let ledger = CheckinLedger::new(&store, &audit, &clock);
        let habit = habit_with_deltas();

        let record = ledger.record_checkin(&habit, day(), true, vec![]).unwrap();
        let deleted = ledger.soft_delete_checkin(record).unwrap();
        assert!(deleted.is_deleted());

        // Gone from lookups.
        assert!(store.existing_checkin(habit.id, day()).unwrap().is_none());

        // No second delete, no patch after delete.
        assert!(ledger.soft_delete_checkin(deleted.clone()).is_err());
        assert!(ledger
            .update_checkin(&habit, deleted, CheckinPatch::default())
            .is_err());

        let actions: Vec<_> = audit.entries().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Created, AuditAction::Destroyed]);
    }
}
