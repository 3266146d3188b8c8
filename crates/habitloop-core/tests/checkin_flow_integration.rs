//! Integration tests for the full check-in flow: habit creation, rule
//! engine gating, and ledger writes against the SQLite store.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use habitloop_core::{
    CheckinLedger, CheckinPatch, CheckinRecord, ConflictError, CoreError, Database, DeltaDraft,
    DeltaKind, DeltaPayload, DeltaUpsert, DeltaValue, DenyReason, DependencyLogic, FixedClock,
    Gate, HabitDraft, Operator, RuleEngine, RuleError,
};
use habitloop_core::ledger::CompletionStore;

fn now() -> DateTime<Utc> {
    "2025-03-24T09:00:00Z".parse().unwrap()
}

// 2025-03-24 is a Monday.
fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 24).unwrap()
}

fn daily_draft(name: &str) -> HabitDraft {
    HabitDraft {
        name: name.to_string(),
        description: None,
        rule: "FREQ=DAILY".to_string(),
        dependency: DependencyLogic::Disabled,
        deltas: Vec::new(),
    }
}

#[test]
fn parent_habit_gates_on_children_and_records_once() {
    let db = Database::open_memory().unwrap();
    let clock = FixedClock(now());
    let account = Uuid::new_v4();

    let stretch = db.create_habit(account, daily_draft("Stretch"), now()).unwrap();
    let run = db.create_habit(account, daily_draft("Run"), now()).unwrap();

    let mut parent = daily_draft("Morning routine");
    parent.dependency = DependencyLogic::Enabled {
        operator: Operator::And,
        operands: vec![stretch.id, run.id],
    };
    let parent = db.create_habit(account, parent, now()).unwrap();

    let engine = RuleEngine::new(&db);
    let ledger = CheckinLedger::new(&db, &db, &clock);

    // Nothing checked yet: both children missing.
    assert_eq!(
        engine.can_check_in(&parent, monday()).unwrap(),
        Gate::Denied(DenyReason::Rule(RuleError::MissingDependencies {
            expected: 2,
            found: 0
        }))
    );

    // One child checked, the other unchecked: present but not satisfied.
    ledger.record_checkin(&stretch, monday(), true, vec![]).unwrap();
    ledger.record_checkin(&run, monday(), false, vec![]).unwrap();
    assert_eq!(
        engine.can_check_in(&parent, monday()).unwrap(),
        Gate::Denied(DenyReason::Rule(RuleError::NotAllChecked))
    );

    // Toggle the second child to checked and the gate opens.
    let run_checkin = db.existing_checkin(run.id, monday()).unwrap().unwrap();
    ledger
        .update_checkin(
            &run,
            run_checkin,
            CheckinPatch {
                checked: Some(true),
                deltas: vec![],
            },
        )
        .unwrap();
    assert_eq!(engine.can_check_in(&parent, monday()).unwrap(), Gate::Allowed);

    let record = ledger.record_checkin(&parent, monday(), true, vec![]).unwrap();
    assert_eq!(record.completed_at, Some(now()));

    // A second create for the same day conflicts.
    let err = ledger.record_checkin(&parent, monday(), true, vec![]).unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(ConflictError::AlreadyCheckedToday { .. })
    ));
}

#[test]
fn weekday_rule_denies_off_schedule_dates() {
    let db = Database::open_memory().unwrap();
    let account = Uuid::new_v4();

    let mut draft = daily_draft("Gym");
    draft.rule = "FREQ=WEEKLY;BYDAY=MO,WE,FR".to_string();
    let habit = db.create_habit(account, draft, now()).unwrap();

    let engine = RuleEngine::new(&db);
    let tuesday = NaiveDate::from_ymd_opt(2025, 3, 25).unwrap();
    assert_eq!(
        engine.can_check_in(&habit, tuesday).unwrap(),
        Gate::Denied(DenyReason::NotScheduled { date: tuesday })
    );
    assert_eq!(engine.can_check_in(&habit, monday()).unwrap(), Gate::Allowed);
}

#[test]
fn deltas_persist_and_update_through_the_store() {
    let db = Database::open_memory().unwrap();
    let clock = FixedClock(now());
    let account = Uuid::new_v4();

    let mut draft = daily_draft("Run");
    draft.deltas = vec![
        DeltaDraft {
            name: "distance".into(),
            description: None,
            kind: DeltaKind::Number,
            enabled: true,
        },
        DeltaDraft {
            name: "start".into(),
            description: None,
            kind: DeltaKind::Time,
            enabled: true,
        },
    ];
    let habit = db.create_habit(account, draft, now()).unwrap();
    let distance = habit.deltas[0].id;
    let start = habit.deltas[1].id;

    let ledger = CheckinLedger::new(&db, &db, &clock);
    ledger
        .record_checkin(
            &habit,
            monday(),
            true,
            vec![DeltaValue {
                habit_delta_id: distance,
                value: DeltaPayload::Number(5.2),
            }],
        )
        .unwrap();

    let stored = db.existing_checkin(habit.id, monday()).unwrap().unwrap();
    assert_eq!(stored.delta(distance).unwrap().value, DeltaPayload::Number(5.2));

    // Upsert list with a duplicate id: last wins, plus a new time value.
    let seven_ten = chrono::NaiveTime::from_hms_opt(7, 10, 0).unwrap();
    let updated = ledger
        .update_checkin(
            &habit,
            stored,
            CheckinPatch {
                checked: None,
                deltas: vec![
                    DeltaUpsert::set(distance, DeltaPayload::Number(6.0)),
                    DeltaUpsert::set(distance, DeltaPayload::Number(6.5)),
                    DeltaUpsert::set(start, DeltaPayload::Time(seven_ten)),
                ],
            },
        )
        .unwrap();
    assert_eq!(updated.deltas.len(), 2);

    let reloaded = db.existing_checkin(habit.id, monday()).unwrap().unwrap();
    assert_eq!(reloaded.delta(distance).unwrap().value, DeltaPayload::Number(6.5));
    assert_eq!(reloaded.delta(start).unwrap().value, DeltaPayload::Time(seven_ten));

    // Destroy removes the value from storage.
    let cleared = ledger
        .update_checkin(
            &habit,
            reloaded,
            CheckinPatch {
                checked: None,
                deltas: vec![DeltaUpsert::remove(distance)],
            },
        )
        .unwrap();
    assert_eq!(cleared.deltas.len(), 1);
    let reloaded = db.existing_checkin(habit.id, monday()).unwrap().unwrap();
    assert!(reloaded.delta(distance).is_none());
}

#[test]
fn soft_deleted_checkin_leaves_dependency_resolution() {
    let db = Database::open_memory().unwrap();
    let clock = FixedClock(now());
    let account = Uuid::new_v4();

    let child = db.create_habit(account, daily_draft("Child"), now()).unwrap();
    let mut parent = daily_draft("Parent");
    parent.dependency = DependencyLogic::Enabled {
        operator: Operator::Or,
        operands: vec![child.id],
    };
    let parent = db.create_habit(account, parent, now()).unwrap();

    let ledger = CheckinLedger::new(&db, &db, &clock);
    let record = ledger.record_checkin(&child, monday(), true, vec![]).unwrap();

    let engine = RuleEngine::new(&db);
    assert_eq!(engine.can_check_in(&parent, monday()).unwrap(), Gate::Allowed);

    ledger.soft_delete_checkin(record).unwrap();
    assert_eq!(
        engine.can_check_in(&parent, monday()).unwrap(),
        Gate::Denied(DenyReason::Rule(RuleError::MissingDependencies {
            expected: 1,
            found: 0
        }))
    );

    // The day is free again for a fresh check-in.
    assert!(ledger.record_checkin(&child, monday(), false, vec![]).is_ok());
}

#[test]
fn checkins_between_spans_the_requested_window() {
    let db = Database::open_memory().unwrap();
    let clock = FixedClock(now());
    let account = Uuid::new_v4();
    let habit = db.create_habit(account, daily_draft("Read"), now()).unwrap();
    let ledger = CheckinLedger::new(&db, &db, &clock);

    for offset in 0..5 {
        let date = monday() + chrono::Duration::days(offset);
        ledger.record_checkin(&habit, date, true, vec![]).unwrap();
    }

    let window = db
        .checkins_between(
            account,
            monday() + chrono::Duration::days(1),
            monday() + chrono::Duration::days(3),
        )
        .unwrap();
    assert_eq!(window.len(), 3);
    assert!(window.windows(2).all(|w| w[0].date <= w[1].date));

    // Another account sees nothing.
    assert!(db
        .checkins_between(Uuid::new_v4(), monday(), monday() + chrono::Duration::days(7))
        .unwrap()
        .is_empty());
}

#[test]
fn concurrent_style_writers_cannot_both_insert() {
    // Both writers observed "no existing record" before either wrote; the
    // partial unique index must let exactly one insert through.
    let db = Database::open_memory().unwrap();
    let account = Uuid::new_v4();
    let habit = db.create_habit(account, daily_draft("Race"), now()).unwrap();

    let make_record = || CheckinRecord {
        id: Uuid::new_v4(),
        habit_id: habit.id,
        account_id: account,
        date: monday(),
        checked: true,
        completed_at: Some(now()),
        deltas: vec![],
        created_at: now(),
        updated_at: now(),
        deleted_at: None,
    };

    let mut successes = 0;
    for _ in 0..4 {
        if db.insert_checkin(&make_record()).is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Any interleaving of writers that all passed the existence check
        // ends with exactly one stored record for the day.
        #[test]
        fn exactly_one_writer_wins(flags in prop::collection::vec(any::<bool>(), 2..6)) {
            let db = Database::open_memory().unwrap();
            let account = Uuid::new_v4();
            let habit = db.create_habit(account, daily_draft("Race"), now()).unwrap();

            let mut successes = 0;
            for checked in flags {
                let record = CheckinRecord {
                    id: Uuid::new_v4(),
                    habit_id: habit.id,
                    account_id: account,
                    date: monday(),
                    checked,
                    completed_at: checked.then(now),
                    deltas: vec![],
                    created_at: now(),
                    updated_at: now(),
                    deleted_at: None,
                };
                if db.insert_checkin(&record).is_ok() {
                    successes += 1;
                }
            }
            prop_assert_eq!(successes, 1);
            prop_assert!(db.existing_checkin(habit.id, monday()).unwrap().is_some());
        }
    }
}
