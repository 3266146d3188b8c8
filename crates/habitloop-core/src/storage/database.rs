//! SQLite-backed persistence for habits, check-ins, and the audit log.
//!
//! The at-most-one-check-in-per-day invariant lives here as a partial
//! unique index over non-deleted check-ins, so a lost read-then-write race
//! between two writers surfaces as a constraint violation instead of a
//! duplicate row.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::data_dir;
use crate::audit::{AuditAction, AuditEntry, AuditSink};
use crate::checkin::{CheckinId, CheckinRecord, DeltaPayload, DeltaValue};
use crate::engine::CompletionLookup;
use crate::error::{Result, StorageError, ValidationError};
use crate::habit::{
    AccountId, DeltaDefinition, DeltaKind, DependencyLogic, Habit, HabitDraft, HabitId,
};
use crate::ledger::CompletionStore;
use crate::recurrence::RecurrenceSpec;

/// SQLite database holding all persistent state.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database at `~/.config/habitloop/habitloop.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    pub fn open() -> Result<Self, StorageError> {
        let path = data_dir()?.join("habitloop.db");
        let conn = Connection::open(path).map_err(StorageError::from)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: &std::path::Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(StorageError::from)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS habits (
                id          TEXT PRIMARY KEY,
                account_id  TEXT NOT NULL,
                name        TEXT NOT NULL,
                description TEXT,
                rule        TEXT NOT NULL,
                dependency  TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                deleted_at  TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_habits_account ON habits(account_id);

            CREATE TABLE IF NOT EXISTS habit_deltas (
                id          TEXT PRIMARY KEY,
                habit_id    TEXT NOT NULL REFERENCES habits(id),
                name        TEXT NOT NULL,
                description TEXT,
                kind        TEXT NOT NULL,
                enabled     INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_habit_deltas_habit ON habit_deltas(habit_id);

            CREATE TABLE IF NOT EXISTS checkins (
                id           TEXT PRIMARY KEY,
                habit_id     TEXT NOT NULL REFERENCES habits(id),
                account_id   TEXT NOT NULL,
                date         TEXT NOT NULL,
                checked      INTEGER NOT NULL,
                completed_at TEXT,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                deleted_at   TEXT
            );

            -- One authoritative check-in per habit per day; soft-deleted
            -- rows stay behind for audit without blocking a re-check.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_checkins_habit_date_live
                ON checkins(habit_id, date) WHERE deleted_at IS NULL;

            CREATE INDEX IF NOT EXISTS idx_checkins_account_date
                ON checkins(account_id, date);

            CREATE TABLE IF NOT EXISTS checkin_deltas (
                checkin_id     TEXT NOT NULL REFERENCES checkins(id),
                habit_delta_id TEXT NOT NULL,
                kind           TEXT NOT NULL,
                value          TEXT NOT NULL,
                PRIMARY KEY (checkin_id, habit_delta_id)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type    TEXT NOT NULL,
                entity_id      TEXT NOT NULL,
                action         TEXT NOT NULL,
                changed_fields TEXT NOT NULL,
                actor          TEXT,
                at             TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_entity
                ON audit_log(entity_type, entity_id);",
        )?;
        Ok(())
    }

    // === Habits ===

    /// Validate a draft and persist it as a new habit for `account_id`.
    ///
    /// Dependency operands must name existing, non-deleted habits of the
    /// same account; a cross-account or dangling operand fails validation
    /// here rather than later at evaluation time.
    pub fn create_habit(
        &self,
        account_id: AccountId,
        draft: HabitDraft,
        now: DateTime<Utc>,
    ) -> Result<Habit> {
        let habit = draft.build(account_id, now)?;

        for operand in habit.dependency.distinct_operands() {
            if self.habit(account_id, operand)?.is_none() {
                return Err(ValidationError::UnknownOperand(operand).into());
            }
        }

        let tx = self.conn.unchecked_transaction().map_err(StorageError::from)?;
        tx.execute(
            "INSERT INTO habits (id, account_id, name, description, rule, dependency, created_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
            params![
                habit.id.to_string(),
                habit.account_id.to_string(),
                habit.name,
                habit.description,
                habit.recurrence.to_string(),
                serde_json::to_string(&habit.dependency).map_err(StorageError::from)?,
                habit.created_at.to_rfc3339(),
            ],
        )
        .map_err(StorageError::from)?;

        for delta in &habit.deltas {
            tx.execute(
                "INSERT INTO habit_deltas (id, habit_id, name, description, kind, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    delta.id.to_string(),
                    habit.id.to_string(),
                    delta.name,
                    delta.description,
                    delta.kind.as_str(),
                    delta.enabled,
                ],
            )
            .map_err(StorageError::from)?;
        }

        insert_audit(
            &tx,
            &AuditEntry::new(
                "habit",
                habit.id,
                AuditAction::Created,
                vec!["name".into(), "rule".into(), "dependency".into(), "deltas".into()],
                Some(account_id),
                now,
            ),
        )?;

        tx.commit().map_err(StorageError::from)?;
        Ok(habit)
    }

    /// Fetch a non-deleted habit by id, scoped to the account.
    pub fn habit(
        &self,
        account_id: AccountId,
        habit_id: HabitId,
    ) -> Result<Option<Habit>, StorageError> {
        let row = self
            .conn
            .prepare(
                "SELECT id, account_id, name, description, rule, dependency, created_at, deleted_at
                 FROM habits
                 WHERE id = ?1 AND account_id = ?2 AND deleted_at IS NULL",
            )?
            .query_row(
                params![habit_id.to_string(), account_id.to_string()],
                row_to_habit_stub,
            )
            .optional()?;

        match row {
            Some(mut habit) => {
                habit.deltas = self.habit_deltas(habit.id)?;
                Ok(Some(habit))
            }
            None => Ok(None),
        }
    }

    /// All non-deleted habits of the account, newest first.
    pub fn habits(&self, account_id: AccountId) -> Result<Vec<Habit>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, account_id, name, description, rule, dependency, created_at, deleted_at
             FROM habits
             WHERE account_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at DESC",
        )?;
        let stubs = stmt
            .query_map(params![account_id.to_string()], row_to_habit_stub)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut habits = Vec::with_capacity(stubs.len());
        for mut habit in stubs {
            habit.deltas = self.habit_deltas(habit.id)?;
            habits.push(habit);
        }
        Ok(habits)
    }

    fn habit_deltas(&self, habit_id: HabitId) -> Result<Vec<DeltaDefinition>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, kind, enabled
             FROM habit_deltas WHERE habit_id = ?1 ORDER BY rowid",
        )?;
        let deltas = stmt
            .query_map(params![habit_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        deltas
            .into_iter()
            .map(|(id, name, description, kind, enabled)| {
                Ok(DeltaDefinition {
                    id: parse_uuid(&id)?,
                    name,
                    description,
                    kind: parse_delta_kind(&kind)?,
                    enabled,
                })
            })
            .collect()
    }

    /// Soft-delete a habit. The habit disappears from lookups but its
    /// check-in history stays behind for audit.
    pub fn soft_delete_habit(
        &self,
        account_id: AccountId,
        habit_id: HabitId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction().map_err(StorageError::from)?;
        let updated = tx
            .execute(
                "UPDATE habits SET deleted_at = ?1
                 WHERE id = ?2 AND account_id = ?3 AND deleted_at IS NULL",
                params![now.to_rfc3339(), habit_id.to_string(), account_id.to_string()],
            )
            .map_err(StorageError::from)?;
        if updated == 0 {
            return Err(StorageError::NotFound {
                entity: "habit",
                id: habit_id.to_string(),
            }
            .into());
        }

        insert_audit(
            &tx,
            &AuditEntry::new(
                "habit",
                habit_id,
                AuditAction::Destroyed,
                vec!["deleted_at".into()],
                Some(account_id),
                now,
            ),
        )?;

        tx.commit().map_err(StorageError::from)?;
        Ok(())
    }

    // === Check-ins ===

    /// Fetch a non-deleted check-in by id for a habit.
    pub fn checkin(
        &self,
        habit_id: HabitId,
        checkin_id: CheckinId,
    ) -> Result<Option<CheckinRecord>, StorageError> {
        let record = self
            .conn
            .prepare(
                "SELECT id, habit_id, account_id, date, checked, completed_at,
                        created_at, updated_at, deleted_at
                 FROM checkins
                 WHERE id = ?1 AND habit_id = ?2 AND deleted_at IS NULL",
            )?
            .query_row(
                params![checkin_id.to_string(), habit_id.to_string()],
                row_to_checkin_stub,
            )
            .optional()?;
        self.attach_deltas(record)
    }

    /// Non-deleted check-ins for an account within `[start, end]`.
    pub fn checkins_between(
        &self,
        account_id: AccountId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CheckinRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, habit_id, account_id, date, checked, completed_at,
                    created_at, updated_at, deleted_at
             FROM checkins
             WHERE account_id = ?1 AND date >= ?2 AND date <= ?3 AND deleted_at IS NULL
             ORDER BY date",
        )?;
        let stubs = stmt
            .query_map(
                params![account_id.to_string(), start.to_string(), end.to_string()],
                row_to_checkin_stub,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(stubs.len());
        for stub in stubs {
            if let Some(record) = self.attach_deltas(Some(stub))? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn attach_deltas(
        &self,
        record: Option<CheckinRecord>,
    ) -> Result<Option<CheckinRecord>, StorageError> {
        let mut record = match record {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut stmt = self.conn.prepare(
            "SELECT habit_delta_id, kind, value
             FROM checkin_deltas WHERE checkin_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![record.id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        record.deltas = rows
            .into_iter()
            .map(|(id, kind, value)| {
                Ok(DeltaValue {
                    habit_delta_id: parse_uuid(&id)?,
                    value: decode_payload(&kind, &value)?,
                })
            })
            .collect::<Result<_, StorageError>>()?;
        Ok(Some(record))
    }

    fn write_deltas(
        tx: &rusqlite::Transaction<'_>,
        record: &CheckinRecord,
    ) -> Result<(), StorageError> {
        tx.execute(
            "DELETE FROM checkin_deltas WHERE checkin_id = ?1",
            params![record.id.to_string()],
        )?;
        for delta in &record.deltas {
            let (kind, value) = encode_payload(&delta.value);
            tx.execute(
                "INSERT INTO checkin_deltas (checkin_id, habit_delta_id, kind, value)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id.to_string(),
                    delta.habit_delta_id.to_string(),
                    kind,
                    value,
                ],
            )?;
        }
        Ok(())
    }

    // === Audit ===

    /// Most recent audit entries, newest first.
    pub fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, entity_id, action, changed_fields, actor, at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(entity_type, entity_id, action, changed, actor, at)| {
                Ok(AuditEntry {
                    entity_type,
                    entity_id,
                    action: parse_audit_action(&action)?,
                    changed_fields: serde_json::from_str(&changed)?,
                    actor: actor.as_deref().map(parse_uuid).transpose()?,
                    at: parse_datetime(&at)?,
                })
            })
            .collect()
    }
}

impl CompletionLookup for Database {
    fn completion_on(
        &self,
        habit_id: HabitId,
        date: NaiveDate,
    ) -> Result<Option<CheckinRecord>, StorageError> {
        self.existing_checkin(habit_id, date)
    }
}

impl CompletionStore for Database {
    fn existing_checkin(
        &self,
        habit_id: HabitId,
        date: NaiveDate,
    ) -> Result<Option<CheckinRecord>, StorageError> {
        let record = self
            .conn
            .prepare(
                "SELECT id, habit_id, account_id, date, checked, completed_at,
                        created_at, updated_at, deleted_at
                 FROM checkins
                 WHERE habit_id = ?1 AND date = ?2 AND deleted_at IS NULL",
            )?
            .query_row(
                params![habit_id.to_string(), date.to_string()],
                row_to_checkin_stub,
            )
            .optional()?;
        self.attach_deltas(record)
    }

    fn insert_checkin(&self, record: &CheckinRecord) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO checkins (id, habit_id, account_id, date, checked, completed_at,
                                   created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
            params![
                record.id.to_string(),
                record.habit_id.to_string(),
                record.account_id.to_string(),
                record.date.to_string(),
                record.checked,
                record.completed_at.map(|t| t.to_rfc3339()),
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Self::write_deltas(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn update_checkin(&self, record: &CheckinRecord) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE checkins
             SET checked = ?2, completed_at = ?3, updated_at = ?4, deleted_at = ?5
             WHERE id = ?1",
            params![
                record.id.to_string(),
                record.checked,
                record.completed_at.map(|t| t.to_rfc3339()),
                record.updated_at.to_rfc3339(),
                record.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound {
                entity: "checkin",
                id: record.id.to_string(),
            });
        }
        Self::write_deltas(&tx, record)?;
        tx.commit()?;
        Ok(())
    }
}

impl AuditSink for Database {
    fn append(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        insert_audit(&tx, entry)?;
        tx.commit()?;
        Ok(())
    }
}

fn insert_audit(tx: &rusqlite::Transaction<'_>, entry: &AuditEntry) -> Result<(), StorageError> {
    tx.execute(
        "INSERT INTO audit_log (entity_type, entity_id, action, changed_fields, actor, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.entity_type,
            entry.entity_id,
            entry.action.as_str(),
            serde_json::to_string(&entry.changed_fields)?,
            entry.actor.map(|a| a.to_string()),
            entry.at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

// === Row decoding ===

fn row_to_habit_stub(row: &Row<'_>) -> rusqlite::Result<Habit> {
    let id: String = row.get(0)?;
    let account_id: String = row.get(1)?;
    let rule: String = row.get(4)?;
    let dependency: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let deleted_at: Option<String> = row.get(7)?;
    Ok(Habit {
        id: parse_uuid_sql(&id, 0)?,
        account_id: parse_uuid_sql(&account_id, 1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        recurrence: RecurrenceSpec::parse(&rule).map_err(|e| text_error(4, e))?,
        dependency: serde_json::from_str::<DependencyLogic>(&dependency)
            .map_err(|e| text_error(5, e))?,
        deltas: Vec::new(),
        created_at: parse_datetime_sql(&created_at, 6)?,
        deleted_at: deleted_at
            .as_deref()
            .map(|t| parse_datetime_sql(t, 7))
            .transpose()?,
    })
}

fn row_to_checkin_stub(row: &Row<'_>) -> rusqlite::Result<CheckinRecord> {
    let id: String = row.get(0)?;
    let habit_id: String = row.get(1)?;
    let account_id: String = row.get(2)?;
    let date: String = row.get(3)?;
    let completed_at: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    let deleted_at: Option<String> = row.get(8)?;
    Ok(CheckinRecord {
        id: parse_uuid_sql(&id, 0)?,
        habit_id: parse_uuid_sql(&habit_id, 1)?,
        account_id: parse_uuid_sql(&account_id, 2)?,
        date: date.parse().map_err(|e| text_error(3, e))?,
        checked: row.get(4)?,
        completed_at: completed_at
            .as_deref()
            .map(|t| parse_datetime_sql(t, 5))
            .transpose()?,
        deltas: Vec::new(),
        created_at: parse_datetime_sql(&created_at, 6)?,
        updated_at: parse_datetime_sql(&updated_at, 7)?,
        deleted_at: deleted_at
            .as_deref()
            .map(|t| parse_datetime_sql(t, 8))
            .transpose()?,
    })
}

fn text_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_uuid_sql(raw: &str, index: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| text_error(index, e))
}

fn parse_datetime_sql(raw: &str, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| text_error(index, e))
}

fn parse_uuid(raw: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn parse_delta_kind(raw: &str) -> Result<DeltaKind, StorageError> {
    match raw {
        "number" => Ok(DeltaKind::Number),
        "string" => Ok(DeltaKind::String),
        "time" => Ok(DeltaKind::Time),
        other => Err(StorageError::Corrupt(format!("unknown delta kind: {other}"))),
    }
}

fn parse_audit_action(raw: &str) -> Result<AuditAction, StorageError> {
    match raw {
        "created" => Ok(AuditAction::Created),
        "updated" => Ok(AuditAction::Updated),
        "destroyed" => Ok(AuditAction::Destroyed),
        other => Err(StorageError::Corrupt(format!("unknown audit action: {other}"))),
    }
}

fn encode_payload(payload: &DeltaPayload) -> (&'static str, String) {
    match payload {
        DeltaPayload::Number(n) => ("number", n.to_string()),
        DeltaPayload::String(s) => ("string", s.clone()),
        DeltaPayload::Time(t) => ("time", t.format("%H:%M:%S").to_string()),
    }
}

fn decode_payload(kind: &str, value: &str) -> Result<DeltaPayload, StorageError> {
    match kind {
        "number" => value
            .parse::<f64>()
            .map(DeltaPayload::Number)
            .map_err(|e| StorageError::Corrupt(e.to_string())),
        "string" => Ok(DeltaPayload::String(value.to_string())),
        "time" => NaiveTime::parse_from_str(value, "%H:%M:%S")
            .map(DeltaPayload::Time)
            .map_err(|e| StorageError::Corrupt(e.to_string())),
        other => Err(StorageError::Corrupt(format!("unknown delta kind: {other}"))),
    }
}
