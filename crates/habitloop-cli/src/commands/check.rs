//! Check-in commands: gating, recording, updating, and listing.

use chrono::{NaiveDate, Utc};
use clap::Subcommand;
use habitloop_core::{
    CheckinLedger, CheckinPatch, CompletionStore, Database, DeltaPayload, DeltaUpsert,
    DeltaValue, Gate, Habit, RuleEngine, SystemClock,
};
use uuid::Uuid;

use super::parse_account;

#[derive(Subcommand)]
pub enum CheckAction {
    /// Record a check-in for a habit
    Record {
        /// Habit ID
        habit: String,
        /// Calendar day (defaults to today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Record as not done (toggle later)
        #[arg(long)]
        unchecked: bool,
        /// Delta value as delta-id=value; repeatable
        #[arg(long = "delta")]
        deltas: Vec<String>,
        /// Skip the recurrence/dependency gate
        #[arg(long)]
        force: bool,
        #[arg(long)]
        account: Option<String>,
    },
    /// Show whether a check-in would be allowed
    Status {
        /// Habit ID
        habit: String,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        account: Option<String>,
    },
    /// Update an existing check-in
    Update {
        /// Habit ID
        habit: String,
        #[arg(long)]
        date: Option<NaiveDate>,
        /// New checked state
        #[arg(long)]
        checked: Option<bool>,
        /// Delta upsert as delta-id=value; repeatable
        #[arg(long = "delta")]
        deltas: Vec<String>,
        /// Delta ids to remove; repeatable
        #[arg(long = "remove-delta")]
        remove: Vec<String>,
        #[arg(long)]
        account: Option<String>,
    },
    /// Soft-delete a check-in
    Rm {
        /// Habit ID
        habit: String,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        account: Option<String>,
    },
    /// List check-ins in a date window (defaults to a week around today)
    List {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        account: Option<String>,
    },
}

pub fn run(action: CheckAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;
    let clock = SystemClock;

    match action {
        CheckAction::Record {
            habit,
            date,
            unchecked,
            deltas,
            force,
            account,
        } => {
            let account = parse_account(&account)?;
            let habit = fetch_habit(&db, account, &habit)?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());

            if !force {
                let engine = RuleEngine::new(&db);
                if let Gate::Denied(reason) = engine.can_check_in(&habit, date)? {
                    return Err(format!("Check-in denied: {reason}").into());
                }
            }

            let deltas = deltas
                .iter()
                .map(|spec| parse_delta_value(&habit, spec))
                .collect::<Result<Vec<_>, _>>()?;

            let ledger = CheckinLedger::new(&db, &db, &clock);
            let record = ledger.record_checkin(&habit, date, !unchecked, deltas)?;
            println!("Checked in: {}", record.id);
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        CheckAction::Status { habit, date, account } => {
            let account = parse_account(&account)?;
            let habit = fetch_habit(&db, account, &habit)?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());

            let engine = RuleEngine::new(&db);
            match engine.can_check_in(&habit, date)? {
                Gate::Allowed => println!("{date}: allowed"),
                Gate::Denied(reason) => {
                    println!("{date}: denied ({reason})");
                    std::process::exit(1);
                }
            }
        }
        CheckAction::Update {
            habit,
            date,
            checked,
            deltas,
            remove,
            account,
        } => {
            let account = parse_account(&account)?;
            let habit = fetch_habit(&db, account, &habit)?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let record = db
                .existing_checkin(habit.id, date)?
                .ok_or_else(|| format!("No check-in for {} on {date}", habit.id))?;

            let mut upserts: Vec<DeltaUpsert> = Vec::new();
            for spec in &deltas {
                let value = parse_delta_value(&habit, spec)?;
                upserts.push(DeltaUpsert::set(value.habit_delta_id, value.value));
            }
            for id in &remove {
                upserts.push(DeltaUpsert::remove(Uuid::parse_str(id)?));
            }

            let ledger = CheckinLedger::new(&db, &db, &clock);
            let record = ledger.update_checkin(
                &habit,
                record,
                CheckinPatch {
                    checked,
                    deltas: upserts,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        CheckAction::Rm { habit, date, account } => {
            let account = parse_account(&account)?;
            let habit = fetch_habit(&db, account, &habit)?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let record = db
                .existing_checkin(habit.id, date)?
                .ok_or_else(|| format!("No check-in for {} on {date}", habit.id))?;

            let ledger = CheckinLedger::new(&db, &db, &clock);
            ledger.soft_delete_checkin(record)?;
            println!("Check-in deleted for {date}");
        }
        CheckAction::List { from, to, account } => {
            let account = parse_account(&account)?;
            let today = Utc::now().date_naive();
            let from = from.unwrap_or(today - chrono::Duration::days(7));
            let to = to.unwrap_or(today + chrono::Duration::days(7));
            let records = db.checkins_between(account, from, to)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }
    Ok(())
}

fn fetch_habit(
    db: &Database,
    account: Uuid,
    id: &str,
) -> Result<Habit, Box<dyn std::error::Error>> {
    let habit_id = Uuid::parse_str(id)?;
    db.habit(account, habit_id)?
        .ok_or_else(|| format!("Habit not found: {id}").into())
}

/// Parse `delta-id=value`, typing the value by the habit's definition.
fn parse_delta_value(
    habit: &Habit,
    spec: &str,
) -> Result<DeltaValue, Box<dyn std::error::Error>> {
    let (id, raw) = spec
        .split_once('=')
        .ok_or_else(|| format!("Invalid delta '{spec}', expected delta-id=value"))?;
    let delta_id = Uuid::parse_str(id.trim())?;
    let definition = habit
        .delta_definition(delta_id)
        .ok_or_else(|| format!("Unknown habit delta: {id}"))?;

    let value = match definition.kind {
        habitloop_core::DeltaKind::Number => DeltaPayload::Number(raw.parse()?),
        habitloop_core::DeltaKind::String => DeltaPayload::String(raw.to_string()),
        habitloop_core::DeltaKind::Time => {
            DeltaPayload::Time(chrono::NaiveTime::parse_from_str(raw, "%H:%M:%S")?)
        }
    };
    Ok(DeltaValue {
        habit_delta_id: delta_id,
        value,
    })
}
