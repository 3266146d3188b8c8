//! Habit management commands for CLI.

use chrono::Utc;
use clap::Subcommand;
use habitloop_core::{
    Database, DeltaDraft, DeltaKind, DependencyLogic, HabitDraft, Operator,
};
use uuid::Uuid;

use super::parse_account;

#[derive(Subcommand)]
pub enum HabitAction {
    /// Create a new habit
    Add {
        /// Habit name
        name: String,
        /// Recurrence rule, e.g. FREQ=WEEKLY;BYDAY=MO,WE,FR
        #[arg(long, default_value = "FREQ=DAILY")]
        rule: String,
        /// Habit description
        #[arg(long)]
        description: Option<String>,
        /// Delta definition as name:kind (kind: number, string, time); repeatable
        #[arg(long = "delta")]
        deltas: Vec<String>,
        /// Child habit ids that must ALL be checked (AND logic)
        #[arg(long, value_delimiter = ',', conflicts_with = "requires_any")]
        requires_all: Vec<String>,
        /// Child habit ids of which AT LEAST ONE must be checked (OR logic)
        #[arg(long, value_delimiter = ',')]
        requires_any: Vec<String>,
        /// Account id (defaults to the local single-user account)
        #[arg(long)]
        account: Option<String>,
    },
    /// List habits
    List {
        #[arg(long)]
        account: Option<String>,
    },
    /// Get habit details
    Get {
        /// Habit ID
        id: String,
        #[arg(long)]
        account: Option<String>,
    },
    /// Soft-delete a habit
    Rm {
        /// Habit ID
        id: String,
        #[arg(long)]
        account: Option<String>,
    },
}

pub fn run(action: HabitAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;

    match action {
        HabitAction::Add {
            name,
            rule,
            description,
            deltas,
            requires_all,
            requires_any,
            account,
        } => {
            let account = parse_account(&account)?;
            let dependency = if !requires_all.is_empty() {
                DependencyLogic::Enabled {
                    operator: Operator::And,
                    operands: parse_ids(&requires_all)?,
                }
            } else if !requires_any.is_empty() {
                DependencyLogic::Enabled {
                    operator: Operator::Or,
                    operands: parse_ids(&requires_any)?,
                }
            } else {
                DependencyLogic::Disabled
            };

            let draft = HabitDraft {
                name,
                description,
                rule,
                dependency,
                deltas: deltas
                    .iter()
                    .map(|spec| parse_delta_draft(spec))
                    .collect::<Result<_, _>>()?,
            };
            let habit = db.create_habit(account, draft, Utc::now())?;
            println!("Habit created: {}", habit.id);
            println!("{}", serde_json::to_string_pretty(&habit)?);
        }
        HabitAction::List { account } => {
            let habits = db.habits(parse_account(&account)?)?;
            println!("{}", serde_json::to_string_pretty(&habits)?);
        }
        HabitAction::Get { id, account } => {
            let habit_id = Uuid::parse_str(&id)?;
            match db.habit(parse_account(&account)?, habit_id)? {
                Some(habit) => println!("{}", serde_json::to_string_pretty(&habit)?),
                None => println!("Habit not found: {id}"),
            }
        }
        HabitAction::Rm { id, account } => {
            let habit_id = Uuid::parse_str(&id)?;
            db.soft_delete_habit(parse_account(&account)?, habit_id, Utc::now())?;
            println!("Habit deleted: {id}");
        }
    }
    Ok(())
}

fn parse_ids(raw: &[String]) -> Result<Vec<Uuid>, Box<dyn std::error::Error>> {
    raw.iter()
        .map(|s| Uuid::parse_str(s.trim()).map_err(Into::into))
        .collect()
}

fn parse_delta_draft(spec: &str) -> Result<DeltaDraft, Box<dyn std::error::Error>> {
    let (name, kind) = spec
        .split_once(':')
        .ok_or_else(|| format!("Invalid delta '{spec}', expected name:kind"))?;
    let kind = match kind {
        "number" => DeltaKind::Number,
        "string" => DeltaKind::String,
        "time" => DeltaKind::Time,
        other => return Err(format!("Unknown delta kind: {other}").into()),
    };
    Ok(DeltaDraft {
        name: name.to_string(),
        description: None,
        kind,
        enabled: true,
    })
}
