//! Audit trail commands.

use clap::Subcommand;
use habitloop_core::Database;

#[derive(Subcommand)]
pub enum AuditAction {
    /// Show the most recent audit entries
    Recent {
        /// Maximum number of entries
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

pub fn run(action: AuditAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;

    match action {
        AuditAction::Recent { limit } => {
            let entries = db.recent_audit(limit)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }
    Ok(())
}
