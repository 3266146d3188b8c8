use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "habitloop-cli", version, about = "Habitloop CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Habit management
    Habit {
        #[command(subcommand)]
        action: commands::habit::HabitAction,
    },
    /// Check-in recording and gating
    Check {
        #[command(subcommand)]
        action: commands::check::CheckAction,
    },
    /// Audit trail
    Audit {
        #[command(subcommand)]
        action: commands::audit::AuditAction,
    },
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Habit { action } => commands::habit::run(action),
        Commands::Check { action } => commands::check::run(action),
        Commands::Audit { action } => commands::audit::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
