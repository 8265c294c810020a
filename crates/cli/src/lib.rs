pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "loanflow",
    about = "Loanflow operator CLI",
    long_about = "Inspect configuration, apply migrations, check runtime readiness, and list persisted loan sessions.",
    after_help = "Examples:\n  loanflow doctor --json\n  loanflow config\n  loanflow sessions --customer CUST001"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, context storage, and upstream API health")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List persisted sessions, newest first")]
    Sessions {
        #[arg(long, help = "Only show sessions for this customer id")]
        customer: Option<String>,
        #[arg(long, help = "Maximum number of sessions to show")]
        limit: Option<usize>,
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Sessions { customer, limit, json } => {
            commands::sessions::run(customer.as_deref(), limit, json)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
