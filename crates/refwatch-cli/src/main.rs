use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use refwatch_reconcile::{Config, DirSource, Pipeline};

#[derive(Debug, Parser)]
#[command(name = "refwatch")]
#[command(about = "Referee course watch: snapshot reconciliation")]
struct Cli {
    /// Path to the YAML run configuration.
    #[arg(long, default_value = "refwatch.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile all snapshot feeds found in the inbox directory.
    Run {
        /// Directory holding the freshly exported snapshot CSVs.
        #[arg(long, default_value = "inbox")]
        inbox: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let config = Config::load(&cli.config)?;
    match cli.command.unwrap_or(Commands::Run {
        inbox: PathBuf::from("inbox"),
    }) {
        Commands::Run { inbox } => {
            let source = DirSource::new(inbox);
            let summary = Pipeline::new(config).run_once(&source)?;
            println!(
                "run complete: run_id={} new_courses={} persons={} registrations(+{}/~{}/-{}) report={}",
                summary.run_id,
                summary.new_courses,
                summary.persons,
                summary.registrations_added,
                summary.registrations_changed,
                summary.registrations_removed,
                summary.report_path.display()
            );
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("REFWATCH_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}
