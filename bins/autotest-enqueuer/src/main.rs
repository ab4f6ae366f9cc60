mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "autotest-enqueuer")]
#[command(about = "Autotest enqueuer - Submit, cancel and configure autotest jobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a test run and print the target queue's status
    Run {
        /// JSON argument bundle for the run
        json: String,
    },

    /// Validate and install a new test specification
    Specs {
        /// JSON object with origin, assignment_id, specs and files_path
        json: String,
    },

    /// Cancel pending test runs
    Cancel {
        /// JSON object with origin and run_ids
        json: String,
    },

    /// Print the test specification schema
    Schema,

    /// Render a supervisord config for the configured worker groups
    RenderSupervisord {
        /// Output file (defaults to supervisord.conf)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Worker binary (defaults to autotest-worker next to this binary)
        #[arg(long)]
        worker_bin: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // stdout carries results, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", commands::error_line(&e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { json } => {
            commands::run_tests(&json)?;
        }
        Commands::Specs { json } => {
            commands::update_specs(&json)?;
        }
        Commands::Cancel { json } => {
            commands::cancel_tests(&json)?;
        }
        Commands::Schema => {
            commands::print_schema()?;
        }
        Commands::RenderSupervisord { output, worker_bin } => {
            commands::render_supervisord(output.as_deref(), worker_bin.as_deref())?;
        }
    }

    Ok(())
}
