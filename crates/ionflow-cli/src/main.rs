//! ionflow Command-Line Interface
//!
//! `ionflow serve` runs the scheduler and the three stage pools against a
//! simulated lab; the other commands operate on the same state database and
//! can be used while a server is running.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{cancel, resubmit, serve, status, submit};

/// ionflow - experiment job scheduling and execution
#[derive(Parser)]
#[command(name = "ionflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Pipeline configuration file (YAML)
    #[arg(short, long, global = true, env = "IONFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and workers until interrupted
    Serve {
        /// Lab description: devices, parameters, hardware channels (YAML)
        #[arg(short, long)]
        lab: Option<PathBuf>,
    },

    /// Submit a job from a YAML or JSON file
    Submit {
        /// Job file
        input: PathBuf,

        /// Override the job priority (0 = most urgent, 20 = least)
        #[arg(short, long)]
        priority: Option<i64>,
    },

    /// Cancel a job and its open run
    Cancel {
        /// Job ID (UUID)
        job_id: String,
    },

    /// Submit a copy of an existing job
    Resubmit {
        /// Job ID (UUID)
        job_id: String,
    },

    /// Show job and run status
    Status {
        /// Job ID (UUID)
        job_id: Option<String>,

        /// List all jobs
        #[arg(short, long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // RUST_LOG wins over -v
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Serve { lab } => serve::execute(config, lab.as_deref()).await,
        Commands::Submit { input, priority } => submit::execute(config, &input, priority).await,
        Commands::Cancel { job_id } => cancel::execute(config, &job_id).await,
        Commands::Resubmit { job_id } => resubmit::execute(config, &job_id).await,
        Commands::Status { job_id, all } => status::execute(config, job_id.as_deref(), all).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
