//! Offline driver: create runs and experiments from JSON request files
//! against a local runs root, without the HTTP surface. Useful for golden
//! generation and scripted backtests.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use buff_runs::{resolve_runs_root, BuildContext};

#[derive(Parser)]
#[command(name = "buff")]
#[command(about = "Offline simulation run manager", long_about = None)]
struct Cli {
    /// Artifacts root (falls back to the RUNS_ROOT env var).
    #[arg(long)]
    runs_root: Option<PathBuf>,

    /// Root for repo-relative CSV paths (default: current directory).
    #[arg(long)]
    repo_root: Option<PathBuf>,

    /// Owner user id for created artifacts.
    #[arg(long, default_value = "local")]
    user: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a run from a JSON request file and print the response.
    Run {
        /// Path to the run request JSON.
        request: PathBuf,
    },

    /// Create an experiment from a JSON request file and print the response.
    Experiment {
        /// Path to the experiment request JSON.
        request: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let configured = cli
        .runs_root
        .or_else(|| std::env::var("RUNS_ROOT").ok().map(PathBuf::from));
    let runs_root = match resolve_runs_root(configured.as_deref()) {
        Ok(root) => root,
        Err(err) => bail!("{}: {}", err.code, err.message),
    };
    let repo_root = match cli.repo_root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let ctx = BuildContext {
        runs_root,
        repo_root,
    };

    match cli.cmd {
        Commands::Run { request } => {
            let payload = read_request(&request)?;
            match buff_runs::create_run(&ctx, &payload, &cli.user) {
                Ok(outcome) => {
                    println!("status={}", outcome.status_code);
                    println!("{}", serde_json::to_string_pretty(&outcome.body)?);
                }
                Err(err) => bail!("{}: {}", err.code, err.message),
            }
        }
        Commands::Experiment { request } => {
            let payload = read_request(&request)?;
            match buff_experiments::create_experiment(&ctx, &payload, &cli.user) {
                Ok(outcome) => {
                    println!("status={}", outcome.status_code);
                    println!("{}", serde_json::to_string_pretty(&outcome.body)?);
                }
                Err(err) => bail!("{}: {}", err.code, err.message),
            }
        }
    }

    Ok(())
}

fn read_request(path: &PathBuf) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read request file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse JSON in {}", path.display()))
}
