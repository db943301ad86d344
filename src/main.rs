use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use steward::config::StewardConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "steward")]
#[command(version, about = "Budget-governed agent workflow orchestrator")]
pub struct Cli {
    /// Debug-level logging (RUST_LOG and STEWARD_LOG still win)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .steward/ with a default steward.toml and an empty database
    Init,
    /// Classify a work item and show the plan it would run with
    Assess {
        /// Work item id (file name under .steward/items without extension)
        item: String,
    },
    /// Run a work item through its execution plan
    Run { item: String },
    /// Continue a stopped run from its last checkpoint
    Resume {
        run: i64,
        /// Raise the cost ceiling (USD)
        #[arg(long)]
        max_cost: Option<f64>,
        #[arg(long)]
        max_messages: Option<u32>,
        #[arg(long)]
        max_tokens: Option<u64>,
        #[arg(long)]
        max_duration_secs: Option<u64>,
        /// Show where the run would continue from without starting it
        #[arg(long)]
        dry_run: bool,
    },
    /// Show recent runs, one run in detail, or runs with a stale heartbeat
    Status {
        run: Option<i64>,
        #[arg(long)]
        stale: bool,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Ask a live run to stop at its next step boundary
    Cancel { run: i64 },
    /// List ledger records
    Calls(CallsArgs),
    /// Compare totals and per-step usage of two runs
    Compare { left: i64, right: i64 },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(clap::Args, Clone, Debug)]
pub struct CallsArgs {
    #[arg(long)]
    pub run: Option<i64>,
    #[arg(long)]
    pub model: Option<String>,
    /// Free-text match against prompt and response previews
    #[arg(long)]
    pub search: Option<String>,
    /// RFC 3339 timestamp or YYYY-MM-DD
    #[arg(long)]
    pub since: Option<String>,
    /// RFC 3339 timestamp or YYYY-MM-DD
    #[arg(long)]
    pub until: Option<String>,
    /// timestamp, tokens, cost or latency
    #[arg(long, default_value = "timestamp")]
    pub sort: String,
    /// asc or desc
    #[arg(long, default_value = "desc")]
    pub order: String,
    #[arg(long, default_value = "1")]
    pub page: usize,
    #[arg(long, default_value = "25")]
    pub per_page: usize,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default steward.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    dotenvy::from_path(project_dir.join(".env")).ok();

    let config = StewardConfig::new(project_dir)?;
    let level = config.toml.log_level_for(cli.verbose);
    let log_dir = config.steward_dir.exists().then(|| config.log_dir());
    let _guard = steward::telemetry::init(&level, config.toml.logging.format, log_dir.as_deref());

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Assess { item } => cmd::cmd_assess(&config, item, cli.json).await?,
        Commands::Run { item } => cmd::cmd_run(&config, item, cli.json).await?,
        Commands::Resume {
            run,
            max_cost,
            max_messages,
            max_tokens,
            max_duration_secs,
            dry_run,
        } => {
            let overrides = steward::orchestrator::CeilingOverrides {
                max_messages: *max_messages,
                max_cost: *max_cost,
                max_tokens: *max_tokens,
                max_duration_secs: *max_duration_secs,
            };
            cmd::cmd_resume(&config, *run, overrides, *dry_run, cli.json).await?
        }
        Commands::Status { run, stale, limit } => {
            cmd::cmd_status(&config, *run, *stale, *limit, cli.json).await?
        }
        Commands::Cancel { run } => cmd::cmd_cancel(&config, *run).await?,
        Commands::Calls(args) => cmd::cmd_calls(&config, args, cli.json).await?,
        Commands::Compare { left, right } => {
            cmd::cmd_compare(&config, *left, *right, cli.json).await?
        }
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
