mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, queue::QueueSubcommand, score::ScoreSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tally",
    about = "Activity capture pipeline: queue, flush, and score reconciliation",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .tally/)
    #[arg(long, global = true, env = "TALLY_ROOT")]
    root: Option<PathBuf>,

    /// Config file (default: <root>/.tally/config.yaml)
    #[arg(long, global = true, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the stores
    Init {
        /// Overwrite an existing config with defaults
        #[arg(long)]
        force: bool,
    },

    /// Run the operator server with the flush and reconciliation schedulers
    Serve {
        /// Port to listen on (default: server.port from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Move one batch of queued events into the ledger
    Flush,

    /// Merge dirty score counters into the ledger
    Reconcile,

    /// Inspect the durable queue
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Inspect score counters
    Score {
        #[command(subcommand)]
        subcommand: ScoreSubcommand,
    },

    /// Show or validate the config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let config_path = root::resolve_config(&root, cli.config.as_deref());

    let result = match cli.command {
        Commands::Init { force } => cmd::init::run(&config_path, force, cli.json),
        Commands::Serve { port } => cmd::serve::run(&config_path, port),
        Commands::Flush => cmd::flush::run(&config_path, cli.json),
        Commands::Reconcile => cmd::reconcile::run(&config_path, cli.json),
        Commands::Queue { subcommand } => cmd::queue::run(&config_path, subcommand, cli.json),
        Commands::Score { subcommand } => cmd::score::run(&config_path, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&config_path, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
