mod app;
mod cmd;
mod duration;
mod output;
mod root;

use clap::{ArgAction, Parser, Subcommand};
use cmd::{bee::BeeSubcommand, bees::BeesSubcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "thelma",
    about = "Create, provision, pin, start, stop and delete Branch Engineering Environments",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: $THELMA_HOME/config.yaml)
    #[arg(long, global = true, env = "THELMA_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage a single BEE
    Bee {
        #[command(subcommand)]
        subcommand: BeeSubcommand,
    },

    /// Operate on many BEEs at once
    Bees {
        #[command(subcommand)]
        subcommand: BeesSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let filter = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let locations = root::resolve(cli.config.as_deref())?;
    let app = app::App::build(&locations)?;
    let json = cli.json;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let result = match cli.command {
            Commands::Bee { subcommand } => cmd::bee::run(&app, subcommand, json).await,
            Commands::Bees { subcommand } => cmd::bees::run(&app, subcommand, json).await,
        };
        if let Err(e) = app.hooks.run().await {
            tracing::warn!("cleanup failed: {e}");
        }
        result
    })
}
