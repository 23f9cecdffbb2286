use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;

use softphone_control::{EngineConfig, Transport};

mod cli;
mod config;

use config::FileConfig;

#[derive(Parser)]
#[command(name = "phonectl")]
#[command(about = "Drive a command-line softphone from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/phonectl/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the softphone and send it commands typed on stdin
    Run(RunArgs),
    /// Call a number, hang up after a while and quit
    Dial(DialArgs),
    /// Show or edit an account profile
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Follow the softphone log
    Tail(TailArgs),
}

/// Overrides for how the softphone is started
#[derive(Parser)]
struct EngineArgs {
    /// Softphone executable
    #[arg(long)]
    command: Option<String>,

    /// Use plain pipes instead of a pseudo-terminal
    #[arg(long)]
    pipes: bool,

    /// Arguments for the softphone (replace the configured ones)
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Parser)]
struct RunArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Parser)]
struct DialArgs {
    /// Number or SIP address to call
    number: String,

    /// Seconds to stay on the call, and to wait after hanging up
    #[arg(long, default_value = "3")]
    hold_secs: u64,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print a profile's keys
    Show {
        /// Profile name (~/.twinkle/<name>.cfg) or path to a .cfg file
        profile: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set keys in a profile
    Set {
        /// Profile name (~/.twinkle/<name>.cfg) or path to a .cfg file
        profile: String,

        /// key=value pairs
        #[arg(required = true)]
        assignments: Vec<String>,
    },
}

#[derive(Parser)]
struct TailArgs {
    /// Log file (default: ~/.twinkle/twinkle.log)
    path: Option<PathBuf>,

    /// Only show lines written from now on
    #[arg(long)]
    from_end: bool,
}

fn engine_config(file: &FileConfig, args: EngineArgs) -> EngineConfig {
    let mut config = file.engine.clone();
    if let Some(command) = args.command {
        config.command = command;
    }
    if !args.args.is_empty() {
        config.args = args.args;
    }
    if args.pipes {
        config.transport = Transport::Pipes;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "phonectl=debug,softphone_control=debug,softphone_files=debug"
    } else {
        "phonectl=info,softphone_control=info,softphone_files=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let file_config: FileConfig = config::load_config(cli.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Run(args) => {
            let config = engine_config(&file_config, args.engine);
            info!("Starting {} {:?}", config.command, config.args);
            cli::run::run_command(config).await
        }
        Commands::Dial(args) => {
            let config = engine_config(&file_config, args.engine);
            cli::dial::dial_command(config, &args.number, Duration::from_secs(args.hold_secs))
                .await
        }
        Commands::Config(ConfigCommands::Show { profile, json }) => {
            cli::profile::show_command(&profile, json)
        }
        Commands::Config(ConfigCommands::Set {
            profile,
            assignments,
        }) => cli::profile::set_command(&profile, &assignments),
        Commands::Tail(args) => {
            let path = args.path.or(file_config.tail.path);
            let poll = Duration::from_millis(file_config.tail.poll_interval_ms);
            tokio::task::spawn_blocking(move || cli::tail::tail_command(path, args.from_end, poll))
                .await
                .context("Tail task failed")?
        }
    }
}
