//! Cadence CLI - drives a training run end to end.
//!
//! Progress lines go to stdout; logs go to stderr.

mod commands;
mod config;
mod synthetic;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::train::TrainArgs;

#[derive(Parser, Debug)]
#[command(name = "cadence", author, version, about = "Cadence - iteration orchestration for training runs")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run training on a synthetic dataset
    Train(TrainArgs),

    /// List checkpoints recorded in a results folder
    Checkpoints {
        /// Results folder of a previous run
        #[arg(short, long, default_value = commands::train::DEFAULT_RESULTS_FOLDER)]
        results_folder: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file to merge over the defaults
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Train(train) => commands::train::execute(train),
        Command::Checkpoints { results_folder, json } => commands::checkpoint::execute(&results_folder, json),
        Command::Config { config } => {
            let config = config::load_config(config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
