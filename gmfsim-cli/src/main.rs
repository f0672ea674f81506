//! gmfsim-cli - Command-line tooling for gmfsim
//!
//! Checks module trees and runs single people without starting a population.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gmfsim-cli")]
#[command(about = "Module tooling for the gmfsim population simulator")]
#[command(version)]
struct Cli {
    /// Config file (defaults plus GMFSIM_* overrides when absent)
    #[arg(short, long, env = "GMFSIM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every module and report structural problems
    Validate {
        /// Module directory
        dir: PathBuf,
    },

    /// List module keys with state counts and checksums
    List {
        /// Module directory
        dir: PathBuf,
    },

    /// Simulate one person and print a JSON summary
    Simulate {
        /// Module directory
        dir: PathBuf,

        /// Person seed
        #[arg(short, long, default_value = "0")]
        seed: u64,

        /// Only run these top-level modules
        #[arg(short, long, value_delimiter = ',')]
        modules: Option<Vec<String>>,

        /// Print the whole person instead of a summary
        #[arg(long)]
        full: bool,
    },

    /// Print the effective configuration as YAML
    Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => gmfsim_runner::Config::from_file(path),
        None => Ok(gmfsim_runner::Config::from_env()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    match commands::execute(&config, cli.command) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
