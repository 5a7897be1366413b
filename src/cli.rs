use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{self, Config};

#[derive(Parser)]
#[command(name = "convertd")]
#[command(about = "convertd - ephemeral file conversion gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config.json (default: ~/.convertd/config.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the conversion gateway until SIGTERM/SIGINT
    Serve {
        /// Address to listen on, e.g. 127.0.0.1:8080
        #[arg(short, long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Display version information
    Version,
}

pub fn run(cli: Cli) {
    let result = match cli.command {
        Some(Commands::Serve { bind }) => serve(bind, cli.config),
        Some(Commands::Init { force }) => init(cli.config, force),
        Some(Commands::Version) => {
            print_version();
            Ok(())
        }
        None => {
            print_help();
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        process::exit(1);
    }
}

fn serve(bind: Option<String>, config_path: Option<PathBuf>) -> Result<()> {
    let config = config::load_config(bind, config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(crate::gateway::run_gateway(&config))
}

fn init(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = config_path
        .or_else(config::get_config_path)
        .context("Could not determine config path")?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    config::save_config(&Config::default(), &path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Extracts the command name from clap's "unrecognized subcommand 'x'" error
pub fn extract_command_from_error(error_msg: &str) -> String {
    if let Some(start) = error_msg.find('\'') {
        if let Some(end) = error_msg[start + 1..].find('\'') {
            return error_msg[start + 1..start + 1 + end].to_string();
        }
    }
    "unknown".to_string()
}

fn print_version() {
    println!("convertd {}", env!("CARGO_PKG_VERSION"));
}

fn print_help() {
    println!("convertd - ephemeral file conversion gateway");
    println!();
    println!("Usage: convertd [OPTIONS] <COMMAND>");
    println!();
    println!("Commands:");
    println!("  serve    Run the conversion gateway until SIGTERM/SIGINT");
    println!("  init     Write a default configuration file");
    println!("  version  Display version information");
    println!("  help     Print this message or the help of the given subcommand(s)");
    println!();
    println!("Options:");
    println!("  -v, --verbose      Enable debug logging");
    println!("  -c, --config PATH  Path to config.json");
    println!("  -V, --version      Print version");
    println!("  -h, --help         Print help");
}
