use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kratos::config::{expand_path, LogFormat};
use kratos::Config;

mod commands;
mod templates;

#[derive(Parser)]
#[command(name = "kratos")]
#[command(
    author,
    version,
    about = "Kratos - ephemeral AI agents executed in disposable sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./kratos.toml)
    #[arg(short, long, global = true, env = "KRATOS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter kratos.toml and an example agent
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Register an agent and build its environment
    Submit {
        /// Agent name
        name: String,

        /// Agent definition file (JSON)
        #[arg(short, long)]
        definition: PathBuf,

        /// Extra package to install in the environment (repeatable)
        #[arg(long = "dep", value_name = "PACKAGE")]
        dependencies: Vec<String>,
    },

    /// Run one task in a fresh sandbox
    Invoke {
        /// Agent name
        name: String,

        /// Task passed to the agent
        task: String,

        /// Wall-clock limit in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Memory limit (e.g., "512m", "2g")
        #[arg(short, long)]
        memory: Option<String>,

        /// Print agent stdout as it is produced instead of the final result
        #[arg(long)]
        stream: bool,
    },

    /// Delete an agent
    Remove {
        /// Agent name
        name: String,
    },

    /// List registered agents
    List,

    /// Show resource usage of an agent
    Usage {
        /// Agent name
        name: String,

        /// Window to summarize, in hours
        #[arg(long, default_value = "24")]
        hours: u32,
    },

    /// Remove orphaned sandboxes and unreferenced images
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_file(path)?,
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Config::load(&cwd)?
        }
    };

    let _guard = init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Submit {
            name,
            definition,
            dependencies,
        } => {
            commands::submit::run(&config, &name, &definition, dependencies).await?;
        }
        Commands::Invoke {
            name,
            task,
            timeout,
            memory,
            stream,
        } => {
            commands::invoke::run(&config, &name, &task, timeout, memory, stream).await?;
        }
        Commands::Remove { name } => {
            commands::remove::run(&config, &name).await?;
        }
        Commands::List => {
            commands::list::run(&config)?;
        }
        Commands::Usage { name, hours } => {
            commands::usage::run(&config, &name, hours)?;
        }
        Commands::Prune => {
            commands::prune::run(&config).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout carries only command output. With
/// `[logging] directory` set, a daily-rotated file gets a copy.
fn init_logging(config: &Config, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("kratos=debug")
        } else {
            EnvFilter::new("kratos=info")
        }
    });

    let timer = ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.3fZ".to_string());
    let stderr = match config.logging.format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(timer)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_timer(timer)
            .boxed(),
    };

    let (file, guard) = match &config.logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(expand_path(dir)?, "kratos.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_timer(ChronoUtc::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();

    Ok(guard)
}
