mod commands;
mod config;
mod logging;

use clap::{Parser, Subcommand};
use heron_sftp::config::LogFormat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "heron")]
#[command(about = "Managed OpenSSH SFTP service driven by a declarative user list", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine settings file path
    #[arg(short, long, default_value = "/etc/heron/heron.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile accounts and supervise sshd until stopped
    Run {
        /// Session event endpoint bind address
        #[arg(short, long)]
        bind: Option<String>,

        /// Log format (json or text)
        #[arg(long)]
        log_format: Option<LogFormat>,

        /// Log file path
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Verbose logging (debug level)
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the sshd configuration for a desired-state document
    Render {
        /// Desired-state document (defaults to the configured path)
        document: Option<PathBuf>,
    },

    /// Validate a desired-state document
    Check {
        /// Desired-state document (defaults to the configured path)
        document: Option<PathBuf>,
    },

    /// Write the default engine settings file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            bind,
            log_format,
            log_file,
            verbose,
        } => {
            let overrides = commands::server::Overrides {
                bind,
                log_format,
                log_file,
                verbose,
            };
            commands::server::run(&cli.config, overrides).await
        }
        Commands::Render { document } => commands::document::render(&cli.config, document).await,
        Commands::Check { document } => commands::document::check(&cli.config, document).await,
        Commands::InitConfig { force } => commands::server::init_config(&cli.config, force).await,
    };

    if let Err(e) = result {
        tracing::error!(event = "fatal_error", error = %format!("{e:#}"), "heron stopped");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
