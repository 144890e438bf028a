pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::AgentConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to agent.yaml in the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: consume broker tasks until Ctrl-C
    Run,

    /// Publish one task to the broker
    Publish {
        /// Source the task targets
        #[arg(short, long, default_value = "sangtacviet")]
        source: String,

        /// Task type (book, chapter, session)
        #[arg(short, long)]
        kind: String,

        /// Book, chapter or session URL
        #[arg(required = true)]
        url: String,
    },

    /// Crawl from a seed URL until the frontier is drained
    Crawl {
        /// URL to start crawling from
        #[arg(required = true)]
        url: String,

        /// Maximum crawling depth
        #[arg(short, long)]
        depth: Option<u32>,

        /// Directory to save fetched pages in
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Log in to a source in a visible browser and save the session
    Login {
        #[arg(short, long, default_value = "sangtacviet")]
        source: String,
    },

    /// Show the effective configuration
    Config,
}

impl Cli {
    /// Whether the command runs as a long-lived service
    pub fn is_service(&self) -> bool {
        matches!(self.command, Commands::Run)
    }
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = AgentConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            info!("Starting agent");
            commands::run(config).await
        }
        Commands::Publish { source, kind, url } => {
            info!("Publishing {} task for {}", kind, url);
            commands::publish(config, &source, &kind, &url).await
        }
        Commands::Crawl { url, depth, output } => {
            info!("Starting crawl on {}", url);
            commands::crawl(config, &url, depth, output).await
        }
        Commands::Login { source } => {
            info!("Logging in to {}", source);
            commands::login(config, &source).await
        }
        Commands::Config => commands::show_config(&config),
    }
}
