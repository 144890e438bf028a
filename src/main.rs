use anyhow::Result;
use tracing::{error, info};

mod broker;
mod browser;
mod cli;
mod control;
mod crawler;
mod source;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Services always keep a log file
    let log_file = match &args.log_file {
        Some(path) => Some(path.clone()),
        None if args.is_service() => Some(utils::default_log_file()),
        None => None,
    };
    utils::init_logging(args.verbose, log_file)?;

    info!("Starting novel-agent v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
