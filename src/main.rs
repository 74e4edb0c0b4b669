//! Nexus CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;

use nexus::cli::{commands, Cli, Commands};
use nexus::infrastructure::config::ConfigLoader;
use nexus::infrastructure::logging::Logger;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load().context("Failed to load configuration")?;
    let _logger = Logger::init(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Serve => commands::handle_serve(config).await,
        Commands::Submit {
            objective,
            complexity,
            max_agents,
            company,
            app,
            timeout_ms,
            thread_id,
        } => {
            commands::handle_submit(
                config,
                objective,
                &complexity,
                max_agents,
                company,
                app,
                timeout_ms,
                thread_id,
                cli.json,
            )
            .await
        }
        Commands::Status { task_id } => commands::handle_status(config, task_id, cli.json).await,
        Commands::Cancel { task_id } => commands::handle_cancel(config, task_id).await,
        Commands::Models { include_free } => {
            commands::handle_models(config, include_free, cli.json).await
        }
    }
}
