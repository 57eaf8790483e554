//! llamachat - chat with a llama.cpp server
//!
#![doc = "llamachat - chat with a llama.cpp server"]
#![doc = "Main entry point for the llamachat application."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use llamachat::cli::{Cli, Commands};
use llamachat::commands;
use llamachat::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Chat {
            conversation,
            folder,
            temperature,
        } => {
            tracing::info!("Starting interactive chat");
            if let Some(c) = &conversation {
                tracing::debug!("Resuming conversation: {}", c);
            }
            if let Some(f) = &folder {
                tracing::debug!("New conversation in folder: {}", f);
            }

            commands::chat::run_chat(config, conversation, folder, temperature).await?;
            Ok(())
        }
        Commands::History { command } => {
            tracing::debug!("Starting history command");
            commands::history::handle_history(&config, command)?;
            Ok(())
        }
        Commands::Folder { command } => {
            tracing::debug!("Starting folder command");
            commands::folders::handle_folder(&config, command)?;
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
///
/// Logs go to stderr so `--json` output stays parseable.
fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "llamachat=debug"
    } else {
        "llamachat=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
