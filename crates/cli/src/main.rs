//! Anjia CLI, the main entry point.
//!
//! Commands:
//! - `serve`  Start the HTTP server
//! - `chat`   Run one advisor turn in-process and print its events
//! - `tools`  List the built-in tools
//! - `config` Show, validate or locate the configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "anjia",
    about = "Anjia: home-purchase advisor agent with live tool-calling",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind address
        #[arg(long)]
        host: Option<String>,
    },

    /// Send one message to the advisor and print the event stream
    Chat {
        /// The message to send
        #[arg(short, long)]
        message: String,

        /// Continue an existing conversation id
        #[arg(long)]
        conversation_id: Option<String>,

        /// Model round trips allowed for this turn
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Print raw events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// List the built-in tools and their parameters
    Tools,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (secrets redacted)
    Show,
    /// Load and validate the configuration
    Validate,
    /// Print the config file path
    Path,
    /// Print the default configuration as TOML
    Defaults,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { port, host } => commands::serve::run(port, host).await?,
        Commands::Chat {
            message,
            conversation_id,
            max_iterations,
            json,
        } => commands::chat::run(message, conversation_id, max_iterations, json).await?,
        Commands::Tools => commands::tools::run()?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show()?,
            ConfigAction::Validate => commands::config_cmd::validate()?,
            ConfigAction::Path => commands::config_cmd::path(),
            ConfigAction::Defaults => commands::config_cmd::defaults(),
        },
    }

    Ok(())
}
