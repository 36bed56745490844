//! toolchat: chat with models over a managed set of MCP tool servers

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use toolchat::commands::{self, AddServer, Lifecycle};

#[derive(Debug, Parser)]
#[command(name = "toolchat")]
#[command(about = "Chat with language models using MCP tool servers", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage tool servers
    Servers {
        #[command(subcommand)]
        action: ServerAction,
    },

    /// Check whether an MCP endpoint is ready and list its tools
    Probe {
        url: String,

        /// Request header as KEY=VALUE
        #[arg(long = "header")]
        headers: Vec<String>,
    },

    /// Run one chat turn with the tools of every active server
    Chat {
        /// The prompt to send
        #[arg(required = true)]
        prompt: Vec<String>,

        /// Model to use (overrides config)
        #[arg(short, long)]
        model: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ServerAction {
    /// List configured servers
    List,
    /// Add a remote or local-command server
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        description: Option<String>,

        /// Remote endpoint URL
        #[arg(long, conflicts_with = "command", required_unless_present = "command")]
        url: Option<String>,

        /// Request header as KEY=VALUE (remote servers)
        #[arg(long = "header", requires = "url")]
        headers: Vec<String>,

        /// Executable to run inside a sandbox
        #[arg(long)]
        command: Option<String>,

        /// Argument for the executable, repeatable
        #[arg(long = "arg", requires = "command", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Environment variable as KEY=VALUE (local servers)
        #[arg(long, requires = "command")]
        env: Vec<String>,
    },
    /// Remove a server, stopping it first
    Remove { id: String },
    /// Replace the active set
    Activate { ids: Vec<String> },
    /// Import servers from an mcp.json document
    Import { path: PathBuf },
    /// Start a server
    Start { id: String },
    /// Stop a server
    Stop { id: String },
    /// Restart a running server
    Restart { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over the defaults
    let default = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Servers { action } => match action {
            ServerAction::List => commands::servers_list().await,
            ServerAction::Add {
                name,
                description,
                url,
                headers,
                command,
                args,
                env,
            } => {
                commands::servers_add(AddServer {
                    name,
                    description,
                    url,
                    headers,
                    command,
                    args,
                    env,
                })
                .await
            }
            ServerAction::Remove { id } => commands::servers_remove(&id).await,
            ServerAction::Activate { ids } => commands::servers_activate(&ids).await,
            ServerAction::Import { path } => commands::servers_import(&path).await,
            ServerAction::Start { id } => commands::servers_lifecycle(&id, Lifecycle::Start).await,
            ServerAction::Stop { id } => commands::servers_lifecycle(&id, Lifecycle::Stop).await,
            ServerAction::Restart { id } => {
                commands::servers_lifecycle(&id, Lifecycle::Restart).await
            }
        },
        Commands::Probe { url, headers } => commands::probe(&url, &headers).await,
        Commands::Chat { prompt, model } => commands::chat(&prompt.join(" "), model).await,
    }
}
