//! ipafetch CLI - acquire licensed packages and download them
//!
//! A thin operator surface over `ipafetch-core`: accounts, version lookup,
//! downloads with live progress, and settings.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ipafetch - storefront package downloader
#[derive(Parser)]
#[command(name = "ipafetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for ipafetch
    #[arg(long, env = "IPAFETCH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage storefront accounts
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// List historical versions of an item
    Versions {
        /// Storefront item id
        item_id: String,
    },

    /// Acquire an item and download it
    Download {
        /// Storefront item id
        item_id: String,

        /// Account id to acquire with
        #[arg(short, long)]
        account: String,

        /// External version id (see `versions`); latest when omitted
        #[arg(long = "version-id")]
        version_id: Option<String>,

        /// Queue the download and return without waiting
        #[arg(short, long)]
        detach: bool,
    },

    /// Download everything still pending from earlier runs
    Run,

    /// List downloads
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show download info
    Info {
        /// Download key (`bundle` or `bundle@version`)
        key: String,
    },

    /// Resume a paused download
    Resume {
        /// Download key
        key: String,
    },

    /// Retry a failed download
    Retry {
        /// Download key
        key: String,
    },

    /// Cancel a download and discard partial data
    Cancel {
        /// Download key
        key: String,
    },

    /// Delete a completed download and its files
    Delete {
        /// Download key
        key: String,
    },

    /// Delete every download and every file
    Clear {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    /// List accounts
    List,

    /// Register an account
    Add {
        /// Account e-mail (display only)
        #[arg(long)]
        email: String,

        /// Directory services identifier
        #[arg(long)]
        dsid: String,

        /// Storefront code, e.g. 143441-1,29
        #[arg(long)]
        store_front: String,
    },

    /// Remove an account
    Remove {
        /// Account id
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Progress bars own the terminal, so only warnings unless asked otherwise
    let default_filter = if cli.verbose {
        "ipafetch_core=debug,info"
    } else {
        "warn"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "ipafetch", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("ipafetch"))
            .unwrap_or_else(|| PathBuf::from(".ipafetch"))
    });

    debug!("Using data directory {:?}", data_dir);

    // Initialize core
    let core = ipafetch_core::Ipafetch::new(data_dir).await?;

    // Execute command
    match cli.command {
        Commands::Account { action } => commands::account_action(&core, action, cli.output).await?,

        Commands::Versions { item_id } => {
            commands::list_versions(&core, &item_id, cli.output).await?
        }

        Commands::Download {
            item_id,
            account,
            version_id,
            detach,
        } => {
            commands::download(&core, &item_id, &account, version_id, detach, cli.output).await?
        }

        Commands::Run => commands::run_pending(&core, cli.output).await?,

        Commands::List { status, all } => {
            commands::list_downloads(&core, status, all, cli.output).await?
        }

        Commands::Info { key } => commands::show_info(&core, &key, cli.output).await?,

        Commands::Resume { key } => commands::resume_download(&core, &key, cli.output).await?,

        Commands::Retry { key } => commands::retry_download(&core, &key, cli.output).await?,

        Commands::Cancel { key } => commands::cancel_download(&core, &key, cli.output).await?,

        Commands::Delete { key } => commands::delete_download(&core, &key, cli.output).await?,

        Commands::Clear { yes } => commands::clear_downloads(&core, yes, cli.output).await?,

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}
