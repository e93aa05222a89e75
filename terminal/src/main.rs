//! Rentroom Terminal Client
//!
//! Line-oriented chat between renters and landlords.

mod app;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Rentroom CLI
#[derive(Parser)]
#[command(name = "rentroom")]
#[command(about = "Chat with renters and landlords from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Backend base URL (overrides config.json)
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Public API key (overrides config.json)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Access token of the signed-in user
    #[arg(long, global = true)]
    access_token: Option<String>,

    /// Data directory for config and local storage
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use an in-process backend with a seeded conversation
    #[arg(long, global = true)]
    demo: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Remember who you are
    Login {
        user_id: String,

        #[arg(long)]
        email: Option<String>,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// renter or landlord
        #[arg(long)]
        role: Option<String>,
    },

    /// Forget the current user
    Logout,

    /// List conversations, most recent first
    Conversations,

    /// Open a conversation
    Chat { conversation_id: String },

    /// Cache a JSON array of listings for offline reads
    SyncListings { file: PathBuf },

    /// Print the cached listings
    Listings,

    /// Show or change preferences
    Prefs {
        #[arg(long)]
        theme: Option<String>,

        #[arg(long)]
        language: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "rentroom_terminal=info,rentroom_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rentroom")
    });
    std::fs::create_dir_all(&data_dir)?;
    tracing::debug!("Data directory: {:?}", data_dir);

    let mut config = config::AppConfig::load(&data_dir)?;
    config.apply_overrides(cli.backend_url, cli.api_key, cli.access_token);

    let client = app::build_client(&config, &data_dir, cli.demo).await?;

    match cli.command.unwrap_or(Commands::Conversations) {
        Commands::Login {
            user_id,
            email,
            name,
            role,
        } => app::login(&client, &user_id, email, name, role)?,
        Commands::Logout => {
            client.sign_out()?;
            println!("Signed out");
        }
        Commands::Conversations => app::list_conversations(&client).await?,
        Commands::Chat { conversation_id } => {
            app::chat(&client, &conversation_id, &config.ui).await?
        }
        Commands::SyncListings { file } => app::sync_listings(&client, &file)?,
        Commands::Listings => app::show_listings(&client)?,
        Commands::Prefs { theme, language } => app::preferences(&client, theme, language)?,
    }

    Ok(())
}
