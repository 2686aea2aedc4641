mod bot;
mod config;
mod dispatch;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::TelegramBot;
use crate::config::{Config, Overrides};
use crate::server::AppState;

/// Telegram Bot push tool
#[derive(Parser, Debug)]
#[command(name = "telepush", version, about)]
struct Cli {
    /// Optional TOML settings file
    #[arg(long, env = "TELEPUSH_CONFIG")]
    config: Option<PathBuf>,

    /// Server listen address
    #[arg(long, env = "TELEPUSH_ADDRESS")]
    addr: Option<String>,

    /// Server push token
    #[arg(long, env = "TELEPUSH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Telegram api address
    #[arg(long, env = "TELEPUSH_BOT_API")]
    bot_api: Option<String>,

    /// Telegram api token
    #[arg(long, env = "TELEPUSH_BOT_TOKEN", hide_env_values = true)]
    bot_token: Option<String>,

    /// Write the resolved settings to this file and exit
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            addr: self.addr.clone(),
            token: self.token.clone(),
            bot_api_addr: self.bot_api.clone(),
            bot_api_token: self.bot_token.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,telepush=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::resolve(cli.config.as_deref(), cli.overrides())
        .context("Failed to load configuration")?;

    if let Some(path) = &cli.write_config {
        config.write_to(path)?;
        info!("Configuration written to {}", path.display());
        return Ok(());
    }

    info!("Configuration loaded successfully");
    info!("  Listen address: {}", config.addr);
    info!("  Bot API: {}", config.bot_api_addr);

    let bot = TelegramBot::connect(&config).await?;
    info!("Telegram Bot init success...");

    tokio::spawn(bot.clone().run_id_listener());

    let state = AppState::new(config, Arc::new(bot));
    server::serve(state).await
}
