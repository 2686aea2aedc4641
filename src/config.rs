use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Gateway settings. Loaded once at startup and shared read-only afterwards.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Address the push server listens on
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Shared secret expected in the `X-Token` header
    #[serde(default)]
    pub token: String,
    /// Base URL of the Telegram Bot API (or a self-hosted mirror)
    #[serde(default = "default_bot_api_addr")]
    pub bot_api_addr: String,
    #[serde(default)]
    pub bot_api_token: String,
}

/// Values coming from CLI flags or environment variables.
/// `None` leaves the file (or default) value untouched.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub addr: Option<String>,
    pub token: Option<String>,
    pub bot_api_addr: Option<String>,
    pub bot_api_token: Option<String>,
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_bot_api_addr() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            token: String::new(),
            bot_api_addr: default_bot_api_addr(),
            bot_api_token: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Build the effective configuration: defaults, then the optional file,
    /// then overrides. The result is validated before it is returned.
    pub fn resolve(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(addr) = overrides.addr {
            self.addr = addr;
        }
        if let Some(token) = overrides.token {
            self.token = token;
        }
        if let Some(api) = overrides.bot_api_addr {
            self.bot_api_addr = api;
        }
        if let Some(bot_token) = overrides.bot_api_token {
            self.bot_api_token = bot_token;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.addr.trim().is_empty() {
            bail!("listen address is empty");
        }
        if self.token.trim().is_empty() {
            bail!("push token is not set (use --token or TELEPUSH_TOKEN)");
        }
        if self.bot_api_token.trim().is_empty() {
            bail!("bot token is not set (use --bot-token or TELEPUSH_BOT_TOKEN)");
        }
        self.bot_api_url()?;
        Ok(())
    }

    pub fn bot_api_url(&self) -> Result<reqwest::Url> {
        reqwest::Url::parse(&self.bot_api_addr)
            .with_context(|| format!("Invalid bot API address: {}", self.bot_api_addr))
    }
}
