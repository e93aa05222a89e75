//! Configuration management for the Rentroom terminal client

use rentroom_core::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: ClientConfig,
    /// Bearer token of the signed-in user; the API key alone only reaches public rows.
    pub access_token: Option<String>,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Entries printed when a conversation is opened.
    pub history: usize,
    pub show_timestamps: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            history: 30,
            show_timestamps: true,
        }
    }
}

impl AppConfig {
    /// Reads `config.json`, writing the defaults on first run.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(data_dir)?;
            tracing::info!("Created default config at {:?}", config_path);
            Ok(config)
        }
    }

    pub fn save(&self, data_dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let config_path = data_dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Command line values win over the file.
    pub fn apply_overrides(
        &mut self,
        backend_url: Option<String>,
        api_key: Option<String>,
        access_token: Option<String>,
    ) {
        if let Some(url) = backend_url {
            self.backend.backend_url = url.trim_end_matches('/').to_string();
        }
        if let Some(key) = api_key {
            self.backend.api_key = key;
        }
        if access_token.is_some() {
            self.access_token = access_token;
        }
    }
}
