//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the hosted backend, e.g. `https://project.example.co`.
    pub backend_url: String,
    /// Public API key sent with every request.
    pub api_key: String,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_secs: u64,
    pub presence_poll_secs: u64,
    pub presence_freshness_secs: u64,
    pub typing_timeout_ms: u64,
    pub request_timeout_secs: u64,
    pub near_bottom_px: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            presence_poll_secs: 30,
            presence_freshness_secs: 120,
            typing_timeout_ms: 3000,
            request_timeout_secs: 30,
            near_bottom_px: 80.0,
        }
    }
}

impl ClientConfig {
    pub fn new(backend_url: &str, api_key: &str) -> Self {
        Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timing: TimingConfig::default(),
        }
    }

    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.backend_url)
    }

    pub fn storage_url(&self) -> String {
        format!("{}/storage/v1", self.backend_url)
    }

    pub fn realtime_url(&self) -> String {
        let ws = if let Some(rest) = self.backend_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.backend_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.backend_url.clone()
        };
        format!("{}/realtime/v1/websocket?apikey={}", ws, self.api_key)
    }
}

impl TimingConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn presence_poll(&self) -> Duration {
        Duration::from_secs(self.presence_poll_secs)
    }

    pub fn presence_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.presence_freshness_secs as i64)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
