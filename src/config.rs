//! Settings loaded from `flowrun.toml`.
//!
//! Values missing from the file fall back to defaults. `FLOWRUN_API_URL` and
//! `FLOWRUN_API_KEY` take precedence over the file.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

pub const CONFIG_FILE: &str = "flowrun.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Base URL of the orchestration API. Unset means an ephemeral in-memory orchestrator.
    #[serde(default)]
    pub api_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Backoff between RUNNING proposals while a run is held in PENDING.
    #[serde(default = "default_pending_poll_interval_ms")]
    pub pending_poll_interval_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_pending_poll_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            pending_poll_interval_ms: default_pending_poll_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    /// Load `flowrun.toml` from the current directory, or defaults if it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<Settings>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("FLOWRUN_API_URL")
            && !url.is_empty()
        {
            settings.api_url = Some(url);
        }
        if let Ok(key) = std::env::var("FLOWRUN_API_KEY")
            && !key.is_empty()
        {
            settings.api_key = Some(key);
        }

        Ok(settings)
    }

    pub fn pending_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pending_poll_interval_ms)
    }
}
