use eyre::{eyre, Result};
use serde::Deserialize;
use std::{fs, path::Path};

use crate::pool::PoolOptions;

/// Gateway configuration, loaded from a JSON file (default `gateway.json`).
///
/// We intentionally keep this loose: extra fields are ignored so the same
/// file can carry settings for the companion capture/compression utility.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Prefix used to build the upstream streaming URL, e.g.
    /// `https://generativelanguage.googleapis.com/v1beta/models/`.
    pub base_url: String,

    /// Ordered list of selectable model names. The first entry is the
    /// default when a stream request does not name one.
    pub models: Vec<String>,

    /// Text prepended to the first user turn of a fresh conversation.
    #[serde(default)]
    pub base_prompt: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Default suspension duration for keys that hit a recoverable error.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,

    /// Per-key request cap over the trailing minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: i64,

    /// Per-key request cap over the trailing 24 hours.
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: i64,

    /// Consecutive free-tier failures before acquisition targets paid keys.
    #[serde(default = "default_max_free_key_failures")]
    pub max_free_key_failures: i64,

    /// Image compression threshold in KiB. Consumed by the external capture
    /// utility, not by the gateway itself; kept so the shared config file
    /// round-trips.
    #[serde(default = "default_threshold_kb")]
    #[allow(dead_code)]
    pub threshold_kb: u64,
}

fn default_port() -> u16 {
    5000
}

fn default_cooldown_seconds() -> i64 {
    300
}

fn default_requests_per_minute() -> i64 {
    5
}

fn default_requests_per_day() -> i64 {
    100
}

fn default_max_free_key_failures() -> i64 {
    6
}

fn default_threshold_kb() -> u64 {
    3600
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read config file {}: {e}", path.display()))?;
        let cfg: GatewayConfig = serde_json::from_str(&raw)
            .map_err(|e| eyre!("failed to parse config file {}: {e}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(eyre!("base_url must not be empty"));
        }
        if self.models.is_empty() {
            return Err(eyre!("models must list at least one model name"));
        }
        if self.requests_per_minute <= 0 {
            return Err(eyre!("requests_per_minute must be > 0"));
        }
        if self.requests_per_day <= 0 {
            return Err(eyre!("requests_per_day must be > 0"));
        }
        if self.max_free_key_failures <= 0 {
            return Err(eyre!("max_free_key_failures must be > 0"));
        }
        if self.cooldown_seconds <= 0 {
            return Err(eyre!("cooldown_seconds must be > 0"));
        }

        if !self.base_url.ends_with('/') {
            // The upstream URL is built by plain concatenation; a missing
            // trailing slash almost always yields a 404 on the first call.
            tracing::warn!(base_url = %self.base_url, "base_url does not end with '/'");
        }

        Ok(())
    }

    pub fn default_model(&self) -> &str {
        &self.models[0]
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            cooldown_seconds: self.cooldown_seconds,
            requests_per_minute: self.requests_per_minute,
            requests_per_day: self.requests_per_day,
            max_free_key_failures: self.max_free_key_failures,
        }
    }
}
