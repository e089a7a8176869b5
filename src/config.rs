use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_COMPANY: &str = "public";

/// Settings for the widget loader itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Origin hosting `config/`, `wids/` and `chat.html`. Also the trusted
    /// origin for sub-application messages.
    pub base_url: Url,
    /// Root of the real-time database holding per-bot appearance.
    pub appearance_url: Url,
    pub default_company: String,
    pub fetch_timeout: Duration,
    pub frame_load_timeout: Duration,
    pub close_fallback: Duration,
    pub handshake_timeout: Duration,
    pub cache_dir: PathBuf,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let base_url = Url::parse(DEFAULT_BASE_URL).expect("default base url is valid");
        Self {
            appearance_url: base_url.clone(),
            base_url,
            default_company: DEFAULT_COMPANY.to_string(),
            fetch_timeout: Duration::from_secs(10),
            frame_load_timeout: Duration::from_secs(5),
            close_fallback: Duration::from_millis(300),
            handshake_timeout: Duration::from_secs(30),
            cache_dir: PathBuf::from(".widget-cache"),
        }
    }
}

impl LoaderConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let base_url = match std::env::var("WIDGET_BASE_URL") {
            Ok(raw) => Url::parse(&raw).context("failed to parse WIDGET_BASE_URL")?,
            Err(_) => defaults.base_url,
        };
        let appearance_url = match std::env::var("WIDGET_APPEARANCE_URL") {
            Ok(raw) => Url::parse(&raw).context("failed to parse WIDGET_APPEARANCE_URL")?,
            Err(_) => base_url.clone(),
        };
        let default_company = std::env::var("WIDGET_DEFAULT_COMPANY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.default_company);
        let cache_dir = std::env::var("WIDGET_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        Ok(Self {
            base_url,
            appearance_url,
            default_company,
            fetch_timeout: duration_ms_from_env("WIDGET_FETCH_TIMEOUT_MS")
                .unwrap_or(defaults.fetch_timeout),
            frame_load_timeout: duration_ms_from_env("WIDGET_FRAME_LOAD_TIMEOUT_MS")
                .unwrap_or(defaults.frame_load_timeout),
            close_fallback: duration_ms_from_env("WIDGET_CLOSE_FALLBACK_MS")
                .unwrap_or(defaults.close_fallback),
            handshake_timeout: duration_ms_from_env("WIDGET_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(defaults.handshake_timeout),
            cache_dir,
        })
    }

    /// Origin string the message bus trusts.
    pub fn trusted_origin(&self) -> String {
        self.base_url.origin().ascii_serialization()
    }
}

/// Settings for the dev host that serves the widget's static contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub bind_addr: SocketAddr,
    pub config_root: PathBuf,
    pub asset_root: PathBuf,
    pub enable_cors: bool,
}

impl HostConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("failed to parse BIND_ADDR")?;

        let config_root = PathBuf::from(
            std::env::var("WIDGET_CONFIG_ROOT").unwrap_or_else(|_| "config".to_string()),
        );
        let asset_root = PathBuf::from(
            std::env::var("WIDGET_ASSET_ROOT").unwrap_or_else(|_| "assets".to_string()),
        );

        // Embedding pages live on foreign origins, so CORS is on unless disabled.
        let enable_cors = std::env::var("ENABLE_CORS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Ok(Self {
            bind_addr,
            config_root,
            asset_root,
            enable_cors,
        })
    }
}

fn duration_ms_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_origin_drops_path_and_default_port() {
        let cfg = LoaderConfig {
            base_url: Url::parse("https://widgets.example:443/embed/").unwrap(),
            ..LoaderConfig::default()
        };
        assert_eq!(cfg.trusted_origin(), "https://widgets.example");
    }
}
