use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub pdf: PdfConfig,
    #[serde(default)]
    pub cookies: CookieConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Identity backend (Supabase-compatible auth + REST).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    /// Base URL of the identity backend, e.g. `https://xyz.supabase.co`
    pub url: Option<String>,
    /// Public (anon) API key sent as `apikey` on every request
    pub anon_key: Option<String>,
}

/// Upstream ticketing webhooks the proxy routes forward to.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub events_url: Option<String>,
    pub tickets_url: Option<String>,
    pub customer_url: Option<String>,
    pub issuance_url: Option<String>,
    pub webhook_url: Option<String>,
    /// Transport-level timeout for forwarded requests in seconds (default: 90)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            events_url: None,
            tickets_url: None,
            customer_url: None,
            issuance_url: None,
            webhook_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    90
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuanceConfig {
    /// Wall-clock limit for a single issuance call in seconds (default: 60)
    #[serde(default = "default_issuance_timeout")]
    pub timeout_secs: u64,
    /// Age after which a resumed `processing` marker is considered abandoned (default: 30)
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,
}

impl IssuanceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_issuance_timeout(),
            staleness_secs: default_staleness(),
        }
    }
}

fn default_issuance_timeout() -> u64 {
    60
}

fn default_staleness() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PdfConfig {
    /// Optional status endpoint answering `{status: "ready"|"processing"}`.
    /// When unset the document URL itself is probed with HEAD.
    pub status_url: Option<String>,
    /// Maximum availability checks before opening anyway (default: 15)
    #[serde(default = "default_pdf_attempts")]
    pub max_attempts: u32,
    /// Delay between checks in milliseconds (default: 2000)
    #[serde(default = "default_pdf_delay")]
    pub retry_delay_ms: u64,
}

impl PdfConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            status_url: None,
            max_attempts: default_pdf_attempts(),
            retry_delay_ms: default_pdf_delay(),
        }
    }
}

fn default_pdf_attempts() -> u32 {
    15
}

fn default_pdf_delay() -> u64 {
    2000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CookieConfig {
    /// Mark session cookies `Secure` (enable behind HTTPS)
    #[serde(default)]
    pub secure: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse configuration file")?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Environment variables of the storefront deployment take precedence over the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |key: &str, slot: &mut Option<String>| {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = Some(value);
            }
        };

        pick("NEXT_PUBLIC_WEBHOOK_EVENTOS", &mut self.upstream.events_url);
        pick("NEXT_PUBLIC_WEBHOOK_INGRESSOS", &mut self.upstream.tickets_url);
        pick("NEXT_PUBLIC_WEBHOOK_CLIENTE", &mut self.upstream.customer_url);
        pick("NEXT_PUBLIC_WEBHOOK_EMISSAO", &mut self.upstream.issuance_url);
        pick("BOXOFFICE_WEBHOOK_INGRESSO", &mut self.upstream.webhook_url);
        pick("NEXT_PUBLIC_SUPABASE_URL", &mut self.identity.url);
        pick("NEXT_PUBLIC_SUPABASE_ANON_KEY", &mut self.identity.anon_key);
        pick("BOXOFFICE_PDF_STATUS_URL", &mut self.pdf.status_url);
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            identity: IdentityConfig::default(),
            upstream: UpstreamConfig::default(),
            issuance: IssuanceConfig::default(),
            pdf: PdfConfig::default(),
            cookies: CookieConfig::default(),
        }
    }
}
