use clap::Parser;
use lib_common::Credentials;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";
const DEFAULT_CHANNEL: &str = "app:notifications";
const DEFAULT_TOPIC: &str = "redis/bitcoin";
const DEFAULT_INTERVAL_MS: u64 = 5000;
const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TIER_PATH: &str = "/tier";
const DEFAULT_TIER_HOST: &str = "127.0.0.1";
const DEFAULT_TIER_PORT: u16 = 443;
const DEFAULT_TIER_USER: &str = "admin";
const DEFAULT_TIER_PASSWORD: &str = "password";
const DEFAULT_CURRENCIES: &str = "USD,GBP,EUR";
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Redis channel, price feed and topic tier bridge", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "BRIDGE_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "BRIDGE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "BRIDGE_REDIS_URL", help = "Redis connection URL.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "BRIDGE_CHANNEL_NAME", help = "Broker channel the bridge publishes to and relays from.")]
    pub channel_name: Option<String>,

    #[clap(long, env = "BRIDGE_TOPIC_PATH", help = "Secondary tier topic path.")]
    pub topic_path: Option<String>,

    #[clap(long, env = "BRIDGE_INTERVAL_MS", help = "Polling interval in milliseconds.")]
    pub interval_ms: Option<u64>,

    #[clap(long, env = "BRIDGE_SOURCE_URL", help = "URL of the polled price source.")]
    pub source_url: Option<String>,

    #[clap(long, env = "BRIDGE_SOURCE_TIMEOUT_MS", help = "Per-request timeout for the polled source.")]
    pub source_timeout_ms: Option<u64>,

    #[clap(long, env = "BRIDGE_TIER_ENABLED", help = "Attach the secondary topic tier (true/false).")]
    pub tier_enabled: Option<bool>,

    #[clap(long, env = "BRIDGE_TIER_PATH", help = "WebSocket path of the tier endpoint.")]
    pub tier_path: Option<String>,

    #[clap(long, env = "BRIDGE_TIER_HOST", help = "Secondary tier host.")]
    pub tier_host: Option<String>,

    #[clap(long, env = "BRIDGE_TIER_PORT", help = "Secondary tier port.")]
    pub tier_port: Option<u16>,

    #[clap(long, env = "BRIDGE_TIER_SECURE", help = "Connect to the tier over TLS (true/false).")]
    pub tier_secure: Option<bool>,

    #[clap(long, env = "BRIDGE_TIER_USER", help = "Secondary tier principal.")]
    pub tier_user: Option<String>,

    #[clap(long, env = "BRIDGE_TIER_PASSWORD", help = "Secondary tier credential.")]
    pub tier_password: Option<String>,

    #[clap(long, env = "BRIDGE_CURRENCIES", help = "Comma-separated currency codes to log.")]
    pub currencies: Option<String>,

    #[clap(long, env = "BRIDGE_STATS_INTERVAL_SECS", help = "Seconds between statistics log lines.")]
    pub stats_interval_secs: Option<u64>,

    #[clap(long, env = "BRIDGE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "BRIDGE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error, off).")]
    pub log_level: Option<String>,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub redis_url: String,
    pub channel_name: String,
    pub topic_path: String,
    pub interval: Duration,
    pub source_url: String,
    pub source_timeout: Duration,
    pub tier_enabled: bool,
    pub tier_path: String,
    pub credentials: Credentials,
    pub currencies: Vec<String>,
    pub stats_interval: Duration,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            redis_url: other.redis_url.or(self.redis_url),
            channel_name: other.channel_name.or(self.channel_name),
            topic_path: other.topic_path.or(self.topic_path),
            interval_ms: other.interval_ms.or(self.interval_ms),
            source_url: other.source_url.or(self.source_url),
            source_timeout_ms: other.source_timeout_ms.or(self.source_timeout_ms),
            tier_enabled: other.tier_enabled.or(self.tier_enabled),
            tier_path: other.tier_path.or(self.tier_path),
            tier_host: other.tier_host.or(self.tier_host),
            tier_port: other.tier_port.or(self.tier_port),
            tier_secure: other.tier_secure.or(self.tier_secure),
            tier_user: other.tier_user.or(self.tier_user),
            tier_password: other.tier_password.or(self.tier_password),
            currencies: other.currencies.or(self.currencies),
            stats_interval_secs: other.stats_interval_secs.or(self.stats_interval_secs),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    fn defaults(port: u16) -> Config {
        Config {
            port: Some(port),
            redis_url: Some(DEFAULT_REDIS_URL.to_string()),
            channel_name: Some(DEFAULT_CHANNEL.to_string()),
            topic_path: Some(DEFAULT_TOPIC.to_string()),
            interval_ms: Some(DEFAULT_INTERVAL_MS),
            source_url: Some(lib_common::retrieve::coindesk::DEFAULT_URL.to_string()),
            source_timeout_ms: Some(DEFAULT_SOURCE_TIMEOUT_MS),
            tier_enabled: Some(true),
            tier_path: Some(DEFAULT_TIER_PATH.to_string()),
            tier_host: Some(DEFAULT_TIER_HOST.to_string()),
            tier_port: Some(DEFAULT_TIER_PORT),
            tier_secure: Some(true),
            tier_user: Some(DEFAULT_TIER_USER.to_string()),
            tier_password: Some(DEFAULT_TIER_PASSWORD.to_string()),
            currencies: Some(DEFAULT_CURRENCIES.to_string()),
            stats_interval_secs: Some(DEFAULT_STATS_INTERVAL_SECS),
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            config_path: None,
        }
    }

    /// Fills every unset option from the built-in defaults.
    pub fn into_settings(self, default_port: u16) -> Settings {
        let currencies = self
            .currencies
            .as_deref()
            .unwrap_or(DEFAULT_CURRENCIES)
            .split(',')
            .map(|code| code.trim().to_uppercase())
            .filter(|code| !code.is_empty())
            .collect();

        Settings {
            port: self.port.unwrap_or(default_port),
            redis_url: self.redis_url.unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            channel_name: self.channel_name.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            topic_path: self.topic_path.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            interval: Duration::from_millis(self.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS)),
            source_url: self
                .source_url
                .unwrap_or_else(|| lib_common::retrieve::coindesk::DEFAULT_URL.to_string()),
            source_timeout: Duration::from_millis(self.source_timeout_ms.unwrap_or(DEFAULT_SOURCE_TIMEOUT_MS)),
            tier_enabled: self.tier_enabled.unwrap_or(true),
            tier_path: self.tier_path.unwrap_or_else(|| DEFAULT_TIER_PATH.to_string()),
            credentials: Credentials {
                host: self.tier_host.unwrap_or_else(|| DEFAULT_TIER_HOST.to_string()),
                principal: self.tier_user.unwrap_or_else(|| DEFAULT_TIER_USER.to_string()),
                credential: self.tier_password.unwrap_or_else(|| DEFAULT_TIER_PASSWORD.to_string()),
                port: self.tier_port.unwrap_or(DEFAULT_TIER_PORT),
                secure: self.tier_secure.unwrap_or(true),
            },
            currencies,
            stats_interval: Duration::from_secs(self.stats_interval_secs.unwrap_or(DEFAULT_STATS_INTERVAL_SECS).max(1)),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            log_level: self.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        }
    }
}

/// The config file to read: the explicit path if one was given, otherwise
/// `<app>.conf` in the working directory, otherwise the same name under the
/// user config directory.
fn config_file_path(explicit: Option<&Path>, app: &str) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let local = PathBuf::from(format!("{}.conf", app));
    if local.exists() {
        return local;
    }
    match dirs::config_dir() {
        Some(dir) => {
            let user = dir.join(app).join(format!("{}.conf", app));
            if user.exists() { user } else { local }
        }
        None => local,
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the config file and the already-parsed CLI/env options.
pub fn layer_config(cli: Config, app: &str, default_port: u16) -> Config {
    // 1. Defaults
    let mut current_config = Config::defaults(default_port);

    // 2. Config file, located through the CLI override if there is one
    let path = config_file_path(cli.config_path.as_deref(), app);
    if let Some(file_config) = read_config_file(&path) {
        current_config = current_config.merge(file_config);
    }

    // 3. Environment variables and CLI arguments win
    current_config.merge(cli)
}

/// Loads the configuration for the binary `app`.
pub fn load_config(app: &str, default_port: u16) -> Settings {
    layer_config(Config::parse(), app, default_port).into_settings(default_port)
}
