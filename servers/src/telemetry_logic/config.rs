use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_telemetry::FanoutConfig;

const DEFAULT_CONFIG_FILE: &str = "server_telemetry.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Telemetry fan-out gateway (HTTP ingestion, WebSocket delivery)", version)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[clap(long, env = "TELEMETRY_PORT", help = "Port to listen on for devices and clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "TELEMETRY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "REDIS_URL", help = "Shared Redis store. The in-memory store is used when absent.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "TELEMETRY_STALE_TIMEOUT_SECONDS", help = "Seconds without client activity before a connection is evicted.")]
    pub stale_timeout_seconds: Option<u64>,

    #[clap(long, env = "TELEMETRY_CLEANUP_INTERVAL_SECONDS", help = "Interval in seconds between stale-connection and store sweeps.")]
    pub cleanup_interval_seconds: Option<u64>,

    #[clap(long, env = "TELEMETRY_DEVICE_ONLINE_SECONDS", help = "Seconds since a device was last heard before it is reported offline.")]
    pub device_online_seconds: Option<u64>,

    #[clap(long, env = "TELEMETRY_DEVICE_RETENTION_SECONDS", help = "Seconds of silence before a device is forgotten. Defaults to ten online windows.")]
    pub device_retention_seconds: Option<u64>,

    #[clap(long, env = "TELEMETRY_INSTANCE_ID", help = "Scopes pending batches to this instance on a shared store. Generated when a redis URL is set.")]
    pub instance_id: Option<String>,

    #[clap(long, env = "TELEMETRY_BURST_RATE", help = "Readings allowed per device in the burst window.")]
    pub burst_rate: Option<u64>,

    #[clap(long, env = "TELEMETRY_BURST_PERIOD_SECONDS", help = "Length of the burst window in seconds.")]
    pub burst_period_seconds: Option<u64>,

    #[clap(long, env = "TELEMETRY_SUSTAINED_RATE", help = "Readings allowed per device in the sustained window.")]
    pub sustained_rate: Option<u64>,

    #[clap(long, env = "TELEMETRY_SUSTAINED_PERIOD_SECONDS", help = "Length of the sustained window in seconds.")]
    pub sustained_period_seconds: Option<u64>,

    #[clap(long, env = "TELEMETRY_DEBOUNCE_INTERVAL_MS", help = "Delay in milliseconds between the first buffered update and its broadcast.")]
    pub debounce_interval_ms: Option<u64>,

    #[clap(long, env = "TELEMETRY_MARKER_TTL_SECONDS", help = "Lifetime of a pending-flush marker in seconds.")]
    pub marker_ttl_seconds: Option<u64>,

    #[clap(long, env = "TELEMETRY_BATCH_TTL_SECONDS", help = "Lifetime of an untouched pending batch in seconds.")]
    pub batch_ttl_seconds: Option<u64>,

    #[clap(long, env = "TELEMETRY_KEY_PREFIX", help = "Namespace of every store key.")]
    pub key_prefix: Option<String>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Values set in `other` win.
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_url: other.redis_url.or(self.redis_url),
            stale_timeout_seconds: other.stale_timeout_seconds.or(self.stale_timeout_seconds),
            cleanup_interval_seconds: other
                .cleanup_interval_seconds
                .or(self.cleanup_interval_seconds),
            device_online_seconds: other.device_online_seconds.or(self.device_online_seconds),
            device_retention_seconds: other
                .device_retention_seconds
                .or(self.device_retention_seconds),
            instance_id: other.instance_id.or(self.instance_id),
            burst_rate: other.burst_rate.or(self.burst_rate),
            burst_period_seconds: other.burst_period_seconds.or(self.burst_period_seconds),
            sustained_rate: other.sustained_rate.or(self.sustained_rate),
            sustained_period_seconds: other
                .sustained_period_seconds
                .or(self.sustained_period_seconds),
            debounce_interval_ms: other.debounce_interval_ms.or(self.debounce_interval_ms),
            marker_ttl_seconds: other.marker_ttl_seconds.or(self.marker_ttl_seconds),
            batch_ttl_seconds: other.batch_ttl_seconds.or(self.batch_ttl_seconds),
            key_prefix: other.key_prefix.or(self.key_prefix),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        let fanout = FanoutConfig::default();
        Config {
            port: Some(9003),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            stale_timeout_seconds: Some(90),
            cleanup_interval_seconds: Some(30),
            device_online_seconds: Some(120),
            burst_rate: Some(fanout.burst_rate),
            burst_period_seconds: Some(fanout.burst_period_seconds),
            sustained_rate: Some(fanout.sustained_rate),
            sustained_period_seconds: Some(fanout.sustained_period_seconds),
            debounce_interval_ms: Some(fanout.debounce_interval_ms),
            marker_ttl_seconds: Some(fanout.marker_ttl_seconds),
            batch_ttl_seconds: Some(fanout.batch_ttl_seconds),
            key_prefix: Some(fanout.key_prefix),
            ..Default::default()
        }
    }

    /// Core tunables, falling back to library defaults field by field.
    pub fn fanout(&self) -> FanoutConfig {
        let d = FanoutConfig::default();
        FanoutConfig {
            burst_rate: self.burst_rate.unwrap_or(d.burst_rate),
            burst_period_seconds: self.burst_period_seconds.unwrap_or(d.burst_period_seconds),
            sustained_rate: self.sustained_rate.unwrap_or(d.sustained_rate),
            sustained_period_seconds: self
                .sustained_period_seconds
                .unwrap_or(d.sustained_period_seconds),
            debounce_interval_ms: self.debounce_interval_ms.unwrap_or(d.debounce_interval_ms),
            marker_ttl_seconds: self.marker_ttl_seconds.unwrap_or(d.marker_ttl_seconds),
            batch_ttl_seconds: self.batch_ttl_seconds.unwrap_or(d.batch_ttl_seconds),
            key_prefix: self.key_prefix.clone().unwrap_or(d.key_prefix),
            instance_id: self.instance_id.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(9003)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_seconds.unwrap_or(90))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.unwrap_or(30).max(1))
    }

    pub fn device_online_window(&self) -> Duration {
        Duration::from_secs(self.device_online_seconds.unwrap_or(120))
    }

    pub fn device_retention(&self) -> Duration {
        match self.device_retention_seconds {
            Some(seconds) => Duration::from_secs(seconds),
            None => self.device_online_window().saturating_mul(10),
        }
    }
}

/// Reads a JSON config file. Problems are logged and yield `None` so the
/// server can still start from the other sources.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return None;
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Failed to read config file {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&text) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
            None
        }
    }
}

/// Merges defaults, then the config file, then environment and CLI values.
pub fn resolve(cli: Config) -> Config {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = Config::defaults();
    if let Some(file_config) = read_config_file(&path) {
        config = config.merge(file_config);
    }
    config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_overrides_defaults_and_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "port": 7000, "burstRate": 10, "redisUrl": "redis://cache/" }}"#
        )
        .unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            burst_rate: Some(20),
            ..Default::default()
        };
        let config = resolve(cli);

        assert_eq!(config.port(), 7000);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache/"));
        let fanout = config.fanout();
        assert_eq!(fanout.burst_rate, 20);
        assert_eq!(fanout.sustained_rate, 200);
        assert!(fanout.validate().is_ok());
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let config = resolve(Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        });
        assert_eq!(config.port(), 9003);
        assert_eq!(config.fanout(), FanoutConfig::default());
        assert_eq!(config.device_retention(), Duration::from_secs(1200));
    }
}
