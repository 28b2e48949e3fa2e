use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::certs::CertificateBundle;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_MQTT_HOST: &str = "localhost";
const DEFAULT_MQTT_PORT: u16 = 8883;
const DEFAULT_BASE_TOPIC: &str = "/client_id/api";
const DEFAULT_CLIENT_ID_PREFIX: &str = "mqtt-bridge";
const DEFAULT_CERT_DIR: &str = "certs";
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_DISCONNECT_TIMEOUT_SECS: u64 = 5;
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct BridgeConfigFile {
    http_addr: Option<String>,
    broker: Option<BrokerConfigFile>,
    certificates: Option<CertificatesConfigFile>,
    disconnect_timeout_secs: Option<u64>,
    autoconnect: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct BrokerConfigFile {
    host: Option<String>,
    port: Option<u16>,
    base_topic: Option<String>,
    client_id_prefix: Option<String>,
    keep_alive_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CertificatesConfigFile {
    dir: Option<PathBuf>,
}

/// Broker endpoint and session identity. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Generated once per process; never user-supplied.
    pub client_id: String,
    /// Topic template containing the `client_id` placeholder.
    pub base_topic: String,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub http_addr: String,
    pub broker: BrokerConfig,
    pub cert_dir: PathBuf,
    pub certificates: CertificateBundle,
    pub disconnect_timeout: Duration,
    pub autoconnect: bool,
}

impl BridgeConfig {
    /// Load from the file named by `MQTT_BRIDGE_CONFIG` (if any), then apply env
    /// overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MQTT_BRIDGE_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => read_config_file(path)?,
            None => BridgeConfigFile::default(),
        };
        let mut settings = Settings::from_file(file_cfg);
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings.finish())
    }
}

/// Mutable staging area between the file, the environment and the final config.
struct Settings {
    http_addr: String,
    host: String,
    port: u16,
    base_topic: String,
    client_id_prefix: String,
    keep_alive_secs: u64,
    cert_dir: PathBuf,
    disconnect_timeout_secs: u64,
    autoconnect: bool,
}

impl Settings {
    fn from_file(file: BridgeConfigFile) -> Self {
        let broker = file.broker.unwrap_or_default();
        Self {
            http_addr: file
                .http_addr
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            host: broker
                .host
                .unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
            port: broker.port.unwrap_or(DEFAULT_MQTT_PORT),
            base_topic: broker
                .base_topic
                .unwrap_or_else(|| DEFAULT_BASE_TOPIC.to_string()),
            client_id_prefix: broker
                .client_id_prefix
                .unwrap_or_else(|| DEFAULT_CLIENT_ID_PREFIX.to_string()),
            keep_alive_secs: broker.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            cert_dir: file
                .certificates
                .and_then(|certs| certs.dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_DIR)),
            disconnect_timeout_secs: file
                .disconnect_timeout_secs
                .unwrap_or(DEFAULT_DISCONNECT_TIMEOUT_SECS),
            autoconnect: file.autoconnect.unwrap_or(true),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("BRIDGE_HTTP_ADDR") {
            self.http_addr = addr;
        }
        if let Some(host) = env_value("MQTT_HOST") {
            self.host = host;
        }
        if let Some(port) = env_value("MQTT_PORT") {
            self.port = port
                .parse()
                .map_err(|_| anyhow!("MQTT_PORT must be a port number, got '{}'", port))?;
        }
        if let Some(topic) = env_value("MQTT_BASE_TOPIC") {
            self.base_topic = topic;
        }
        if let Some(prefix) = env_value("MQTT_CLIENT_ID_PREFIX") {
            self.client_id_prefix = prefix;
        }
        if let Some(secs) = env_value("MQTT_KEEP_ALIVE_SECS") {
            self.keep_alive_secs = secs.parse().map_err(|_| {
                anyhow!("MQTT_KEEP_ALIVE_SECS must be an integer number of seconds")
            })?;
        }
        if let Some(dir) = env_value("MQTT_CERT_DIR") {
            self.cert_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_value("BRIDGE_DISCONNECT_TIMEOUT_SECS") {
            self.disconnect_timeout_secs = secs.parse().map_err(|_| {
                anyhow!("BRIDGE_DISCONNECT_TIMEOUT_SECS must be an integer number of seconds")
            })?;
        }
        if let Some(flag) = env_value("BRIDGE_AUTOCONNECT") {
            self.autoconnect = parse_bool(&flag)
                .ok_or_else(|| anyhow!("BRIDGE_AUTOCONNECT must be true or false"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("MQTT host must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("MQTT port must be greater than zero"));
        }
        if self.base_topic.is_empty() {
            return Err(anyhow!("MQTT base topic must not be empty"));
        }
        if self.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(anyhow!(
                "MQTT keep-alive must be at least {} seconds",
                MIN_KEEP_ALIVE_SECS
            ));
        }
        if self.disconnect_timeout_secs == 0 {
            return Err(anyhow!("disconnect timeout must be greater than zero"));
        }
        Ok(())
    }

    fn finish(self) -> BridgeConfig {
        let certificates = CertificateBundle::from_dir(&self.cert_dir);
        BridgeConfig {
            http_addr: self.http_addr,
            broker: BrokerConfig {
                host: self.host,
                port: self.port,
                client_id: generate_client_id(&self.client_id_prefix),
                base_topic: self.base_topic,
                keep_alive: Duration::from_secs(self.keep_alive_secs),
            },
            cert_dir: self.cert_dir,
            certificates,
            disconnect_timeout: Duration::from_secs(self.disconnect_timeout_secs),
            autoconnect: self.autoconnect,
        }
    }
}

/// `<prefix>-<unix seconds>-<8 hex chars>`: unique per process start.
pub fn generate_client_id(prefix: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{}-{}-{}", prefix, now, hex::encode(suffix))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg: BridgeConfigFile = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique_and_prefixed() {
        let a = generate_client_id("bridge");
        let b = generate_client_id("bridge");
        assert!(a.starts_with("bridge-"));
        assert_ne!(a, b);
        assert_eq!(a.rsplit('-').next().map(str::len), Some(8));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::from_file(BridgeConfigFile::default());
        assert!(settings.validate().is_ok());
        let cfg = settings.finish();
        assert_eq!(cfg.http_addr, "0.0.0.0:5000");
        assert_eq!(cfg.broker.port, 8883);
        assert_eq!(cfg.broker.base_topic, "/client_id/api");
        assert_eq!(cfg.broker.keep_alive, Duration::from_secs(60));
        assert_eq!(cfg.certificates, CertificateBundle::from_dir("certs"));
        assert!(cfg.autoconnect);
    }

    #[test]
    fn validate_rejects_short_keep_alive() {
        let mut settings = Settings::from_file(BridgeConfigFile::default());
        settings.keep_alive_secs = 2;
        assert!(settings
            .validate()
            .unwrap_err()
            .to_string()
            .contains("keep-alive"));
    }
}
