use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{fs, time::Duration};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub kick: KickConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Defaults to "server" when absent; an explicit "" gets a generated
    /// `house-relay-<uuid>` id.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub clean_session: Option<bool>,
    pub tls: Option<TlsConfig>,
}

fn default_client_id() -> String {
    "server".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to a PEM CA bundle
    pub ca_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding whitelist.json and connected.json
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("client_data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub production_url: String,
    pub consumption_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Used for clients that never announced an email address.
    #[serde(default)]
    pub default_email: String,
    #[serde(default)]
    pub forward: ForwardMode,
}

fn default_timeout_secs() -> u64 {
    10
}

/// Which readings go to the HTTP sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Sealed hourly averages only
    Hourly,
    /// Every reading as it arrives
    Raw,
    #[default]
    Both,
}

impl ForwardMode {
    pub fn hourly(&self) -> bool {
        matches!(self, ForwardMode::Hourly | ForwardMode::Both)
    }

    pub fn raw(&self) -> bool {
        matches!(self, ForwardMode::Raw | ForwardMode::Both)
    }
}

/// How a forced disconnect reaches the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KickConfig {
    /// EMQX management API: DELETE {base_url}/api/v5/clients/{id}
    EmqxApi {
        base_url: String,
        api_key: String,
        api_secret: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    /// External program; `{client_id}` in any argument is substituted.
    Command {
        #[serde(default = "default_kick_command")]
        argv: Vec<String>,
    },
    LogOnly,
}

fn default_kick_command() -> Vec<String> {
    ["docker", "exec", "emqx", "./bin/emqx_ctl", "clients", "kick", "{client_id}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for KickConfig {
    fn default() -> Self {
        KickConfig::Command {
            argv: default_kick_command(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Suppress repeated kicks of the same client within this window (0 = off)
    #[serde(default)]
    pub kick_cooldown_secs: u64,
    /// Evict registry entries not re-announced for this long (unset = never)
    pub stale_after_secs: Option<u64>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Seal and forward open buckets on shutdown
    #[serde(default)]
    pub flush_on_shutdown: bool,
    #[serde(default)]
    pub republish: RepublishConfig,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Optional broker topics for re-publishing readings, `{client_id}` templated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepublishConfig {
    pub raw_topic: Option<String>,
    pub hourly_topic: Option<String>,
}

impl RelayConfig {
    pub fn kick_cooldown(&self) -> Option<Duration> {
        (self.kick_cooldown_secs > 0).then(|| Duration::from_secs(self.kick_cooldown_secs))
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards MQTT_HOST and RELAY_DATA_DIR, when set, override the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let expanded = expand_env_placeholders(&raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("MQTT_HOST") {
            cfg.mqtt.host = host;
        }
        if let Ok(dir) = std::env::var("RELAY_DATA_DIR") {
            cfg.storage.data_dir = PathBuf::from(dir);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            return Err(AppError::Config("mqtt.host cannot be empty".to_string()));
        }
        if self.mqtt.port == 0 {
            return Err(AppError::Config("mqtt.port cannot be 0".to_string()));
        }
        if self.upstream.production_url.is_empty() || self.upstream.consumption_url.is_empty() {
            return Err(AppError::Config(
                "upstream production_url and consumption_url are required".to_string(),
            ));
        }
        if let KickConfig::Command { argv } = &self.kick {
            if argv.is_empty() {
                return Err(AppError::Config("kick.argv cannot be empty".to_string()));
            }
        }
        if self.relay.stale_after_secs.is_some() && self.relay.sweep_interval_secs == 0 {
            return Err(AppError::Config(
                "relay.sweep_interval_secs must be positive when stale_after_secs is set"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$"; any other '$' is kept as-is.
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close).ok_or_else(|| {
            AppError::Config(format!("unterminated env placeholder: missing '{close}'"))
        })?;
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {var}")))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Consume characters up to and including `end`, returning what came before.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
