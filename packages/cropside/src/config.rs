//! Server configuration.
//!
//! figment layering: struct defaults → `config.toml` → `CROPSIDE_*` env vars
//! (double underscore nests into sections):
//!
//!   config.toml:     [session]
//!                    idle_timeout_secs = 600
//!
//!   env var:         CROPSIDE_SESSION__IDLE_TIMEOUT_SECS=600

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use cropside_core::{RegistryConfig, SignalingConfig};

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub signaling: SignalingFileConfig,
}

/// Bind settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Session lifecycle tunables (lives under `[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Empty-roster sessions older than this are closed by the sweep.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Peer negotiation tunables (lives under `[signaling]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalingFileConfig {
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,
    /// TURN relay URL; enables the turn-retry fallback when set.
    #[serde(default)]
    pub turn_server_url: Option<String>,
}

impl Default for SignalingFileConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_secs: default_negotiation_timeout(),
            turn_server_url: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_idle_timeout() -> u64 {
    900
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_negotiation_timeout() -> u64 {
    10
}

/// Resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub registry: RegistryConfig,
    pub signaling: SignalingConfig,
}

impl AppConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            registry: RegistryConfig {
                idle_timeout: Duration::from_secs(fc.session.idle_timeout_secs),
                sweep_interval: Duration::from_secs(fc.session.sweep_interval_secs),
            },
            signaling: SignalingConfig {
                negotiation_timeout: Duration::from_secs(fc.signaling.negotiation_timeout_secs),
                turn_server_url: fc.signaling.turn_server_url.clone(),
            },
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

/// Load configuration, layering defaults → config file → env vars.
///
/// When `config_path` is `None`, `config.toml` in the working directory is
/// used if present.
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let path = config_path.unwrap_or_else(|| Path::new("config.toml"));
    let figment = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("CROPSIDE_").split("__"));

    let file: FileConfig = figment.extract().context("invalid configuration")?;
    Ok(AppConfig::from_file(&file))
}
