//! Server configuration.
//!
//! Command-line flags pick the configuration file and a few runtime
//! overrides; everything describing the deployment lives in the YAML file.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Kish Server - Expose services behind NAT under your own domain.
#[derive(Parser, Debug, Clone)]
#[command(name = "kish-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "KISH_CONFIG")]
    pub config: PathBuf,

    /// Listen address, overriding the one in the configuration file
    #[arg(long, env = "KISH_LISTEN")]
    pub listen: Option<String>,

    /// Enable debug logging
    #[arg(long, env = "KISH_DEBUG")]
    pub debug: bool,
}

/// How WebSocket upgrades are relayed to HTTP tunnels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebsocketMode {
    /// Upgrades are refused with 400.
    Disabled,
    /// A second handshake is made over a fresh stream and the two WebSocket
    /// connections are spliced message by message.
    BridgeViaNewConnection,
    /// The upgraded connection is piped byte for byte.
    #[default]
    Direct,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Hostname the control endpoints are served under
    pub host: String,

    /// Suffix every tunnel hostname must end with (e.g. `.tunnel.example.com`)
    pub domain_suffix: String,

    #[serde(default = "default_listen")]
    pub listen: String,

    /// Take the client address from the last `X-Forwarded-For` entry
    #[serde(default)]
    pub trust_x_forwarded_for: bool,

    /// YAML file of `keyID: secret` pairs
    #[serde(default)]
    pub account: Option<PathBuf>,

    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    #[serde(default)]
    pub enable_tcp_forwarding: bool,

    #[serde(default)]
    pub websocket_handler: WebsocketMode,
}

impl ServerConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: ServerConfig = serde_yaml::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.host = self.host.trim().to_ascii_lowercase();
        let suffix = self.domain_suffix.trim().to_ascii_lowercase();
        self.domain_suffix = if suffix.is_empty() || suffix.starts_with('.') {
            suffix
        } else {
            format!(".{}", suffix)
        };
        if self.listen.starts_with(':') {
            self.listen = format!("0.0.0.0{}", self.listen);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("host must not be empty");
        }
        if self.domain_suffix.len() < 2 {
            bail!("domain-suffix must not be empty");
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            bail!("tls-cert and tls-key must be given together");
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}
