//! Client configuration.
//!
//! The server URL, key and tunnel restrictions live in a YAML file (`~/.kish`
//! unless `--config` says otherwise); a few flags override it per run.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kish_core::ProxyParameters;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Kish - Expose a local HTTP or TCP service through a kish server.
#[derive(Parser, Debug, Clone)]
#[command(name = "kish")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: .kish in the home directory)
    #[arg(short, long, global = true, env = "KISH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Request a fixed hostname instead of a random one
    #[arg(long, global = true)]
    pub hostname: Option<String>,

    /// Add this machine's public address to the IP allowlist
    #[arg(long, global = true)]
    pub allow_my_ip: bool,

    /// Host header sent to the local target
    #[arg(long, global = true)]
    pub host_header: Option<String>,

    /// Reconnect delay in seconds
    #[arg(long, global = true, env = "KISH_RECONNECT_DELAY", default_value = "5")]
    pub reconnect_delay: u64,

    /// Maximum reconnect attempts (0 = infinite)
    #[arg(long, global = true, env = "KISH_MAX_RECONNECTS", default_value = "0")]
    pub max_reconnects: u32,

    /// Enable debug logging
    #[arg(long, global = true, env = "KISH_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Publish a local HTTP service under a hostname
    Http {
        /// PORT or HOST:PORT of the local service
        #[arg(value_parser = canonicalize_target)]
        target: String,
    },
    /// Publish a local TCP service on a server port
    Tcp {
        /// PORT or HOST:PORT of the local service
        #[arg(value_parser = canonicalize_target)]
        target: String,
    },
}

/// Who may reach an HTTP tunnel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Restriction {
    #[serde(default)]
    pub ip: Vec<String>,

    #[serde(default)]
    pub allow_my_ip: bool,

    /// Basic auth `user: password` pairs
    #[serde(default)]
    pub auth: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    /// Base WebSocket URL of the server, e.g. `wss://kish.example.com`
    pub kish_url: String,

    /// `<keyID>/<secret>`
    pub key: String,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub restriction: Restriction,
}

/// Default configuration file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kish"))
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content)?;
        parse_key(&config.key)?;
        Ok(config)
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(hostname) = &cli.hostname {
            self.hostname = Some(hostname.clone());
        }
        if cli.allow_my_ip {
            self.restriction.allow_my_ip = true;
        }
    }

    /// Parameters signed into the tunnel token.
    pub fn parameters(&self) -> ProxyParameters {
        ProxyParameters {
            host: self.hostname.clone().filter(|h| !h.is_empty()),
            allow_ip: self.restriction.ip.clone(),
            basic_auth: self.restriction.auth.clone(),
            allow_my_ip: self.restriction.allow_my_ip,
        }
    }

    /// URL of a control endpoint below `kish-url`.
    pub fn endpoint_url(&self, endpoint: &str) -> Result<String> {
        let base = self.kish_url.trim();
        if !base.starts_with("ws://") && !base.starts_with("wss://") {
            bail!("kish-url `{}` must start with ws:// or wss://", base);
        }
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        ))
    }
}

/// Split a `<keyID>/<secret>` key.
pub fn parse_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((id, secret)) if !id.is_empty() && !secret.is_empty() => Ok((id, secret)),
        _ => bail!("key must look like <keyID>/<secret>"),
    }
}

/// `Origin` sent with the handshake: the server URL with its scheme mapped to
/// HTTP.
pub fn origin_for(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some(("wss", rest)) => ("https", rest),
        Some((_, rest)) => ("http", rest),
        None => ("http", url),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    format!("{}://{}", scheme, authority)
}

/// Normalize a `PORT` or `HOST:PORT` target, defaulting the host to
/// 127.0.0.1.
pub fn canonicalize_target(target: &str) -> Result<String, String> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.starts_with('[') => (host, port),
        _ => ("", target),
    };
    match port.parse::<u16>() {
        Ok(n) if n >= 1 => {}
        _ => return Err(format!("target `{}` is invalid", target)),
    }
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok(format!("{}:{}", host, port))
}
