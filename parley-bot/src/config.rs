//! Load config from file and environment; `main` applies command-line flags on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parley_core::{EngineConfig, PublicKey};
use serde::Deserialize;

/// Bot configuration. File: ~/.config/parley/config.toml or /etc/parley/config.toml.
/// Env overrides: PARLEY_BIND, PARLEY_SAVE, PARLEY_TICK_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP listen address (default 0.0.0.0:33445).
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Save file. Without one the bot starts fresh and saves nothing.
    #[serde(default)]
    pub save_path: Option<PathBuf>,
    /// Milliseconds between engine ticks (default 25).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Name used when no save could be loaded.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_status_message")]
    pub status_message: String,
    /// Bootstrap nodes; persisted as routing hints.
    #[serde(default)]
    pub bootstrap: Vec<NodeEntry>,
    /// Static peer directory; handed to the router only.
    #[serde(default)]
    pub peers: Vec<NodeEntry>,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// A reachable node: UDP address plus its hex public key.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    pub address: SocketAddr,
    pub public_key: String,
}

impl NodeEntry {
    pub fn resolve(&self) -> anyhow::Result<(SocketAddr, PublicKey)> {
        let key = PublicKey::from_hex(&self.public_key)
            .with_context(|| format!("bad public key for node {}", self.address))?;
        Ok((self.address, key))
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 33445))
}
fn default_tick_ms() -> u64 {
    25
}
fn default_name() -> String {
    "ParleyBot".to_string()
}
fn default_status_message() -> String {
    "Parley is cool!".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            save_path: None,
            tick_ms: default_tick_ms(),
            name: default_name(),
            status_message: default_status_message(),
            bootstrap: Vec::new(),
            peers: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Apply env overrides; `var` looks a variable up (std::env::var in production).
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("PARLEY_BIND") {
            match s.parse::<SocketAddr>() {
                Ok(addr) => self.bind = addr,
                Err(e) => tracing::warn!(value = %s, error = %e, "ignoring PARLEY_BIND"),
            }
        }
        if let Some(s) = var("PARLEY_SAVE") {
            self.save_path = (!s.is_empty()).then(|| PathBuf::from(s));
        }
        if let Some(s) = var("PARLEY_TICK_MS") {
            match s.parse::<u64>() {
                Ok(ms) if ms > 0 => self.tick_ms = ms,
                _ => tracing::warn!(value = %s, "ignoring PARLEY_TICK_MS"),
            }
        }
    }
}

/// Parse `ADDR:HEXKEY` (the address may be `[v6]:port`).
pub fn parse_node(s: &str) -> anyhow::Result<(SocketAddr, PublicKey)> {
    let (addr, key) = s
        .rsplit_once(':')
        .with_context(|| format!("expected ADDR:HEXKEY, got {s:?}"))?;
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("bad node address {addr:?}"))?;
    let key = PublicKey::from_hex(key).with_context(|| format!("bad node key in {s:?}"))?;
    Ok((addr, key))
}

/// Load config: defaults, then the config file, then env vars.
/// An explicit `path` must exist and parse; the default locations are optional.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => read_file(p)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/parley/config.toml"));
    }
    out.push(PathBuf::from("/etc/parley/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let p = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&p) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "using default config");
            None
        }
    }
}
