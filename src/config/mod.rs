use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Load balancing methods the registry recognizes.
pub const SUPPORTED_METHODS: [&str; 3] = ["roundrobin", "leastconn", "weighted"];

/// A single backend entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,

    /// Static weight from configuration. Missing or non-positive values fall
    /// back to 1 via [`BackendConfig::effective_weight`].
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    1
}

impl BackendConfig {
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1) as u32
    }
}

/// Validated proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

fn default_port() -> u16 {
    8080
}

fn default_method() -> String {
    "roundrobin".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            method: default_method(),
            backends: Vec::new(),
        }
    }
}

impl Config {
    /// Overlay CLI flags on top of file values. An explicit backend list
    /// replaces the configured one wholesale; weights configured for the same
    /// URL in the file are carried over.
    pub fn apply_overrides(
        &mut self,
        port: Option<u16>,
        method: Option<&str>,
        backends: &[String],
    ) {
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(method) = method {
            self.method = method.to_string();
        }

        let urls = split_backend_flags(backends);
        if !urls.is_empty() {
            let known_weights: HashMap<String, i64> = self
                .backends
                .iter()
                .map(|b| (b.url.clone(), b.weight))
                .collect();

            self.backends = urls
                .into_iter()
                .map(|url| {
                    let weight = known_weights.get(&url).copied().unwrap_or(1);
                    BackendConfig { url, weight }
                })
                .collect();
        }
    }

    /// Check the configuration for correctness: at least one backend, a
    /// supported method, a non-zero port and absolute http/https backend URLs.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("at least one backend must be specified");
        }
        if !SUPPORTED_METHODS.contains(&self.method.as_str()) {
            anyhow::bail!("unsupported load balancing method: {}", self.method);
        }
        if self.port == 0 {
            anyhow::bail!("invalid port: {}", self.port);
        }
        for backend in &self.backends {
            let parsed = url::Url::parse(&backend.url)
                .with_context(|| format!("invalid backend URL: {}", backend.url))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                anyhow::bail!(
                    "backend URL must be http or https: {}",
                    backend.url
                );
            }
        }
        Ok(())
    }
}

/// `--backend` values may be repeated or comma-separated; flatten both.
fn split_backend_flags(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Load configuration from a JSON file.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_json::from_str(&content).context("Failed to parse JSON configuration")?;

    Ok(config)
}

/// Look for a config file in the standard locations; first match wins.
pub fn find_config_file() -> Option<PathBuf> {
    let mut locations = vec![
        PathBuf::from("./golem.json"),
        PathBuf::from("./config.json"),
        PathBuf::from("/etc/golem/config.json"),
    ];
    if let Ok(home) = std::env::var("HOME") {
        locations.push(Path::new(&home).join(".golem/config.json"));
    }

    locations.into_iter().find(|loc| loc.exists())
}
