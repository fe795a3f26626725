use crate::adapter::Protocol;
use crate::error::{BridgeError, Result};
use crate::providers::ProviderPreset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Abort a stream attempt after this long without a chunk.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Upper bound on establishing a connection. Streams themselves are
    /// bounded only by `idle_timeout_secs`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

/// One `[models.<key>]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Preset name supplying defaults for URL, protocol and key variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Upstream model id. Defaults to the table key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_api_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bare_base_fallback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// Everything needed to talk to one model, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTarget {
    pub key: String,
    pub api_url: String,
    pub api_key: String,
    pub protocol: Protocol,
    pub model: String,
    pub anthropic_api_path: Option<String>,
    pub bare_base_fallback: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// Looks up the endpoint, protocol and credentials for a model key.
pub trait ModelResolver: Send + Sync {
    /// # Errors
    /// `BridgeError::Config` when the key is unknown or misconfigured.
    fn resolve(&self, key: &str) -> Result<ModelTarget>;
}

fn default_port() -> u16 {
    4222
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            models: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(BridgeError::config(format!(
            "No config file found. Searched: {}. Create one from model-bridge.example.toml",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// HTTP client for upstream calls. No total timeout: a stream may run as
    /// long as chunks keep arriving within the idle timeout.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .connect_timeout(self.connect_timeout())
            .build()?)
    }
}

impl ModelResolver for BridgeConfig {
    fn resolve(&self, key: &str) -> Result<ModelTarget> {
        let entry = self
            .models
            .get(key)
            .ok_or_else(|| BridgeError::config(format!("Unknown model '{key}'")))?;
        entry.resolve(key)
    }
}

impl ModelConfig {
    fn preset(&self) -> Result<Option<&'static ProviderPreset>> {
        match self.provider {
            None => Ok(None),
            Some(ref name) => ProviderPreset::from_name(name).map(Some).ok_or_else(|| {
                BridgeError::config(format!(
                    "Unknown provider '{}'. Known providers: {}",
                    name,
                    ProviderPreset::all()
                        .iter()
                        .map(|p| p.name)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            }),
        }
    }

    pub fn resolve(&self, key: &str) -> Result<ModelTarget> {
        let preset = self.preset()?;

        let api_url = self
            .api_url
            .clone()
            .or_else(|| preset.map(|p| p.base_url.to_string()))
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| BridgeError::config(format!("Model '{key}' has no api_url")))?;

        let protocol = self
            .protocol
            .or_else(|| preset.map(|p| p.protocol))
            .unwrap_or(Protocol::OpenAi);

        let api_key = self.resolve_api_key(key, preset)?;

        Ok(ModelTarget {
            key: key.to_string(),
            api_url,
            api_key,
            protocol,
            model: self.model.clone().unwrap_or_else(|| key.to_string()),
            anthropic_api_path: self.anthropic_api_path.clone(),
            bare_base_fallback: self.bare_base_fallback.unwrap_or(true),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        })
    }

    /// Inline `api_key` first, then the configured or preset environment variable.
    fn resolve_api_key(&self, key: &str, preset: Option<&ProviderPreset>) -> Result<String> {
        if let Some(ref inline) = self.api_key {
            if !inline.trim().is_empty() {
                return Ok(inline.clone());
            }
        }

        let env_name = self
            .api_key_env
            .as_deref()
            .or_else(|| preset.map(|p| p.default_api_key_env))
            .ok_or_else(|| BridgeError::config(format!("Model '{key}' has no API key configured")))?;

        match std::env::var(env_name).ok().filter(|v| !v.trim().is_empty()) {
            Some(value) => Ok(value),
            // Only the preset's own variable is optional; an explicit `api_key_env` must be set.
            None if self.api_key_env.is_none() && preset.is_some_and(|p| !p.requires_api_key) => {
                Ok(String::new())
            }
            None => Err(BridgeError::config(format!(
                "Model '{key}': environment variable '{env_name}' not set. Set it with your provider API key."
            ))),
        }
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("model-bridge.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("model-bridge").join("config.toml"));
    }
    if let Some(home) = home_dir() {
        paths.push(home.join(".config").join("model-bridge").join("config.toml"));
        paths.push(home.join(".model-bridge.toml"));
    }

    paths
}

pub fn print_search_paths() {
    println!("Config search paths:");
    for (i, path) in config_search_paths().iter().enumerate() {
        println!("  {}. {}", i + 1, path.display());
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
