use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BloomError, Result};
use crate::llm::Provider;
use crate::memory::{MemoryOptions, DEFAULT_MAX_MESSAGES, DEFAULT_STORAGE_KEY};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

/// Unset fields fall back to the provider client's own defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub default_provider: Provider,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub google: ProviderConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            timeout_ms: default_timeout_ms(),
            openai: ProviderConfig::default(),
            anthropic: ProviderConfig::default(),
            google: ProviderConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_provider() -> Provider {
    Provider::Anthropic
}

fn default_timeout_ms() -> u64 {
    45_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            storage_key: default_storage_key(),
        }
    }
}

impl MemoryConfig {
    pub fn options(&self) -> MemoryOptions {
        MemoryOptions {
            max_messages: self.max_messages,
            storage_key: self.storage_key.clone(),
        }
    }
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.into()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            database_url: None,
        }
    }
}

fn default_storage_path() -> String {
    "sessions".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyzerConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    #[serde(default = "default_preview_chars")]
    pub extracted_preview_chars: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            extracted_preview_chars: default_preview_chars(),
        }
    }
}

fn default_max_file_size() -> usize {
    50 * 1024 * 1024
}

fn default_preview_chars() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionConfig {
    #[serde(default = "default_ml_api_url")]
    pub api_base_url: String,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_ml_api_url(),
        }
    }
}

fn default_ml_api_url() -> String {
    "http://localhost:5000/api".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|err| BloomError::Config(format!("Failed to parse configuration: {err}")))
    }

    /// Defaults plus environment overrides; no file needed.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("BLOOM_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("BLOOM_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Ok(provider) = env::var("BLOOM_DEFAULT_PROVIDER") {
            self.model.default_provider = provider.parse()?;
        }
        if let Ok(timeout) = env::var("BLOOM_CHAT_TIMEOUT_MS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                self.model.timeout_ms = parsed;
            }
        }
        if let Ok(key) = env::var("BLOOM_OPENAI_API_KEY") {
            self.model.openai.api_key = Some(key);
        }
        if let Ok(model) = env::var("BLOOM_OPENAI_MODEL") {
            self.model.openai.model = Some(model);
        }
        if let Ok(key) = env::var("BLOOM_ANTHROPIC_API_KEY") {
            self.model.anthropic.api_key = Some(key);
        }
        if let Ok(model) = env::var("BLOOM_ANTHROPIC_MODEL") {
            self.model.anthropic.model = Some(model);
        }
        if let Ok(key) = env::var("BLOOM_GOOGLE_API_KEY") {
            self.model.google.api_key = Some(key);
        }
        if let Ok(model) = env::var("BLOOM_GOOGLE_MODEL") {
            self.model.google.model = Some(model);
        }
        if let Ok(history) = env::var("BLOOM_MAX_CONVERSATION_HISTORY") {
            if let Ok(parsed) = history.parse::<usize>() {
                self.memory.max_messages = parsed;
            }
        }
        if let Ok(ml_api) = env::var("BLOOM_ML_API_URL") {
            // the ML back end also proxies Anthropic
            self.model.anthropic.proxy_url = Some(ml_api.clone());
            self.prediction.api_base_url = ml_api;
        }
        if let Ok(backend) = env::var("BLOOM_STORAGE_BACKEND") {
            self.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "sqlite" => StorageBackend::Sqlite,
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::File,
            };
        }
        if let Ok(path) = env::var("BLOOM_STORAGE_PATH") {
            self.storage.path = path;
        }
        if let Ok(url) = env::var("BLOOM_DATABASE_URL") {
            self.storage.database_url = Some(url);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_the_deployed_service() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.model.default_provider, Provider::Anthropic);
        assert_eq!(cfg.model.timeout(), Duration::from_secs(45));
        assert_eq!(cfg.memory.max_messages, 20);
        assert_eq!(cfg.memory.storage_key, "bloombuddy_conversation");
        assert_eq!(cfg.analyzer.max_file_size, 52_428_800);
    }

    #[test]
    fn loads_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nport=9000\n[model]\ndefault_provider='google'\n[model.google]\napi_key='g-key'\nmodel='gemini-1.5-pro'\n[storage]\nbackend='sqlite'\ndatabase_url='sqlite::memory:'"
        )
        .unwrap();

        let cfg = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.model.default_provider, Provider::Google);
        assert_eq!(cfg.model.google.model.as_deref(), Some("gemini-1.5-pro"));
        assert!(cfg.model.openai.api_key.is_none());
        assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn environment_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[memory]\nmax_messages=10").unwrap();

        env::set_var("BLOOM_MAX_CONVERSATION_HISTORY", "30");
        env::set_var("BLOOM_ML_API_URL", "http://ml.internal/api");
        let cfg = AppConfig::from_env_or_file(file.path()).unwrap();
        env::remove_var("BLOOM_MAX_CONVERSATION_HISTORY");
        env::remove_var("BLOOM_ML_API_URL");

        assert_eq!(cfg.memory.max_messages, 30);
        assert_eq!(cfg.prediction.api_base_url, "http://ml.internal/api");
        assert_eq!(
            cfg.model.anthropic.proxy_url.as_deref(),
            Some("http://ml.internal/api")
        );
    }

    #[test]
    fn rejects_malformed_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport=").unwrap();
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
