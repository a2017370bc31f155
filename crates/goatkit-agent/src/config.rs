//! Agent configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use goatkit_net::LoaderConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors loading or saving the agent configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to answer when an HTML request fails offline and the root document
/// is not stored either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HtmlFallbackMiss {
    /// Serve the synthesized offline page.
    #[default]
    OfflinePage,
    /// Fail the request, as a failed navigation.
    NetworkError,
}

/// Cache agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name of the current store. Every other store is deleted on activate.
    pub cache_name: String,

    /// Resources cached on install, relative to the scope.
    pub seed_list: Vec<String>,

    /// Document served for HTML requests when the network is down.
    pub root_document: String,

    /// Application name shown on the offline page.
    pub app_name: String,

    /// Registration scope. Must end in `/`.
    pub scope: String,

    /// Snapshot file for cache storage.
    pub store_path: PathBuf,

    pub html_fallback_miss: HtmlFallbackMiss,

    /// User agent override for network fetches.
    pub user_agent: Option<String>,

    /// Network timeout in seconds
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cache_name: "goat-kids-v1.1".to_string(),
            seed_list: vec!["./".to_string(), "./index.html".to_string()],
            root_document: "./index.html".to_string(),
            app_name: "GOAT KIDS".to_string(),
            scope: "http://localhost:8080/".to_string(),
            store_path: PathBuf::from("goatkit-store.json"),
            html_fallback_miss: HtmlFallbackMiss::default(),
            user_agent: None,
            timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)
                .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cache_name is empty".to_string()));
        }
        if self.seed_list.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid("seed_list has an empty entry".to_string()));
        }
        if self.root_document.trim().is_empty() {
            return Err(ConfigError::Invalid("root_document is empty".to_string()));
        }
        self.scope_url()?;
        Ok(())
    }

    /// Parsed registration scope.
    pub fn scope_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.scope)
            .map_err(|e| ConfigError::Invalid(format!("scope {:?}: {}", self.scope, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "scope must be http(s), got {}",
                url.scheme()
            )));
        }
        if !url.path().ends_with('/') {
            return Err(ConfigError::Invalid(format!(
                "scope must end with '/': {}",
                url
            )));
        }
        Ok(url)
    }

    /// Loader settings for the HTTP fetcher.
    pub fn loader_config(&self) -> LoaderConfig {
        let mut loader = LoaderConfig {
            default_timeout: Duration::from_secs(self.timeout_secs),
            ..LoaderConfig::default()
        };
        if let Some(ref user_agent) = self.user_agent {
            loader.user_agent = user_agent.clone();
        }
        loader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.cache_name, "goat-kids-v1.1");
        assert_eq!(config.seed_list, vec!["./", "./index.html"]);
        assert_eq!(config.root_document, "./index.html");
        assert_eq!(config.html_fallback_miss, HtmlFallbackMiss::OfflinePage);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("goatkit.json");

        let config = AgentConfig {
            cache_name: "goat-kids-v2".to_string(),
            html_fallback_miss: HtmlFallbackMiss::NetworkError,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"network-error\""));
        assert_eq!(AgentConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("goatkit.json");
        std::fs::write(&path, r#"{ "app_name": "GOAT TEENS" }"#).unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.app_name, "GOAT TEENS");
        assert_eq!(config.cache_name, "goat-kids-v1.1");
    }

    #[test]
    fn test_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("goatkit.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AgentConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation() {
        let empty_name = AgentConfig {
            cache_name: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(empty_name.validate(), Err(ConfigError::Invalid(_))));

        let bad_scope = AgentConfig {
            scope: "http://localhost:8080/app".to_string(),
            ..Default::default()
        };
        assert!(bad_scope.validate().is_err());

        let file_scope = AgentConfig {
            scope: "file:///srv/app/".to_string(),
            ..Default::default()
        };
        assert!(file_scope.validate().is_err());
    }

    #[test]
    fn test_loader_config() {
        let config = AgentConfig {
            user_agent: Some("GoatBot/1.0".to_string()),
            timeout_secs: 5,
            ..Default::default()
        };
        let loader = config.loader_config();
        assert_eq!(loader.user_agent, "GoatBot/1.0");
        assert_eq!(loader.default_timeout, Duration::from_secs(5));
    }
}
