//! Runtime configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port for the HTTP front end (`/run`, `/stat`, `/healthz`, `/metrics`).
    pub http_port: u16,
    /// Port for the WebSocket front end.
    pub ws_port: u16,
    /// Default time budget for a run when the task document carries none.
    pub request_timeout_ms: u64,
    /// Launch locally booted browsers headless.
    pub headless: bool,
    /// Extra arguments passed to locally booted browsers.
    pub browser_args: Vec<String>,
    /// Whether `navigate` awaits navigation completion by default. Scripts
    /// can override per command with `Options.waitForNavigation`.
    pub wait_for_navigation: bool,
    /// Base url of the fingerprint-profile provider API.
    pub profile_api: String,
    /// Provider API token, appended to provider requests when set.
    pub profile_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            ws_port: 8081,
            request_timeout_ms: 120_000,
            headless: true,
            browser_args: Vec::new(),
            wait_for_navigation: true,
            profile_api: "http://127.0.0.1:45000".to_string(),
            profile_token: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, or defaults when the file does
    /// not exist.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            home_dir.join(".scriptpilot").join("config.toml")
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.ws_port, 8081);
        assert!(config.headless);
        assert!(config.wait_for_navigation);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "http_port = 9000\nheadless = false\n").unwrap();
        let config = Config::load(Some(path)).unwrap();
        assert_eq!(config.http_port, 9000);
        assert!(!config.headless);
        assert_eq!(config.ws_port, 8081);
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.profile_token = Some("tok".into());
        config.save(path.clone()).unwrap();
        let loaded = Config::load(Some(path)).unwrap();
        assert_eq!(loaded.profile_token.as_deref(), Some("tok"));
    }
}
