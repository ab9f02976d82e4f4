//! CLI configuration.
//!
//! Read from `~/.plot/config.json`; `PLOT_API_URL`, `PLOT_API_TOKEN` and
//! `PLOT_DEPLOY_TOKEN` take precedence over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_API_URL: &str = "https://api.plot.day";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Only ever taken from the environment.
    #[serde(skip)]
    pub deploy_token: Option<String>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: None,
            deploy_token: None,
        }
    }
}

impl CliConfig {
    pub fn load() -> Result<Self> {
        let contents = match config_path() {
            Some(path) if path.exists() => Some(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
            ),
            _ => None,
        };
        Self::from_parts(contents.as_deref(), |key| std::env::var(key).ok())
    }

    fn from_parts(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match file {
            Some(contents) => serde_json::from_str(contents).context("parsing ~/.plot/config.json")?,
            None => Self::default(),
        };

        let env = |key: &str| env(key).filter(|v| !v.is_empty());
        if let Some(url) = env("PLOT_API_URL") {
            config.api_url = url;
        }
        if let Some(token) = env("PLOT_API_TOKEN") {
            config.token = Some(token);
        }
        config.deploy_token = env("PLOT_DEPLOY_TOKEN");
        config.api_url = config.api_url.trim_end_matches('/').to_string();
        Ok(config)
    }

    pub fn require_token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .context("not signed in: set PLOT_API_TOKEN or add \"token\" to ~/.plot/config.json")
    }

    pub fn require_deploy_token(&self) -> Result<&str> {
        self.deploy_token
            .as_deref()
            .context("PLOT_DEPLOY_TOKEN is not set")
    }
}

pub fn config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".plot").join("config.json"))
}
