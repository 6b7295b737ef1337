use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const SUBSCRIPTION_PREFIX_ENV: &str = "DISPATCHERTRON_SUBSCRIPTION_PREFIX";
pub const PEER_PREFIX_ENV: &str = "DISPATCHERTRON_PEER_PREFIX";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read env file {path}: {message}")]
    EnvFile { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Prefix of the ids returned by `register`.
    #[serde(default = "default_subscription_prefix")]
    pub subscription_prefix: String,
    /// Prefix of the ids assigned to attached peers.
    #[serde(default = "default_peer_prefix")]
    pub peer_prefix: String,
}

fn default_subscription_prefix() -> String {
    "ID_".to_string()
}

fn default_peer_prefix() -> String {
    "PEER_".to_string()
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            subscription_prefix: default_subscription_prefix(),
            peer_prefix: default_peer_prefix(),
        }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by `DISPATCHERTRON_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by the keys of a dotenv file. The process
    /// environment is left untouched.
    pub fn from_env_file(path: &Path) -> Result<Self, ConfigError> {
        let env_file_err = |message: String| ConfigError::EnvFile {
            path: path.display().to_string(),
            message,
        };
        let mut vars = HashMap::new();
        for item in dotenvy::from_path_iter(path).map_err(|e| env_file_err(e.to_string()))? {
            let (key, value) = item.map_err(|e| env_file_err(e.to_string()))?;
            vars.insert(key, value);
        }
        Ok(Self::default().with_overrides(|key| vars.get(key).cloned()))
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(prefix) = non_empty(lookup(SUBSCRIPTION_PREFIX_ENV)) {
            self.subscription_prefix = prefix;
        }
        if let Some(prefix) = non_empty(lookup(PEER_PREFIX_ENV)) {
            self.peer_prefix = prefix;
        }
        self
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
