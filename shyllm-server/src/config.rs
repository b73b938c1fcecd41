use std::time::Duration;
use thiserror::Error;

use crate::bootstrap::ServeOptions;
use crate::reload::DEFAULT_POLL_INTERVAL;

pub const DEFAULT_MODEL_NAME: &str = "Qwen/Qwen2.5-Coder-7B-Instruct";
pub const DEFAULT_REVISION: &str = "main";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Server settings, read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Hub id of the model to serve (`MODEL_NAME`)
    pub model_name: String,
    /// Shared secret compared against the `api_key` query parameter (`SHYLLM_API_KEY`)
    pub api_key: Option<String>,
    /// Hub revision to download (`SHYLLM_MODEL_REVISION`)
    pub revision: String,
    /// Restart when the executable changes (`SHYLLM_RELOAD`)
    pub reload: bool,
    pub reload_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            api_key: None,
            revision: DEFAULT_REVISION.to_string(),
            reload: true,
            reload_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean",
        }),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let reload = match lookup("SHYLLM_RELOAD") {
            Some(value) => parse_flag("SHYLLM_RELOAD", value)?,
            None => defaults.reload,
        };

        Ok(Self {
            model_name: lookup("MODEL_NAME").unwrap_or(defaults.model_name),
            api_key: lookup("SHYLLM_API_KEY"),
            revision: lookup("SHYLLM_MODEL_REVISION").unwrap_or(defaults.revision),
            reload,
            reload_interval: defaults.reload_interval,
        })
    }

    pub fn serve_options(&self) -> ServeOptions {
        ServeOptions {
            reload: self.reload.then_some(self.reload_interval),
        }
    }
}
