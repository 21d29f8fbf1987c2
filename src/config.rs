use crate::constants::*;
use crate::errors::{ChatError, ChatResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, sync::RwLock, time::Duration};

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// Application configuration, stored at `~/.config/lmchat/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub api_token: String,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub checkpoint_every_fragments: usize,
    pub checkpoint_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: DEFAULT_API_HOST.to_string(),
            api_port: DEFAULT_API_PORT,
            api_token: DEFAULT_API_TOKEN.to_string(),
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            checkpoint_every_fragments: DEFAULT_CHECKPOINT_EVERY_FRAGMENTS,
            checkpoint_interval_ms: DEFAULT_CHECKPOINT_INTERVAL_MS,
        }
    }
}

impl Config {
    /// `http://{host}:{port}/v1`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/v1", self.api_host, self.api_port)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    /// Applies `LMCHAT_*` environment overrides.
    fn apply_env_overrides(&mut self) -> ChatResult<()> {
        if let Ok(host) = env::var("LMCHAT_API_HOST") {
            self.api_host = host;
        }
        if let Ok(port) = env::var("LMCHAT_API_PORT") {
            self.api_port = port
                .parse()
                .map_err(|_| ChatError::config_error(format!("Invalid LMCHAT_API_PORT: {}", port)))?;
        }
        if let Ok(token) = env::var("LMCHAT_API_TOKEN") {
            self.api_token = token;
        }
        if let Ok(dir) = env::var("LMCHAT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }
}

static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));

pub fn initialize_config() -> ChatResult<()> {
    dotenv::dotenv().ok();
    let config_path = get_config_path()?;

    let mut config = if config_path.exists() {
        let config_str = fs::read_to_string(&config_path)
            .map_err(|e| ChatError::config_error(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&config_str)
            .map_err(|e| ChatError::config_error(format!("Failed to parse config: {}", e)))?
    } else {
        let config = Config::default();
        write_config(&config_path, &config)?;
        config
    };

    config.apply_env_overrides()?;
    validate_config(&config)?;

    *CONFIG.write().unwrap_or_else(|e| e.into_inner()) = config;
    Ok(())
}

fn get_config_path() -> ChatResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| ChatError::config_error("Could not determine config directory"))?;

    Ok(config_dir.join(APP_NAME).join("config.json"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

fn write_config(path: &PathBuf, config: &Config) -> ChatResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ChatError::config_error(format!("Failed to create config directory: {}", e)))?;
    }

    let config_str = serde_json::to_string_pretty(config)
        .map_err(|e| ChatError::config_error(format!("Failed to serialize config: {}", e)))?;

    fs::write(path, config_str)
        .map_err(|e| ChatError::config_error(format!("Failed to write config file: {}", e)))
}

pub fn validate_config(config: &Config) -> ChatResult<()> {
    if config.api_host.trim().is_empty() {
        return Err(ChatError::config_error("api_host is required"));
    }

    if config.api_port == 0 {
        return Err(ChatError::config_error("api_port must be greater than 0"));
    }

    if config.checkpoint_every_fragments == 0 {
        return Err(ChatError::config_error(
            "checkpoint_every_fragments must be greater than 0",
        ));
    }

    if config.checkpoint_interval_ms == 0 {
        return Err(ChatError::config_error(
            "checkpoint_interval_ms must be greater than 0",
        ));
    }

    if !LOG_LEVELS.contains(&config.log_level.to_lowercase().as_str()) {
        return Err(ChatError::config_error(format!(
            "Unknown log level '{}'",
            config.log_level
        )));
    }

    Ok(())
}

pub fn get_config() -> Config {
    CONFIG.read().unwrap_or_else(|e| e.into_inner()).clone()
}
