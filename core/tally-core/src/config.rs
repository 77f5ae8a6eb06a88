//! Configuration loading and default paths.
//!
//! Everything lives under `~/.chat-tally/`:
//! - `config.toml` (optional; missing file means defaults)
//! - `state.db` (coordinator persistence mirror)
//! - `coordinator.sock` (coordinator socket)
//! - `logs/` (client log files)
//!
//! Every section is `#[serde(default)]`, so a config file only needs the keys
//! it wants to override.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Result, TallyError};

pub const CONFIG_ENV: &str = "CHAT_TALLY_CONFIG";
const TALLY_DIR: &str = ".chat-tally";
const CONFIG_FILE: &str = "config.toml";
const STORAGE_FILE: &str = "state.db";
const SOCKET_FILE: &str = "coordinator.sock";
const LOG_DIR: &str = "logs";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TallyConfig {
    pub watch: WatchConfig,
    pub badge: BadgeConfig,
    pub storage: StorageConfig,
    pub socket: SocketConfig,
    pub extraction: ExtractionConfig,
    pub roster: RosterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    pub locate_interval_ms: u64,
    pub max_locate_attempts: u32,
    pub navigation_poll_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            locate_interval_ms: 1000,
            max_locate_attempts: 10,
            navigation_poll_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BadgeConfig {
    pub color: String,
}

impl Default for BadgeConfig {
    fn default() -> Self {
        Self {
            color: "#9146ff".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SocketConfig {
    pub path: Option<PathBuf>,
}

/// Selector lists driving the extractor, each in priority order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    pub container_selectors: Vec<String>,
    pub message_selectors: Vec<String>,
    pub label_selectors: Vec<String>,
    pub label_attributes: Vec<String>,
    pub subject_selectors: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            container_selectors: strings(&[
                r#"[data-a-target="chat-scrollable-area-messages"]"#,
                ".chat-scrollable-area__message-container",
                r#"[data-testid="chat-room-component-layout"]"#,
                ".chat-room__content",
                ".chat-messages",
            ]),
            message_selectors: strings(&[
                r#"[data-a-target="chat-line-message"]"#,
                ".chat-line__message",
                ".chat-line",
                r#"[data-testid="chat-line"]"#,
            ]),
            label_selectors: strings(&[
                r#"[data-a-target="chat-message-username"]"#,
                ".chat-author__display-name",
                ".chat-line__username",
                ".username",
                r#"[data-testid="chat-author"]"#,
            ]),
            label_attributes: strings(&["data-a-user", "data-user", "data-username"]),
            subject_selectors: strings(&[
                r#"h1[data-a-target="stream-title"]"#,
                ".channel-info-content h1",
                r#"[data-a-target="stream-info-card-component-title"]"#,
                r#"h1[class*="title"]"#,
                ".stream-info h1",
                "h1",
            ]),
        }
    }
}

/// Where the roster panel lists automated accounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RosterConfig {
    pub section_selector: String,
    pub section_title: String,
    pub title_selector: String,
    pub item_selector: String,
    pub name_selector: String,
    pub button_selector: String,
    pub aria_label_pattern: String,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            section_selector: ".Layout-sc-1xcs6mc-0.iymPrH".to_string(),
            section_title: "Чат-боты".to_string(),
            title_selector: "strong".to_string(),
            item_selector: ".chatter-list-item".to_string(),
            name_selector: "span".to_string(),
            button_selector: "button".to_string(),
            aria_label_pattern: r"(?i)пользователе\s+(\w+)".to_string(),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Returns `~/.chat-tally`.
pub fn tally_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(TALLY_DIR))
        .ok_or(TallyError::HomeDirNotFound)
}

/// Config path: `CHAT_TALLY_CONFIG` when set, otherwise `~/.chat-tally/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(tally_dir()?.join(CONFIG_FILE))
}

pub fn log_dir() -> Result<PathBuf> {
    Ok(tally_dir()?.join(LOG_DIR))
}

impl TallyConfig {
    pub fn storage_path(&self) -> Result<PathBuf> {
        match &self.storage.path {
            Some(path) => Ok(path.clone()),
            None => Ok(tally_dir()?.join(STORAGE_FILE)),
        }
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.socket.path {
            Some(path) => Ok(path.clone()),
            None => Ok(tally_dir()?.join(SOCKET_FILE)),
        }
    }
}

/// Loads the config file, returning defaults when it does not exist.
pub fn load_config(path: Option<PathBuf>) -> Result<TallyConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(TallyConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| TallyError::Io {
        context: format!("Failed to read config {}", config_path.display()),
        source,
    })?;
    parse_config(&config_path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<TallyConfig> {
    toml::from_str::<TallyConfig>(content).map_err(|err| TallyError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
