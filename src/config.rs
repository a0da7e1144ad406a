use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

pub const DEFAULT_API_VERSION: &str = "5.199";
pub const DEFAULT_PORT: u16 = 8000;
const DEFAULT_DB_DIR: &str = "./data";
const DEFAULT_DB_NAME: &str = "logs.db";
const DEFAULT_STATIC_DIR: &str = "static";
const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VkSettings {
    pub token: String,
    pub group_id: i64,
    pub api_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub demo_mode: bool,
    /// Absent in demo mode.
    pub vk: Option<VkSettings>,
    pub db_path: PathBuf,
    pub attachments_dir: PathBuf,
    pub port: u16,
    pub static_dir: PathBuf,
    pub ytdlp_bin: String,
    pub download_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let demo_mode = var("DEMO_MODE").as_deref() == Some("1");
        let vk = if demo_mode {
            None
        } else {
            let (Some(token), Some(group_id)) = (var("VK_GROUP_TOKEN"), var("VK_GROUP_ID")) else {
                return Err(AppError::Config(
                    "set VK_GROUP_TOKEN and VK_GROUP_ID, or DEMO_MODE=1".to_string(),
                ));
            };
            let group_id = group_id
                .parse::<i64>()
                .map_err(|_| AppError::Config(format!("VK_GROUP_ID is not a number: {group_id}")))?;
            Some(VkSettings {
                token,
                group_id: group_id.abs(),
                api_version: var("VK_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            })
        };

        let db_path = match var("EVENT_DB") {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(var("EVENT_DB_DIR").unwrap_or_else(|| DEFAULT_DB_DIR.to_string()))
                .join(var("EVENT_DB_NAME").unwrap_or_else(|| DEFAULT_DB_NAME.to_string())),
        };
        let attachments_dir = match var("ATTACHMENTS_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => db_path
                .parent()
                .map(|parent| parent.join("attachments"))
                .unwrap_or_else(|| PathBuf::from("attachments")),
        };

        let port = match var("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| AppError::Config(format!("PORT is not a valid port: {raw}")))?,
            None => DEFAULT_PORT,
        };
        let download_timeout = match var("DOWNLOAD_TIMEOUT_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                AppError::Config(format!("DOWNLOAD_TIMEOUT_SECS is not a number: {raw}"))
            })?,
            None => DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        };

        Ok(Self {
            demo_mode,
            vk,
            db_path,
            attachments_dir,
            port,
            static_dir: PathBuf::from(var("STATIC_DIR").unwrap_or_else(|| DEFAULT_STATIC_DIR.to_string())),
            ytdlp_bin: var("YTDLP_BIN").unwrap_or_else(|| DEFAULT_YTDLP_BIN.to_string()),
            download_timeout: Duration::from_secs(download_timeout),
        })
    }
}
