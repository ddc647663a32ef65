//! 应用配置和持久化
//!
//! 设备身份、监听端口、接收目录和各类超时的存储和读取。

use crate::logging::LogLevel;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 平台标签（随发现记录广播）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Unknown,
    Android,
    Ios,
    Mac,
    Linux,
    Windows,
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Unknown => "Unknown",
            Platform::Android => "Android",
            Platform::Ios => "iOS",
            Platform::Mac => "macOS",
            Platform::Linux => "Linux",
            Platform::Windows => "Windows",
        }
    }

    /// 从广播里的平台标签解析，大小写不敏感
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "android" => Platform::Android,
            "ios" | "iphone" | "ipad" => Platform::Ios,
            "mac" | "macos" | "osx" => Platform::Mac,
            "linux" => Platform::Linux,
            "windows" | "win" => Platform::Windows,
            _ => Platform::Unknown,
        }
    }

    /// 当前编译目标
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else {
            Platform::Unknown
        }
    }
}

/// 应用设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 设备 ID（首次运行时生成）
    pub device_id: String,
    /// 设备名称（在对端列表中显示）
    pub device_name: String,
    pub platform: Platform,
    /// 监听端口，0 表示由系统分配
    pub listen_port: u16,
    /// 对外公布的地址；为空时自动探测出口网卡地址
    pub advertise_host: Option<String>,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 是否自动接受所有传输
    pub auto_accept: bool,
    pub chunk_size: usize,
    pub progress_interval_ms: u64,
    pub peer_stale_secs: u64,
    pub prune_interval_secs: u64,
    pub pairing_code_ttl_secs: u64,
    pub pairing_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub log_level: LogLevel,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: get_default_device_name(),
            platform: Platform::current(),
            listen_port: 0,
            advertise_host: None,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            auto_accept: false,
            chunk_size: 64 * 1024,
            progress_interval_ms: 250,
            peer_stale_secs: 10,
            prune_interval_secs: 5,
            pairing_code_ttl_secs: 300,
            pairing_timeout_secs: 30,
            connect_timeout_secs: 10,
            log_level: LogLevel::Info,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flinch");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn peer_stale_after(&self) -> Duration {
        Duration::from_secs(self.peer_stale_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    pub fn pairing_code_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_code_ttl_secs)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Flinch".to_string())
}
