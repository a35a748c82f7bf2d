//! 应用配置和持久化
//!
//! 提供扫描参数、过滤条件、连接超时和默认读取特征的存储和读取。

use crate::ble::{
    DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC, ScanFilter, ScanSettings,
    SessionConfig,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// 应用设置
///
/// 示例 `settings.toml`：
///
/// ```toml
/// connect_timeout_secs = 30
/// verbose = false
///
/// [scan]
/// mode = "LowLatency"
/// match_mode = "Sticky"
///
/// [[filters]]
/// name = "MS1089"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 连接后默认读取的服务
    pub read_service: Uuid,
    /// 连接后默认读取的特征
    pub read_characteristic: Uuid,
    /// 详细日志模式
    pub verbose: bool,
    /// 扫描参数
    pub scan: ScanSettings,
    /// 扫描过滤条件，为空时不过滤
    pub filters: Vec<ScanFilter>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            read_service: DEVICE_INFORMATION_SERVICE,
            read_characteristic: MODEL_NUMBER_CHARACTERISTIC,
            verbose: false,
            scan: ScanSettings::default(),
            filters: Vec::new(),
        }
    }
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blescan");
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

    /// 传给 [`ScanSession::start`](crate::ble::ScanSession::start) 的过滤条件
    ///
    /// 没有配置过滤条件时返回 `None`，即不过滤。
    pub fn scan_filters(&self) -> Option<Vec<ScanFilter>> {
        if self.filters.is_empty() {
            None
        } else {
            Some(self.filters.clone())
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
        }
    }
}
