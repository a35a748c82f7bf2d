//! 无线电边界
//!
//! 把平台蓝牙栈抽象为 [`Radio`] trait。所有请求都是"发出即返回"的，
//! 结果通过稍后到达的事件投递到调用方提供的 sink：
//!
//! - 扫描：[`ScanEventSink`] 接收 [`ScanEvent`]
//! - GATT：[`GattEventSink`] 接收 [`GattEvent`]
//!
//! 生产环境使用 [`BtleplugRadio`](super::btleplug_radio::BtleplugRadio)，
//! 测试和演示使用 [`SimulatedRadio`](super::simulated::SimulatedRadio)。

use crate::ble::advertisement::AdvertisementRecord;
use crate::ble::gatt::GattEventSink;
use crate::ble::scanner::{ScanFilter, ScanSettings};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 适配器电源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// 没有可用的适配器
    Absent,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_available(self) -> bool {
        self == AdapterState::PoweredOn
    }
}

/// 无线电层错误
#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Bluetooth adapter is powered off")]
    AdapterOff,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Characteristic not found: {characteristic} (service {service})")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("Bluetooth backend error: {0}")]
    Backend(#[from] btleplug::Error),
}

/// 扫描失败码
///
/// 数值与 Android `ScanCallback.SCAN_FAILED_*` 保持一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    AlreadyStarted,
    ApplicationRegistrationFailed,
    InternalError,
    FeatureUnsupported,
    OutOfHardwareResources,
    ScanningTooFrequently,
    Other(i32),
}

impl ScanFailure {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ScanFailure::AlreadyStarted,
            2 => ScanFailure::ApplicationRegistrationFailed,
            3 => ScanFailure::InternalError,
            4 => ScanFailure::FeatureUnsupported,
            5 => ScanFailure::OutOfHardwareResources,
            6 => ScanFailure::ScanningTooFrequently,
            other => ScanFailure::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ScanFailure::AlreadyStarted => 1,
            ScanFailure::ApplicationRegistrationFailed => 2,
            ScanFailure::InternalError => 3,
            ScanFailure::FeatureUnsupported => 4,
            ScanFailure::OutOfHardwareResources => 5,
            ScanFailure::ScanningTooFrequently => 6,
            ScanFailure::Other(code) => code,
        }
    }
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanFailure::AlreadyStarted => "already started",
            ScanFailure::ApplicationRegistrationFailed => "application registration failed",
            ScanFailure::InternalError => "internal error",
            ScanFailure::FeatureUnsupported => "feature unsupported",
            ScanFailure::OutOfHardwareResources => "out of hardware resources",
            ScanFailure::ScanningTooFrequently => "scanning too frequently",
            ScanFailure::Other(_) => "unknown failure",
        };
        write!(f, "{} (code {})", label, self.code())
    }
}

/// 扫描期间无线电层上报的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Advertisement(AdvertisementRecord),
    Failed(ScanFailure),
}

/// 扫描事件投递端
///
/// 接收端由 [`ScanSession`](super::scanner::ScanSession) 持有并按序消费。
#[derive(Debug, Clone)]
pub struct ScanEventSink {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ScanEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ScanEvent>) -> Self {
        Self { tx }
    }

    /// 投递事件，扫描已结束时返回 `false`
    pub fn send(&self, event: ScanEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// GATT 状态码，0 表示成功
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// 平台的通用 GATT 错误 (0x85)
    pub const ERROR: GattStatus = GattStatus(0x85);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(self) -> bool {
        self == GattStatus::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// 链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// 服务发现结果中的单个服务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// 连接期间无线电层上报的事件
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    ConnectionStateChanged {
        new_state: LinkState,
        status: GattStatus,
    },
    /// 建立链路失败（后端报错）
    ConnectFailed { status: GattStatus },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<DiscoveredService>,
    },
}

/// 平台蓝牙栈
///
/// 除 `read_characteristic` 外，所有方法只负责发出请求，结果经由 sink 异步到达。
#[async_trait::async_trait]
pub trait Radio: Send + Sync {
    async fn adapter_state(&self) -> AdapterState;

    async fn start_scan(
        &self,
        filters: &[ScanFilter],
        settings: &ScanSettings,
        sink: ScanEventSink,
    ) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// 请求建立链路，之后的连接状态和服务发现结果都投递到 `sink`
    async fn connect(&self, address: &str, sink: GattEventSink) -> Result<(), RadioError>;

    async fn discover_services(&self, address: &str) -> Result<(), RadioError>;

    async fn read_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError>;

    /// 释放 `link` 所属尝试建立的链路
    ///
    /// 未连接，或链路已归属其他会话、其他尝试时为空操作。
    async fn disconnect(&self, address: &str, link: &GattEventSink) -> Result<(), RadioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_failure_codes() {
        for code in 1..=6 {
            assert_eq!(ScanFailure::from_code(code).code(), code);
        }
        assert_eq!(ScanFailure::from_code(42), ScanFailure::Other(42));
        assert_eq!(
            ScanFailure::OutOfHardwareResources.to_string(),
            "out of hardware resources (code 5)"
        );
    }

    #[test]
    fn test_gatt_status_display() {
        assert!(GattStatus::SUCCESS.is_success());
        assert!(!GattStatus::FAILURE.is_success());
        assert_eq!(GattStatus::ERROR.to_string(), "0x0085");
    }
}
