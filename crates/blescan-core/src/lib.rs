//! Blescan Core Library
//!
//! BLE 扫描结果聚合和 GATT 连接状态机的核心实现库
//!
//! # 模块
//!
//! - **ble**: 扫描会话、结果存储、GATT 会话和连接目录，以及无线电后端
//! - **config**: 设置的加载和保存
//! - **logging**: UI 共用的日志级别和条目
//!
//! # 使用示例
//!
//! ## 扫描设备
//!
//! ```ignore
//! use blescan_core::{BtleplugRadio, ScanResultStore, ScanSession, ScanSettings};
//!
//! let radio = Arc::new(BtleplugRadio::new().await?);
//! let session = ScanSession::new(radio, ScanResultStore::new());
//!
//! session.start(None, ScanSettings::default()).await?;
//! tokio::time::sleep(Duration::from_secs(5)).await;
//! session.stop().await;
//!
//! for (i, device) in session.store().snapshot().iter().enumerate() {
//!     println!("{}. {} ({})", i + 1, device.display_name(), device.address);
//! }
//! ```
//!
//! ## 读取型号
//!
//! ```ignore
//! use blescan_core::{ConnectionDirectory, DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC};
//!
//! let directory = ConnectionDirectory::new(radio, SessionConfig::default());
//! let session = directory.connect("C4:7C:8D:6A:10:89").await?;
//! session.wait_ready().await?;
//!
//! let model = session
//!     .read_characteristic(DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC)
//!     .await?;
//! session.disconnect().await;
//! ```

pub mod ble;
pub mod config;
pub mod logging;

// BLE re-exports
pub use ble::{
    AdapterState, AdvertisementPayload, AdvertisementRecord, BtleplugRadio, ConnectionDirectory,
    ConnectionState, DEVICE_INFORMATION_SERVICE, FailureReason, GattError, GattSession,
    GattSnapshot, MODEL_NUMBER_CHARACTERISTIC, Radio, RadioError, ScanError, ScanFailure,
    ScanFilter, ScanResultStore, ScanSession, ScanSettings, ScanState, ScanStatus, SessionConfig,
    SimulatedRadio, StateTransition,
};

// Config re-exports
pub use config::Settings;

// Logging re-exports
pub use logging::{LogBuffer, LogEntry, LogLevel};
