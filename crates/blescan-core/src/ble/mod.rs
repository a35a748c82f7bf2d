pub mod advertisement;
pub mod btleplug_radio;
pub mod directory;
pub mod gatt;
pub mod radio;
pub mod scanner;
pub mod simulated;
pub mod store;

use uuid::Uuid;

pub use advertisement::{AdvertisementPayload, AdvertisementRecord};
pub use btleplug_radio::BtleplugRadio;
pub use directory::ConnectionDirectory;
pub use gatt::{
    ConnectionState, FailureReason, GattError, GattEventSink, GattSession, GattSnapshot,
    ServiceMap, SessionConfig, StateTransition,
};
pub use radio::{
    AdapterState, DiscoveredService, GattEvent, GattStatus, LinkState, Radio, RadioError,
    ScanEvent, ScanEventSink, ScanFailure,
};
pub use scanner::{
    MatchMode, ScanError, ScanFilter, ScanMode, ScanSession, ScanSettings, ScanState, ScanStatus,
};
pub use simulated::{SimulatedPeripheral, SimulatedRadio};
pub use store::{ScanResultStore, UpsertOutcome};

/// Device Information 服务 (0x180A)
pub const DEVICE_INFORMATION_SERVICE: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
/// Model Number String 特征 (0x2A24)
pub const MODEL_NUMBER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
