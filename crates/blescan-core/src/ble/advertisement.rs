//! 广播记录
//!
//! 一条 BLE 广播的规范化表示。地址是去重键，名称可以缺失。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// 未广播名称时的显示文本
pub const UNNAMED: &str = "Unnamed";

/// 广播负载，在本层不做解析
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementPayload {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub service_data: HashMap<Uuid, Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_power: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementRecord {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    #[serde(default)]
    pub payload: AdvertisementPayload,
}

impl AdvertisementRecord {
    /// 构造记录，地址统一为大写，空名称视为缺失
    pub fn new(address: impl AsRef<str>, name: Option<String>) -> Self {
        Self {
            address: normalize_address(address.as_ref()),
            name: name.filter(|n| !n.trim().is_empty()),
            rssi: None,
            payload: AdvertisementPayload::default(),
        }
    }

    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: AdvertisementPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED)
    }

    /// 是否在广播中声明了指定服务
    pub fn advertises_service(&self, service: &Uuid) -> bool {
        self.payload.services.contains(service) || self.payload.service_data.contains_key(service)
    }
}

/// 地址规范化：去除首尾空白并转为大写
pub fn normalize_address(address: &str) -> String {
    address.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_normalized() {
        let record = AdvertisementRecord::new(" aa:bb:cc:dd:ee:ff ", None);
        assert_eq!(record.address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_missing_name_is_not_an_error() {
        let record = AdvertisementRecord::new("AA:01", None);
        assert_eq!(record.display_name(), UNNAMED);

        let blank = AdvertisementRecord::new("AA:02", Some("  ".to_string()));
        assert_eq!(blank.name, None);
    }

    #[test]
    fn test_advertised_service_lookup() {
        let battery = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
        let record = AdvertisementRecord::new("AA:01", Some("Tag1".into())).with_payload(
            AdvertisementPayload {
                services: vec![battery],
                ..Default::default()
            },
        );
        assert!(record.advertises_service(&battery));
        assert!(!record.advertises_service(&Uuid::nil()));
    }

    #[test]
    fn test_json_uses_camel_case() {
        let record = AdvertisementRecord::new("AA:01", Some("Tag1".into())).with_rssi(-60);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"address\":\"AA:01\""));
        assert!(json.contains("\"rssi\":-60"));
        assert!(!json.contains("manufacturerData"));
    }
}
