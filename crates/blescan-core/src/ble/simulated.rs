//! 模拟无线电
//!
//! 进程内的 [`Radio`] 实现，两种用法：
//!
//! - 脚本模式（[`SimulatedRadio::new`]）：只记录请求，由调用方通过
//!   [`advertise`](SimulatedRadio::advertise)、[`emit`](SimulatedRadio::emit)
//!   等方法手动注入事件，用于测试
//! - 响应模式（[`SimulatedRadio::responsive`]）：对已注册的外设自动完成
//!   连接、服务发现和读取，配合 [`spawn_advertiser`](SimulatedRadio::spawn_advertiser)
//!   在没有硬件时演示完整流程

use crate::ble::advertisement::{AdvertisementPayload, AdvertisementRecord, normalize_address};
use crate::ble::gatt::GattEventSink;
use crate::ble::radio::{
    AdapterState, DiscoveredService, GattEvent, GattStatus, LinkState, Radio, RadioError,
    ScanEvent, ScanEventSink, ScanFailure,
};
use crate::ble::scanner::{ScanFilter, ScanSettings};
use crate::ble::{DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC};
use log::debug;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 模拟外设
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub record: AdvertisementRecord,
    pub services: Vec<DiscoveredService>,
    pub values: HashMap<(Uuid, Uuid), Vec<u8>>,
}

impl SimulatedPeripheral {
    /// 带 Device Information 服务的外设，型号特征返回 `model`
    pub fn with_model(address: &str, name: Option<&str>, rssi: i16, model: &str) -> Self {
        let record = AdvertisementRecord::new(address, name.map(str::to_string))
            .with_rssi(rssi)
            .with_payload(AdvertisementPayload {
                services: vec![DEVICE_INFORMATION_SERVICE],
                ..Default::default()
            });
        let mut values = HashMap::new();
        values.insert(
            (DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC),
            model.as_bytes().to_vec(),
        );
        Self {
            record,
            services: vec![DiscoveredService {
                uuid: DEVICE_INFORMATION_SERVICE,
                characteristics: vec![MODEL_NUMBER_CHARACTERISTIC],
            }],
            values,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    connects: usize,
    discovers: usize,
    disconnects: usize,
}

#[derive(Debug)]
struct SimState {
    adapter: AdapterState,
    scan_sink: Option<ScanEventSink>,
    scan_starts: usize,
    refuse_next_scan: bool,
    refuse_next_connect: bool,
    links: HashMap<String, GattEventSink>,
    peripherals: HashMap<String, SimulatedPeripheral>,
    values: HashMap<(String, Uuid, Uuid), Vec<u8>>,
    counters: HashMap<String, Counters>,
}

#[derive(Debug)]
pub struct SimulatedRadio {
    state: Mutex<SimState>,
    responsive: bool,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    /// 脚本模式
    pub fn new() -> Self {
        Self::build(false)
    }

    /// 响应模式
    pub fn responsive() -> Self {
        Self::build(true)
    }

    /// 带几个演示外设的响应模式无线电
    pub fn demo() -> Self {
        let radio = Self::responsive();
        radio.add_peripheral(SimulatedPeripheral::with_model(
            "C4:7C:8D:6A:10:89",
            Some("MS1089"),
            -48,
            "MS1089",
        ));
        radio.add_peripheral(SimulatedPeripheral::with_model(
            "E2:15:9A:03:44:01",
            Some("Thermo Tag"),
            -63,
            "TT-2",
        ));
        radio.add_peripheral(SimulatedPeripheral::with_model(
            "5A:01:B3:7F:22:C0",
            None,
            -81,
            "unknown",
        ));
        radio
    }

    fn build(responsive: bool) -> Self {
        Self {
            state: Mutex::new(SimState {
                adapter: AdapterState::PoweredOn,
                scan_sink: None,
                scan_starts: 0,
                refuse_next_scan: false,
                refuse_next_connect: false,
                links: HashMap::new(),
                peripherals: HashMap::new(),
                values: HashMap::new(),
                counters: HashMap::new(),
            }),
            responsive,
        }
    }

    pub fn set_adapter_state(&self, adapter: AdapterState) {
        self.state.lock().adapter = adapter;
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let mut state = self.state.lock();
        for ((service, characteristic), value) in &peripheral.values {
            state.values.insert(
                (peripheral.record.address.clone(), *service, *characteristic),
                value.clone(),
            );
        }
        state
            .peripherals
            .insert(peripheral.record.address.clone(), peripheral);
    }

    pub fn set_value(&self, address: &str, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        self.state
            .lock()
            .values
            .insert((normalize_address(address), service, characteristic), value);
    }

    pub fn refuse_next_scan(&self) {
        self.state.lock().refuse_next_scan = true;
    }

    pub fn refuse_next_connect(&self) {
        self.state.lock().refuse_next_connect = true;
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan_sink.is_some()
    }

    pub fn scan_starts(&self) -> usize {
        self.state.lock().scan_starts
    }

    /// 注入一条广播，未在扫描时返回 `false`
    pub fn advertise(&self, record: AdvertisementRecord) -> bool {
        let sink = self.state.lock().scan_sink.clone();
        sink.is_some_and(|sink| sink.send(ScanEvent::Advertisement(record)))
    }

    /// 注入扫描失败
    pub fn fail_scan(&self, failure: ScanFailure) -> bool {
        let sink = self.state.lock().scan_sink.clone();
        sink.is_some_and(|sink| sink.send(ScanEvent::Failed(failure)))
    }

    /// 向该地址当前链路注入 GATT 事件，没有链路时返回 `false`
    pub fn emit(&self, address: &str, event: GattEvent) -> bool {
        self.link_sink(address)
            .is_some_and(|sink| sink.send(event))
    }

    pub fn link_sink(&self, address: &str) -> Option<GattEventSink> {
        self.state
            .lock()
            .links
            .get(&normalize_address(address))
            .cloned()
    }

    pub fn connect_requests(&self, address: &str) -> usize {
        self.counter(address, |c| c.connects)
    }

    pub fn discover_requests(&self, address: &str) -> usize {
        self.counter(address, |c| c.discovers)
    }

    pub fn disconnect_requests(&self, address: &str) -> usize {
        self.counter(address, |c| c.disconnects)
    }

    fn counter(&self, address: &str, f: impl Fn(&Counters) -> usize) -> usize {
        self.state
            .lock()
            .counters
            .get(&normalize_address(address))
            .map_or(0, f)
    }

    /// 周期性广播所有已注册外设，RSSI 带随机抖动
    pub fn spawn_advertiser(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let radio = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let records: Vec<_> = radio
                    .state
                    .lock()
                    .peripherals
                    .values()
                    .map(|p| p.record.clone())
                    .collect();
                for mut record in records {
                    let jitter = rand::thread_rng().gen_range(-4..=4);
                    record.rssi = record.rssi.map(|rssi| rssi + jitter);
                    radio.advertise(record);
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl Radio for SimulatedRadio {
    async fn adapter_state(&self) -> AdapterState {
        self.state.lock().adapter
    }

    async fn start_scan(
        &self,
        filters: &[ScanFilter],
        settings: &ScanSettings,
        sink: ScanEventSink,
    ) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.refuse_next_scan) {
            return Err(RadioError::Backend(btleplug::Error::Other(
                "simulated scan refusal".into(),
            )));
        }
        debug!(
            "Simulated scan started ({} filter(s), {:?})",
            filters.len(),
            settings
        );
        state.scan_starts += 1;
        state.scan_sink = Some(sink);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.state.lock().scan_sink = None;
        Ok(())
    }

    async fn connect(&self, address: &str, sink: GattEventSink) -> Result<(), RadioError> {
        let address = normalize_address(address);
        let mut state = self.state.lock();
        state.counters.entry(address.clone()).or_default().connects += 1;
        if std::mem::take(&mut state.refuse_next_connect) {
            return Err(RadioError::DeviceNotFound(address));
        }
        if self.responsive {
            if !state.peripherals.contains_key(&address) {
                return Err(RadioError::DeviceNotFound(address));
            }
            sink.send(GattEvent::ConnectionStateChanged {
                new_state: LinkState::Connected,
                status: GattStatus::SUCCESS,
            });
        }
        state.links.insert(address, sink);
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<(), RadioError> {
        let address = normalize_address(address);
        let mut state = self.state.lock();
        state.counters.entry(address.clone()).or_default().discovers += 1;
        let sink = state
            .links
            .get(&address)
            .cloned()
            .ok_or_else(|| RadioError::NotConnected(address.clone()))?;
        if self.responsive {
            let services = state
                .peripherals
                .get(&address)
                .map(|p| p.services.clone())
                .unwrap_or_default();
            sink.send(GattEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                services,
            });
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        let address = normalize_address(address);
        let state = self.state.lock();
        if !state.links.contains_key(&address) {
            return Err(RadioError::NotConnected(address));
        }
        state
            .values
            .get(&(address, service, characteristic))
            .cloned()
            .ok_or(RadioError::CharacteristicNotFound {
                service,
                characteristic,
            })
    }

    async fn disconnect(&self, address: &str, link: &GattEventSink) -> Result<(), RadioError> {
        let address = normalize_address(address);
        let mut state = self.state.lock();
        state.counters.entry(address.clone()).or_default().disconnects += 1;
        if state
            .links
            .get(&address)
            .is_some_and(|current| current.same_link(link))
        {
            state.links.remove(&address);
        }
        Ok(())
    }
}
