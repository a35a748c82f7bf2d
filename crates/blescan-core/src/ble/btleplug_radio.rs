//! btleplug 无线电后端
//!
//! 流程:
//! 1. `new()` 取得第一个适配器，没有适配器时立即失败
//! 2. 后台任务订阅适配器事件流，把广播转为 [`ScanEvent`]，
//!    把断开事件转发给对应链路的 [`GattEventSink`]
//! 3. 连接、服务发现在独立任务中执行，结果通过 sink 返回

use crate::ble::advertisement::{AdvertisementPayload, AdvertisementRecord, normalize_address};
use crate::ble::gatt::GattEventSink;
use crate::ble::radio::{
    AdapterState, DiscoveredService, GattEvent, GattStatus, LinkState, Radio, RadioError,
    ScanEvent, ScanEventSink, ScanFailure,
};
use crate::ble::scanner::{ScanFilter, ScanSettings};
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone)]
struct Link {
    peripheral: Peripheral,
    sink: GattEventSink,
}

#[derive(Default)]
struct Inner {
    scan_sink: Mutex<Option<ScanEventSink>>,
    links: Mutex<HashMap<String, Link>>,
}

impl Inner {
    fn link(&self, address: &str) -> Option<Link> {
        self.links.lock().get(address).cloned()
    }

    /// 链路仍属于发起它的那次连接尝试
    fn is_current(&self, address: &str, attempt: u64) -> bool {
        self.links
            .lock()
            .get(address)
            .is_some_and(|link| link.sink.attempt() == attempt)
    }
}

pub struct BtleplugRadio {
    adapter: Adapter,
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl BtleplugRadio {
    pub async fn new() -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(RadioError::NoAdapter)?;

        info!(
            "Using Bluetooth adapter: {}",
            adapter
                .adapter_info()
                .await
                .unwrap_or_else(|_| "<unknown>".to_string())
        );

        let events = adapter.events().await?;
        let inner = Arc::new(Inner::default());
        let pump = tokio::spawn(pump_events(adapter.clone(), events, Arc::clone(&inner)));

        Ok(Self {
            adapter,
            inner,
            pump,
        })
    }

    async fn find_device(&self, address: &str) -> Result<Peripheral, RadioError> {
        let peripherals = self.adapter.peripherals().await?;

        for peripheral in peripherals {
            if let Some(props) = peripheral.properties().await?
                && normalize_address(&props.address.to_string()) == address
            {
                return Ok(peripheral);
            }
        }

        Err(RadioError::DeviceNotFound(address.to_string()))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, RadioError> {
        for s in peripheral.services() {
            if s.uuid == service {
                for c in s.characteristics {
                    if c.uuid == characteristic {
                        return Ok(c);
                    }
                }
            }
        }
        Err(RadioError::CharacteristicNotFound {
            service,
            characteristic,
        })
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait::async_trait]
impl Radio for BtleplugRadio {
    async fn adapter_state(&self) -> AdapterState {
        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOff) => AdapterState::PoweredOff,
            // 部分平台无法报告电源状态，按可用处理
            Ok(_) => AdapterState::PoweredOn,
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                AdapterState::Absent
            }
        }
    }

    async fn start_scan(
        &self,
        filters: &[ScanFilter],
        settings: &ScanSettings,
        sink: ScanEventSink,
    ) -> Result<(), RadioError> {
        // 只有每个过滤条件都限定了服务时才能下发给硬件，否则在上层过滤
        let services: Vec<Uuid> = if filters.iter().all(|f| f.service.is_some()) {
            filters.iter().filter_map(|f| f.service).collect()
        } else {
            Vec::new()
        };
        debug!(
            "Starting btleplug scan (services={:?}); mode {:?}/{:?} is advisory on this backend",
            services, settings.mode, settings.match_mode
        );

        *self.inner.scan_sink.lock() = Some(sink);
        if let Err(e) = self
            .adapter
            .start_scan(btleplug::api::ScanFilter { services })
            .await
        {
            *self.inner.scan_sink.lock() = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        let was_scanning = self.inner.scan_sink.lock().take().is_some();
        if was_scanning {
            self.adapter.stop_scan().await?;
        }
        Ok(())
    }

    async fn connect(&self, address: &str, sink: GattEventSink) -> Result<(), RadioError> {
        let address = normalize_address(address);
        let peripheral = self.find_device(&address).await?;
        let attempt = sink.attempt();

        self.inner.links.lock().insert(
            address.clone(),
            Link {
                peripheral: peripheral.clone(),
                sink: sink.clone(),
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) if inner.is_current(&address, attempt) => {
                    sink.send(GattEvent::ConnectionStateChanged {
                        new_state: LinkState::Connected,
                        status: GattStatus::SUCCESS,
                    });
                }
                Ok(()) => {
                    // 连接完成前会话已拆除
                    debug!("Dropping late connection to {}", address);
                    let _ = peripheral.disconnect().await;
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", address, e);
                    sink.send(GattEvent::ConnectFailed {
                        status: GattStatus::ERROR,
                    });
                }
            }
        });
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<(), RadioError> {
        let address = normalize_address(address);
        let link = self
            .inner
            .link(&address)
            .ok_or_else(|| RadioError::NotConnected(address.clone()))?;

        tokio::spawn(async move {
            let event = match link.peripheral.discover_services().await {
                Ok(()) => GattEvent::ServicesDiscovered {
                    status: GattStatus::SUCCESS,
                    services: link
                        .peripheral
                        .services()
                        .into_iter()
                        .map(|s| DiscoveredService {
                            uuid: s.uuid,
                            characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
                        })
                        .collect(),
                },
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", address, e);
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::FAILURE,
                        services: Vec::new(),
                    }
                }
            };
            link.sink.send(event);
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        let address = normalize_address(address);
        let link = self
            .inner
            .link(&address)
            .ok_or(RadioError::NotConnected(address))?;
        let c = Self::find_characteristic(&link.peripheral, service, characteristic)?;
        Ok(link.peripheral.read(&c).await?)
    }

    async fn disconnect(&self, address: &str, link: &GattEventSink) -> Result<(), RadioError> {
        let address = normalize_address(address);
        let owned = {
            let mut links = self.inner.links.lock();
            if links.get(&address).is_some_and(|l| l.sink.same_link(link)) {
                links.remove(&address)
            } else {
                None
            }
        };
        if let Some(owned) = owned
            && owned.peripheral.is_connected().await.unwrap_or(true)
        {
            owned.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

async fn pump_events(
    adapter: Adapter,
    mut events: std::pin::Pin<Box<dyn futures_util::Stream<Item = CentralEvent> + Send>>,
    inner: Arc<Inner>,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                let Some(sink) = inner.scan_sink.lock().clone() else {
                    continue;
                };
                if let Some(record) = advertisement_for(&adapter, &id).await {
                    trace!("Advertisement from {}", record.address);
                    sink.send(ScanEvent::Advertisement(record));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let link = {
                    let mut links = inner.links.lock();
                    let address = links
                        .iter()
                        .find(|(_, link)| link.peripheral.id() == id)
                        .map(|(address, _)| address.clone());
                    address.and_then(|address| links.remove(&address))
                };
                if let Some(link) = link {
                    link.sink.send(GattEvent::ConnectionStateChanged {
                        new_state: LinkState::Disconnected,
                        status: GattStatus::SUCCESS,
                    });
                }
            }
            CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                warn!("Bluetooth adapter powered off");
                if let Some(sink) = inner.scan_sink.lock().take() {
                    sink.send(ScanEvent::Failed(ScanFailure::InternalError));
                }
                let links: Vec<_> = inner.links.lock().drain().map(|(_, l)| l).collect();
                for link in links {
                    link.sink.send(GattEvent::ConnectionStateChanged {
                        new_state: LinkState::Disconnected,
                        status: GattStatus::ERROR,
                    });
                }
            }
            _ => {}
        }
    }

    warn!("Adapter event stream ended");
    if let Some(sink) = inner.scan_sink.lock().take() {
        sink.send(ScanEvent::Failed(ScanFailure::InternalError));
    }
}

async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Option<AdvertisementRecord> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let props = peripheral.properties().await.ok()??;

    let mut record = AdvertisementRecord::new(props.address.to_string(), props.local_name)
        .with_payload(AdvertisementPayload {
            manufacturer_data: props.manufacturer_data,
            service_data: props.service_data,
            services: props.services,
            tx_power: props.tx_power_level,
        });
    record.rssi = props.rssi;
    Some(record)
}
