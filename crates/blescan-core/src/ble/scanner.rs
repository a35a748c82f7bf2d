//! BLE Scanner - 扫描会话
//!
//! [`ScanSession`] 负责无线电扫描的启动与停止，把收到的广播送入
//! [`ScanResultStore`]。
//!
//! # 状态机
//!
//! `Idle → Scanning → Idle`（停止或失败时回到 Idle）
//!
//! - 重复调用 `start` 是空操作，返回当前的 `Scanning` 状态
//! - 扫描失败以 [`ScanStatus::failure`] 通知调用方，不自动重试
//! - 失败或停止都不会清空已发现的设备列表
//! - 会话被丢弃时停止正在进行的扫描

use crate::ble::advertisement::{AdvertisementRecord, normalize_address};
use crate::ble::radio::{Radio, ScanEvent, ScanEventSink, ScanFailure};
use crate::ble::store::ScanResultStore;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 扫描功耗模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

/// 匹配模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatchMode {
    /// 信号较弱时也尽快上报
    Aggressive,
    /// 需要更强的信号和更多次命中才上报
    #[default]
    Sticky,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default)]
    pub mode: ScanMode,
    #[serde(default)]
    pub match_mode: MatchMode,
}

/// 扫描过滤条件，所有已设置的字段都必须匹配
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Uuid>,
}

impl ScanFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_service(service: Uuid) -> Self {
        Self {
            service: Some(service),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &AdvertisementRecord) -> bool {
        if let Some(name) = &self.name
            && record.name.as_deref() != Some(name.as_str())
        {
            return false;
        }
        if let Some(address) = &self.address
            && normalize_address(address) != record.address
        {
            return false;
        }
        if let Some(service) = &self.service
            && !record.advertises_service(service)
        {
            return false;
        }
        true
    }

    /// 过滤列表为空时全部放行，否则任一条件匹配即放行
    pub fn any_matches(filters: &[ScanFilter], record: &AdvertisementRecord) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(record))
    }
}

/// 扫描会话错误
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Bluetooth radio unavailable (no adapter or adapter disabled)")]
    RadioUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

/// 对外发布的扫描状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStatus {
    pub state: ScanState,
    /// 最近一次扫描的失败原因，新的扫描开始时清除
    pub failure: Option<ScanFailure>,
    /// 已启动的扫描次数，用于区分不同轮次
    pub scan_id: u64,
}

impl ScanStatus {
    pub fn is_scanning(&self) -> bool {
        self.state == ScanState::Scanning
    }
}

struct ActiveScan {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ScanSession {
    radio: Arc<dyn Radio>,
    store: ScanResultStore,
    control: Mutex<Option<ActiveScan>>,
    status: Arc<watch::Sender<ScanStatus>>,
}

impl ScanSession {
    pub fn new(radio: Arc<dyn Radio>, store: ScanResultStore) -> Self {
        let (status, _) = watch::channel(ScanStatus {
            state: ScanState::Idle,
            failure: None,
            scan_id: 0,
        });
        Self {
            radio,
            store,
            control: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub fn store(&self) -> &ScanResultStore {
        &self.store
    }

    pub fn status(&self) -> ScanStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.subscribe()
    }

    /// 开始扫描
    ///
    /// 已在扫描时不做任何事，直接返回 `Scanning`。
    pub async fn start(
        &self,
        filters: Option<Vec<ScanFilter>>,
        settings: ScanSettings,
    ) -> Result<ScanState, ScanError> {
        let mut control = self.control.lock().await;

        if self.status().is_scanning() {
            debug!("Scan already active, ignoring start request");
            return Ok(ScanState::Scanning);
        }

        // 上一轮因失败自行结束，这里只回收句柄
        if let Some(previous) = control.take() {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        let adapter = self.radio.adapter_state().await;
        if !adapter.is_available() {
            warn!("Cannot start scan: adapter state is {:?}", adapter);
            return Err(ScanError::RadioUnavailable);
        }

        let filters = filters.unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut scan_id = 0;
        self.status.send_modify(|status| {
            status.scan_id += 1;
            status.state = ScanState::Scanning;
            status.failure = None;
            scan_id = status.scan_id;
        });

        if let Err(e) = self
            .radio
            .start_scan(&filters, &settings, ScanEventSink::new(tx))
            .await
        {
            warn!("Radio refused to start scan: {}", e);
            let failure = match e {
                crate::ble::radio::RadioError::NoAdapter
                | crate::ble::radio::RadioError::AdapterOff => {
                    ScanFailure::ApplicationRegistrationFailed
                }
                _ => ScanFailure::InternalError,
            };
            finish_scan(&self.status, scan_id, Some(failure));
            return Ok(ScanState::Idle);
        }

        info!(
            "BLE scan started (mode={:?}, match={:?}, {} filter(s))",
            settings.mode,
            settings.match_mode,
            filters.len()
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(drain_events(
            rx,
            filters,
            self.store.clone(),
            Arc::clone(&self.status),
            Arc::clone(&self.radio),
            cancel.clone(),
            scan_id,
        ));
        *control = Some(ActiveScan { cancel, task });

        Ok(ScanState::Scanning)
    }

    /// 停止扫描，可重复调用
    ///
    /// 返回时事件循环已退出，不会再有记录写入存储。
    pub async fn stop(&self) -> ScanState {
        let mut control = self.control.lock().await;
        let Some(active) = control.take() else {
            return ScanState::Idle;
        };

        active.cancel.cancel();
        let _ = active.task.await;

        let scan_id = self.status().scan_id;
        if self.status().is_scanning() {
            if let Err(e) = self.radio.stop_scan().await {
                warn!("Failed to stop radio scan: {}", e);
            }
            finish_scan(&self.status, scan_id, None);
            info!("BLE scan stopped ({} device(s) listed)", self.store.len());
        }
        ScanState::Idle
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        let Some(active) = self.control.get_mut().take() else {
            return;
        };
        active.cancel.cancel();

        let scan_id = self.status().scan_id;
        if !self.status().is_scanning() {
            return;
        }
        finish_scan(&self.status, scan_id, None);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let radio = Arc::clone(&self.radio);
            handle.spawn(async move {
                if let Err(e) = radio.stop_scan().await {
                    debug!("stop_scan on drop: {}", e);
                }
            });
        }
    }
}

fn finish_scan(status: &watch::Sender<ScanStatus>, scan_id: u64, failure: Option<ScanFailure>) {
    status.send_if_modified(|status| {
        if status.scan_id != scan_id || !status.is_scanning() {
            return false;
        }
        status.state = ScanState::Idle;
        status.failure = failure;
        true
    });
}

async fn drain_events(
    mut rx: mpsc::UnboundedReceiver<ScanEvent>,
    filters: Vec<ScanFilter>,
    store: ScanResultStore,
    status: Arc<watch::Sender<ScanStatus>>,
    radio: Arc<dyn Radio>,
    cancel: CancellationToken,
    scan_id: u64,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };

        match event {
            Some(ScanEvent::Advertisement(record)) => {
                if !ScanFilter::any_matches(&filters, &record) {
                    continue;
                }
                let name = record.display_name().to_string();
                let address = record.address.clone();
                if store.upsert(record).is_new() {
                    info!("Found BLE device! Name: {}, address: {}", name, address);
                }
            }
            Some(ScanEvent::Failed(failure)) => {
                warn!("BLE scan failed with error code: {}", failure.code());
                if let Err(e) = radio.stop_scan().await {
                    debug!("stop_scan after failure: {}", e);
                }
                finish_scan(&status, scan_id, Some(failure));
                break;
            }
            None => {
                // 无线电层丢弃了 sink，视为内部错误
                warn!("Scan event stream closed unexpectedly");
                finish_scan(&status, scan_id, Some(ScanFailure::InternalError));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::radio::AdapterState;
    use crate::ble::simulated::SimulatedRadio;
    use std::time::Duration;

    fn tag(address: &str, name: &str) -> AdvertisementRecord {
        AdvertisementRecord::new(address, Some(name.to_string()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_filter_matching() {
        let record = tag("AA:01", "MS1089");
        assert!(ScanFilter::by_name("MS1089").matches(&record));
        assert!(!ScanFilter::by_name("Other").matches(&record));

        let by_addr = ScanFilter {
            address: Some("aa:01".into()),
            ..Default::default()
        };
        assert!(by_addr.matches(&record));
        assert!(ScanFilter::any_matches(&[], &record));
        assert!(ScanFilter::any_matches(
            &[ScanFilter::by_name("x"), ScanFilter::by_name("MS1089")],
            &record
        ));
    }

    #[tokio::test]
    async fn test_start_requires_radio() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.set_adapter_state(AdapterState::PoweredOff);
        let session = ScanSession::new(radio.clone(), ScanResultStore::new());

        let err = session.start(None, ScanSettings::default()).await;
        assert!(matches!(err, Err(ScanError::RadioUnavailable)));
        assert!(!session.status().is_scanning());

        radio.set_adapter_state(AdapterState::Absent);
        let err = session.start(None, ScanSettings::default()).await;
        assert!(matches!(err, Err(ScanError::RadioUnavailable)));
    }

    #[tokio::test]
    async fn test_second_start_is_a_no_op() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = ScanSession::new(radio.clone(), ScanResultStore::new());

        let first = session.start(None, ScanSettings::default()).await.unwrap();
        let second = session.start(None, ScanSettings::default()).await.unwrap();
        assert_eq!(first, ScanState::Scanning);
        assert_eq!(second, ScanState::Scanning);
        assert_eq!(radio.scan_starts(), 1);
        assert_eq!(session.status().scan_id, 1);
    }

    #[tokio::test]
    async fn test_advertisements_reach_store() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = ScanSession::new(radio.clone(), ScanResultStore::new());
        session.start(None, ScanSettings::default()).await.unwrap();

        assert!(radio.advertise(tag("AA:01", "Tag1")));
        assert!(radio.advertise(tag("AA:02", "Tag2")));
        assert!(radio.advertise(tag("AA:01", "Tag1-renamed")));
        settle().await;

        let snapshot = session.store().snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name.as_deref(), Some("Tag1-renamed"));
        assert_eq!(snapshot[1].address, "AA:02");
    }

    #[tokio::test]
    async fn test_filters_are_applied() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = ScanSession::new(radio.clone(), ScanResultStore::new());
        session
            .start(
                Some(vec![ScanFilter::by_name("MS1089")]),
                ScanSettings::default(),
            )
            .await
            .unwrap();

        radio.advertise(tag("AA:01", "MS1089"));
        radio.advertise(tag("AA:02", "Other"));
        radio.advertise(AdvertisementRecord::new("AA:03", None));
        settle().await;

        let snapshot = session.store().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, "AA:01");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = ScanSession::new(radio.clone(), ScanResultStore::new());
        assert_eq!(session.stop().await, ScanState::Idle);

        session.start(None, ScanSettings::default()).await.unwrap();
        radio.advertise(tag("AA:01", "Tag1"));
        settle().await;

        assert_eq!(session.stop().await, ScanState::Idle);
        assert_eq!(session.stop().await, ScanState::Idle);
        assert!(!radio.is_scanning());

        // 停止后迟到的广播不会写入
        assert!(!radio.advertise(tag("AA:02", "late")));
        settle().await;
        assert_eq!(session.store().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_failure_is_terminal() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = ScanSession::new(radio.clone(), ScanResultStore::new());
        let mut status_rx = session.subscribe();

        session.start(None, ScanSettings::default()).await.unwrap();
        radio.advertise(tag("AA:01", "Tag1"));
        radio.fail_scan(ScanFailure::OutOfHardwareResources);

        status_rx
            .wait_for(|s| !s.is_scanning())
            .await
            .expect("status channel closed");
        let status = session.status();
        assert_eq!(status.failure, Some(ScanFailure::OutOfHardwareResources));
        // 已有结果保留
        assert_eq!(session.store().len(), 1);

        // 不会自动重试，需要调用方再次 start
        settle().await;
        assert_eq!(radio.scan_starts(), 1);
        assert_eq!(
            session.start(None, ScanSettings::default()).await.unwrap(),
            ScanState::Scanning
        );
        assert_eq!(session.status().failure, None);
        assert_eq!(session.status().scan_id, 2);
    }

    #[tokio::test]
    async fn test_drop_stops_active_scan() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = ScanSession::new(radio.clone(), ScanResultStore::new());
        let store = session.store().clone();
        let mut status_rx = session.subscribe();

        session.start(None, ScanSettings::default()).await.unwrap();
        radio.advertise(tag("AA:01", "Tag1"));
        settle().await;
        assert_eq!(store.len(), 1);

        drop(session);
        settle().await;

        assert!(!radio.is_scanning());
        assert!(!radio.advertise(tag("AA:09", "ghost")));
        settle().await;
        assert_eq!(store.len(), 1);
        assert!(!status_rx.borrow_and_update().is_scanning());
    }

    #[tokio::test]
    async fn test_backend_refusal_reports_failure() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.refuse_next_scan();
        let session = ScanSession::new(radio.clone(), ScanResultStore::new());

        let state = session.start(None, ScanSettings::default()).await.unwrap();
        assert_eq!(state, ScanState::Idle);
        assert_eq!(session.status().failure, Some(ScanFailure::InternalError));
    }
}
