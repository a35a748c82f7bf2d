//! 集成测试 - 扫描、连接与读取的完整流程
//!
//! 通过模拟无线电驱动 blescan-core 的公开接口。

use blescan_core::ble::{GattEvent, GattStatus, LinkState, SimulatedPeripheral};
use blescan_core::{
    AdvertisementRecord, ConnectionDirectory, ConnectionState, DEVICE_INFORMATION_SERVICE,
    FailureReason, GattError, MODEL_NUMBER_CHARACTERISTIC, ScanFailure, ScanFilter,
    ScanResultStore, ScanSession, ScanSettings, ScanState, SessionConfig, Settings,
    SimulatedRadio,
};
use std::sync::Arc;
use std::time::Duration;

const MS1089: &str = "C4:7C:8D:6A:10:89";

async fn wait_for_devices(store: &ScanResultStore, count: usize) {
    let mut rx = store.subscribe();
    let store = store.clone();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|_| store.len() >= count))
        .await
        .expect("devices not discovered in time")
        .unwrap();
}

/// 测试扫描到读取型号的完整流程
///
/// 扫描 → 从列表选择设备 → 连接 → 服务发现 → 读取 → 断开
#[tokio::test]
async fn test_scan_connect_and_read_model() {
    let radio = Arc::new(SimulatedRadio::demo());
    let store = ScanResultStore::new();
    let scan = ScanSession::new(radio.clone(), store.clone());

    // 1. 扫描并等待所有演示外设出现
    assert_eq!(
        scan.start(None, ScanSettings::default()).await.unwrap(),
        ScanState::Scanning
    );
    let advertiser = radio.spawn_advertiser(Duration::from_millis(10));
    wait_for_devices(&store, 3).await;
    advertiser.abort();
    assert_eq!(scan.stop().await, ScanState::Idle);

    // 2. 从快照中选择目标设备
    let devices = store.snapshot();
    assert_eq!(devices.len(), 3);
    let target = devices
        .iter()
        .find(|d| d.name.as_deref() == Some("MS1089"))
        .unwrap();
    assert_eq!(target.address, MS1089);
    assert!(devices.iter().any(|d| d.display_name() == "Unnamed"));

    // 3. 通过连接目录连接并等待就绪
    let directory = ConnectionDirectory::new(radio.clone(), SessionConfig::default());
    let session = directory.connect(&target.address).await.unwrap();
    let services = session.wait_ready().await.unwrap();
    assert!(services[&DEVICE_INFORMATION_SERVICE].contains(&MODEL_NUMBER_CHARACTERISTIC));

    // 4. 读取型号
    let model = session
        .read_characteristic(DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC)
        .await
        .unwrap();
    assert_eq!(model, b"MS1089");

    // 5. 断开后不可再读取
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(matches!(
        session
            .read_characteristic(DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC)
            .await,
        Err(GattError::NotReady { .. })
    ));
    assert_eq!(radio.disconnect_requests(MS1089), 1);
}

/// 测试扫描失败后已发现的设备仍保留
#[tokio::test]
async fn test_scan_failure_keeps_results() {
    let radio = Arc::new(SimulatedRadio::new());
    let store = ScanResultStore::new();
    let scan = ScanSession::new(radio.clone(), store.clone());

    scan.start(None, ScanSettings::default()).await.unwrap();
    assert!(radio.advertise(AdvertisementRecord::new("AA:01", Some("A".into())).with_rssi(-50)));
    wait_for_devices(&store, 1).await;

    let mut status = scan.subscribe();
    assert!(radio.fail_scan(ScanFailure::ScanningTooFrequently));
    let failed = tokio::time::timeout(Duration::from_secs(1), status.wait_for(|s| !s.is_scanning()))
        .await
        .unwrap()
        .unwrap()
        .clone();

    assert_eq!(failed.failure, Some(ScanFailure::ScanningTooFrequently));
    assert_eq!(store.len(), 1);
    assert!(!radio.is_scanning());

    // 可以重新开始扫描，失败原因被清除
    scan.start(None, ScanSettings::default()).await.unwrap();
    assert_eq!(scan.status().failure, None);
    assert_eq!(radio.scan_starts(), 2);
    scan.stop().await;
}

/// 测试设置中的过滤条件作用于扫描结果
#[tokio::test]
async fn test_settings_filters_apply_to_scan() {
    let radio = Arc::new(SimulatedRadio::new());
    let store = ScanResultStore::new();
    let scan = ScanSession::new(radio.clone(), store.clone());

    let settings = Settings {
        filters: vec![ScanFilter::by_name("MS1089")],
        ..Default::default()
    };
    scan.start(settings.scan_filters(), settings.scan)
        .await
        .unwrap();

    radio.advertise(AdvertisementRecord::new("AA:01", Some("Other".into())));
    radio.advertise(AdvertisementRecord::new(MS1089, Some("MS1089".into())).with_rssi(-40));
    wait_for_devices(&store, 1).await;
    scan.stop().await;

    let devices = store.snapshot();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address, MS1089);
}

/// 测试清空结果列表后重新发现设备
#[tokio::test]
async fn test_clear_results_during_scan() {
    let radio = Arc::new(SimulatedRadio::new());
    let store = ScanResultStore::new();
    let scan = ScanSession::new(radio.clone(), store.clone());

    scan.start(None, ScanSettings::default()).await.unwrap();
    radio.advertise(AdvertisementRecord::new("AA:01", None));
    radio.advertise(AdvertisementRecord::new("AA:02", None));
    wait_for_devices(&store, 2).await;

    store.clear();
    assert!(store.is_empty());

    radio.advertise(AdvertisementRecord::new("AA:02", Some("Back".into())));
    wait_for_devices(&store, 1).await;
    scan.stop().await;

    let devices = store.snapshot();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].display_name(), "Back");
}

/// 测试链路丢失后连接目录创建新会话
#[tokio::test]
async fn test_reconnect_after_link_loss() {
    let radio = Arc::new(SimulatedRadio::responsive());
    radio.add_peripheral(SimulatedPeripheral::with_model(
        MS1089,
        Some("MS1089"),
        -48,
        "MS1089",
    ));
    let directory = ConnectionDirectory::new(radio.clone(), SessionConfig::default());

    let first = directory.connect(MS1089).await.unwrap();
    first.wait_ready().await.unwrap();

    // 外设主动断开
    let mut rx = first.subscribe();
    assert!(radio.emit(
        MS1089,
        GattEvent::ConnectionStateChanged {
            new_state: LinkState::Disconnected,
            status: GattStatus::SUCCESS,
        },
    ));
    tokio::time::timeout(
        Duration::from_secs(1),
        rx.wait_for(|s| s.state == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(first.snapshot().services.is_empty());

    let second = directory.connect(MS1089).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    second.wait_ready().await.unwrap();
    assert_eq!(radio.connect_requests(MS1089), 2);
}

/// 测试连接未知设备时会话进入失败状态
#[tokio::test]
async fn test_connect_unknown_device_fails() {
    let radio = Arc::new(SimulatedRadio::responsive());
    let directory = ConnectionDirectory::new(radio.clone(), SessionConfig::default());

    let session = directory.connect("00:11:22:33:44:55").await.unwrap();
    let err = session.wait_ready().await.unwrap_err();
    assert!(matches!(
        err,
        GattError::SessionFailed(FailureReason::ConnectFailed(_))
    ));
    assert!(session.is_retired());
}

/// 测试扫描记录的 JSON 输出格式
#[test]
fn test_record_json_format() {
    let record = AdvertisementRecord::new("c4:7c:8d:6a:10:89", Some("MS1089".into())).with_rssi(-48);
    let json = serde_json::to_value(&record).unwrap();

    assert_eq!(json["address"], MS1089);
    assert_eq!(json["name"], "MS1089");
    assert_eq!(json["rssi"], -48);
}
