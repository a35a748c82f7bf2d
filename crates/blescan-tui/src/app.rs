//! Application state

use blescan_core::{
    AdvertisementRecord, ConnectionDirectory, ConnectionState, GattError, GattSession, LogBuffer,
    LogEntry, LogLevel, ScanSession, ScanState, ScanStatus, Settings,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// 日志面板最多保留的条目数
const MAX_LOGS: usize = 500;

/// 后台任务发回 UI 的事件
#[derive(Debug)]
pub enum AppEvent {
    Log(LogEntry),
    ScanToggled(Result<ScanState, String>),
    ReadCompleted {
        address: String,
        result: Result<Vec<u8>, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppMode {
    Idle,
    Scanning,
    Connecting,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tab {
    Devices,
    Connection,
    Log,
}

/// 当前连接的展示信息
#[derive(Debug, Clone)]
pub struct ConnectionView {
    pub address: String,
    pub state: ConnectionState,
    pub services: usize,
    pub value: Option<Vec<u8>>,
    pub error: Option<String>,
}

pub struct App {
    pub mode: AppMode,
    pub tab: Tab,
    pub devices: Vec<AdvertisementRecord>,
    pub selected_device: usize,
    pub logs: LogBuffer,
    pub log_level: LogLevel,
    pub status_message: String,
    pub scan_status: ScanStatus,
    pub connection: Option<ConnectionView>,
    pub settings: Settings,
    pub event_tx: mpsc::Sender<AppEvent>,
    event_rx: mpsc::Receiver<AppEvent>,
    scan: Arc<ScanSession>,
    directory: Arc<ConnectionDirectory>,
    session: Option<Arc<GattSession>>,
}

impl App {
    pub fn new(
        scan: Arc<ScanSession>,
        directory: Arc<ConnectionDirectory>,
        settings: Settings,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let log_level = LogLevel::for_verbosity(settings.verbose);
        let mut logs = LogBuffer::new(MAX_LOGS);
        logs.push(LogEntry::new(LogLevel::Info, "Blescan TUI 启动"));
        logs.push(LogEntry::new(
            LogLevel::Info,
            "按 's' 扫描设备, Enter 连接并读取, 'q' 退出",
        ));
        Self {
            mode: AppMode::Idle,
            tab: Tab::Devices,
            devices: Vec::new(),
            selected_device: 0,
            logs,
            log_level,
            status_message: "就绪".to_string(),
            scan_status: scan.status(),
            connection: None,
            settings,
            event_tx,
            event_rx,
            scan,
            directory,
            session: None,
        }
    }

    pub fn add_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry::new(level, message));
    }

    /// 当前级别下可见的日志
    pub fn visible_logs(&self) -> impl DoubleEndedIterator<Item = &LogEntry> {
        self.logs.visible(self.log_level)
    }

    pub fn toggle_log_level(&mut self) {
        self.log_level = if self.log_level == LogLevel::Debug {
            LogLevel::Info
        } else {
            LogLevel::Debug
        };
        self.status_message = format!("日志级别: {}", self.log_level);
    }

    /// 开始或停止扫描
    pub fn toggle_scan(&mut self) {
        let scan = Arc::clone(&self.scan);
        let tx = self.event_tx.clone();
        let filters = self.settings.scan_filters();
        let settings = self.settings.scan;
        let scanning = self.scan_status.is_scanning();

        self.status_message = if scanning {
            "正在停止扫描...".to_string()
        } else {
            "正在启动扫描...".to_string()
        };
        tokio::spawn(async move {
            let result = if scanning {
                Ok(scan.stop().await)
            } else {
                scan.start(filters, settings)
                    .await
                    .map_err(|e| e.to_string())
            };
            let _ = tx.send(AppEvent::ScanToggled(result)).await;
        });
    }

    pub fn clear_results(&mut self) {
        self.scan.store().clear();
        self.devices.clear();
        self.selected_device = 0;
        self.add_log(LogLevel::Info, "已清空扫描结果");
    }

    pub fn selected(&self) -> Option<&AdvertisementRecord> {
        self.devices.get(self.selected_device)
    }

    /// 连接选中的设备并读取配置的特征
    pub fn connect_selected(&mut self) {
        let Some(device) = self.selected().cloned() else {
            self.add_log(LogLevel::Warn, "无效的设备选择");
            return;
        };

        let session = self.directory.get_or_create(&device.address);
        self.session = Some(Arc::clone(&session));
        self.connection = Some(ConnectionView {
            address: device.address.clone(),
            state: session.state(),
            services: 0,
            value: None,
            error: None,
        });
        self.mode = AppMode::Connecting;
        self.tab = Tab::Connection;
        self.status_message = format!("连接到: {} ({})", device.display_name(), device.address);

        let tx = self.event_tx.clone();
        let service = self.settings.read_service;
        let characteristic = self.settings.read_characteristic;
        tokio::spawn(async move {
            let result: Result<Vec<u8>, GattError> = async {
                if session.state() == ConnectionState::Disconnected {
                    session.connect().await?;
                }
                session.wait_ready().await?;
                session.read_characteristic(service, characteristic).await
            }
            .await;
            let _ = tx
                .send(AppEvent::ReadCompleted {
                    address: device.address,
                    result: result.map_err(|e| e.to_string()),
                })
                .await;
        });
    }

    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.clone() {
            self.status_message = format!("断开: {}", session.address());
            tokio::spawn(async move {
                session.disconnect().await;
            });
        }
    }

    pub fn next_device(&mut self) {
        if !self.devices.is_empty() {
            self.selected_device = (self.selected_device + 1) % self.devices.len();
        }
    }

    pub fn previous_device(&mut self) {
        if !self.devices.is_empty() {
            self.selected_device = self
                .selected_device
                .checked_sub(1)
                .unwrap_or(self.devices.len() - 1);
        }
    }

    pub fn next_tab(&mut self) {
        self.tab = match self.tab {
            Tab::Devices => Tab::Connection,
            Tab::Connection => Tab::Log,
            Tab::Log => Tab::Devices,
        };
    }

    /// 退出前停止扫描并断开所有连接
    pub async fn shutdown(&self) {
        self.scan.stop().await;
        self.directory.disconnect_all().await;
    }

    pub fn tick(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
        }

        // 每次刷新都从存储重新取快照
        self.devices = self.scan.store().snapshot();
        if self.selected_device >= self.devices.len() {
            self.selected_device = self.devices.len().saturating_sub(1);
        }

        let status = self.scan.status();
        if status != self.scan_status {
            if let Some(failure) = status.failure
                && self.scan_status.failure != Some(failure)
            {
                self.add_log(LogLevel::Error, format!("扫描失败: {}", failure));
                self.status_message = format!("扫描失败: {}", failure);
            }
            self.scan_status = status;
        }

        if let (Some(session), Some(view)) = (&self.session, &mut self.connection) {
            let snapshot = session.snapshot();
            view.state = snapshot.state;
            view.services = snapshot.services.len();
        }

        self.mode = if self.connection.as_ref().is_some_and(|c| c.state.is_pending()) {
            AppMode::Connecting
        } else if self.scan_status.is_scanning() {
            AppMode::Scanning
        } else {
            AppMode::Idle
        };
    }

    fn handle_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Log(entry) => self.logs.push(entry),
            AppEvent::ScanToggled(Ok(ScanState::Scanning)) => {
                self.status_message = "扫描中".to_string();
            }
            AppEvent::ScanToggled(Ok(ScanState::Idle)) => {
                self.status_message = format!("扫描结束，发现 {} 个设备", self.devices.len());
            }
            AppEvent::ScanToggled(Err(e)) => {
                self.add_log(LogLevel::Error, format!("无法开始扫描: {}", e));
                self.status_message = "蓝牙不可用".to_string();
            }
            AppEvent::ReadCompleted { address, result } => {
                let Some(view) = self.connection.as_mut().filter(|c| c.address == address) else {
                    return;
                };
                match result {
                    Ok(value) => {
                        self.status_message =
                            format!("读取成功: {}", String::from_utf8_lossy(&value));
                        view.value = Some(value);
                        view.error = None;
                    }
                    Err(e) => {
                        self.status_message = format!("连接失败: {}", e);
                        view.error = Some(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blescan_core::{ScanResultStore, SessionConfig, SimulatedRadio};
    use std::time::Duration;

    fn app(radio: &Arc<SimulatedRadio>) -> App {
        let scan = Arc::new(ScanSession::new(radio.clone(), ScanResultStore::new()));
        let directory = Arc::new(ConnectionDirectory::new(
            radio.clone(),
            SessionConfig::default(),
        ));
        App::new(scan, directory, Settings::default())
    }

    async fn tick_until(app: &mut App, done: impl Fn(&App) -> bool) {
        for _ in 0..100 {
            app.tick();
            if done(app) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_scan_fills_device_list() {
        let radio = Arc::new(SimulatedRadio::demo());
        let mut app = app(&radio);

        app.toggle_scan();
        tick_until(&mut app, |app| app.mode == AppMode::Scanning).await;
        radio.spawn_advertiser(Duration::from_millis(5));
        tick_until(&mut app, |app| app.devices.len() == 3).await;

        app.previous_device();
        assert_eq!(app.selected_device, 2);
        app.next_device();
        assert_eq!(app.selected_device, 0);

        app.toggle_scan();
        tick_until(&mut app, |app| app.mode == AppMode::Idle).await;

        app.clear_results();
        app.tick();
        assert!(app.devices.is_empty());
        assert!(app.selected().is_none());
    }

    #[tokio::test]
    async fn test_connect_reads_model() {
        let radio = Arc::new(SimulatedRadio::demo());
        let mut app = app(&radio);

        app.toggle_scan();
        tick_until(&mut app, |app| app.mode == AppMode::Scanning).await;
        radio.advertise(AdvertisementRecord::new("C4:7C:8D:6A:10:89", Some("MS1089".into())));
        tick_until(&mut app, |app| !app.devices.is_empty()).await;

        app.connect_selected();
        assert_eq!(app.tab, Tab::Connection);
        tick_until(&mut app, |app| {
            app.connection.as_ref().is_some_and(|c| c.value.is_some())
        })
        .await;

        let view = app.connection.clone().unwrap();
        assert_eq!(view.state, ConnectionState::Ready);
        assert_eq!(view.value.as_deref(), Some(&b"MS1089"[..]));
        assert!(view.services > 0);

        app.disconnect();
        tick_until(&mut app, |app| {
            app.connection
                .as_ref()
                .is_some_and(|c| c.state == ConnectionState::Disconnected)
        })
        .await;
    }

    #[test]
    fn test_log_level_filtering() {
        let radio = Arc::new(SimulatedRadio::new());
        let mut app = app(&radio);

        app.add_log(LogLevel::Debug, "hidden");
        assert!(app.visible_logs().all(|e| e.message != "hidden"));

        app.toggle_log_level();
        assert_eq!(app.log_level, LogLevel::Debug);
        assert!(app.visible_logs().any(|e| e.message == "hidden"));
    }
}
