//! GATT 会话
//!
//! 单个设备的连接生命周期：连接 → 发现服务 → 读取特征 → 断开，
//! 以显式状态机表达。
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──connected──▶ Connected ──▶ DiscoveringServices
//!      ▲                         │                                        │        │
//!      │                         ▼ error / timeout                 success│        │error
//!      │                       Failed ◀───────────────────────────────────┼────────┘
//!      │                         │                                        ▼
//!      └──────── disconnected / disconnect() ◀──────────────────────── Ready
//! ```
//!
//! 无线电回调经由 [`GattEventSink`] 进入会话自己的队列，由单个任务按序处理。
//! 每次状态变化都是一次原子的 `watch` 更新，观察者不会看到中间状态。

use crate::ble::radio::{DiscoveredService, GattEvent, GattStatus, LinkState, Radio, RadioError};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 服务 UUID → 特征 UUID 集合
pub type ServiceMap = BTreeMap<Uuid, BTreeSet<Uuid>>;

const TRANSITION_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ConnectFailed(GattStatus),
    ConnectTimeout,
    DiscoveryFailed(GattStatus),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ConnectFailed(status) => write!(f, "connect failed (status {status})"),
            FailureReason::ConnectTimeout => write!(f, "connect timed out"),
            FailureReason::DiscoveryFailed(status) => {
                write!(f, "service discovery failed (status {status})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
    Failed(FailureReason),
}

impl ConnectionState {
    pub fn is_failed(self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    /// 连接尝试进行中，尚未就绪也未结束
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::DiscoveringServices
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::DiscoveringServices => write!(f, "DiscoveringServices"),
            ConnectionState::Ready => write!(f, "Ready"),
            ConnectionState::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// 会话在某一时刻的完整状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattSnapshot {
    pub address: String,
    pub state: ConnectionState,
    /// 仅在 `Ready` 状态下非空
    pub services: ServiceMap,
    /// 连接尝试与拆除的计数，用于丢弃过期事件
    pub attempt: u64,
}

/// 一次状态转换，按发生顺序广播
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub attempt: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// GATT 会话错误
#[derive(Debug, thiserror::Error)]
pub enum GattError {
    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    #[error("Operation not allowed in state {0}")]
    InvalidState(ConnectionState),

    #[error("Session not ready (state: {state})")]
    NotReady { state: ConnectionState },

    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("Session failed: {0}")]
    SessionFailed(FailureReason),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
}

#[derive(Debug)]
pub(crate) enum SessionMessage {
    Radio { attempt: u64, event: GattEvent },
    ConnectDeadline { attempt: u64 },
}

/// 交给无线电层的事件投递端，绑定到一次连接尝试
#[derive(Debug, Clone)]
pub struct GattEventSink {
    attempt: u64,
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl GattEventSink {
    pub fn send(&self, event: GattEvent) -> bool {
        self.tx
            .send(SessionMessage::Radio {
                attempt: self.attempt,
                event,
            })
            .is_ok()
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// 与 `other` 来自同一会话的同一次尝试
    pub fn same_link(&self, other: &GattEventSink) -> bool {
        self.attempt == other.attempt && self.tx.same_channel(&other.tx)
    }
}

struct Shared {
    address: String,
    radio: Arc<dyn Radio>,
    config: SessionConfig,
    snapshot: watch::Sender<GattSnapshot>,
    transitions: broadcast::Sender<StateTransition>,
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl Shared {
    /// 原子地应用一次状态转换
    ///
    /// `f` 返回新状态表示发生转换；离开 `Ready` 时清空服务表。
    fn update(&self, f: impl FnOnce(&mut GattSnapshot) -> Option<ConnectionState>) -> bool {
        self.snapshot.send_if_modified(|snap| {
            let from = snap.state;
            let Some(to) = f(snap) else {
                return false;
            };
            snap.state = to;
            if to != ConnectionState::Ready {
                snap.services.clear();
            }
            debug!("[{}] {} -> {}", snap.address, from, to);
            let _ = self.transitions.send(StateTransition {
                from,
                to,
                attempt: snap.attempt,
            });
            true
        })
    }

    /// 仅当仍处于同一次尝试且状态为 `from` 时转换
    fn advance(&self, attempt: u64, from: ConnectionState, to: ConnectionState) -> bool {
        self.update(|snap| (snap.attempt == attempt && snap.state == from).then_some(to))
    }

    fn current_attempt(&self) -> u64 {
        self.snapshot.borrow().attempt
    }

    fn sink(&self, attempt: u64) -> GattEventSink {
        GattEventSink {
            attempt,
            tx: self.tx.clone(),
        }
    }

    /// 释放第 `attempt` 次尝试建立的链路
    async fn release_link(&self, attempt: u64) {
        let link = self.sink(attempt);
        if let Err(e) = self.radio.disconnect(&self.address, &link).await {
            debug!("[{}] release link: {}", self.address, e);
        }
    }

    async fn fail(&self, attempt: u64, from: ConnectionState, reason: FailureReason) {
        if self.advance(attempt, from, ConnectionState::Failed(reason)) {
            warn!("[{}] {}", self.address, reason);
            self.release_link(attempt).await;
        }
    }

    async fn handle_event(&self, attempt: u64, event: GattEvent) {
        match event {
            GattEvent::ConnectionStateChanged {
                new_state: LinkState::Connected,
                status,
            } if status.is_success() => {
                if !self.advance(
                    attempt,
                    ConnectionState::Connecting,
                    ConnectionState::Connected,
                ) {
                    debug!("[{}] Ignoring connected event", self.address);
                    return;
                }
                info!("[{}] Connected, discovering services", self.address);
                if self.advance(
                    attempt,
                    ConnectionState::Connected,
                    ConnectionState::DiscoveringServices,
                ) && let Err(e) = self.radio.discover_services(&self.address).await
                {
                    warn!("[{}] Service discovery request failed: {}", self.address, e);
                    self.fail(
                        attempt,
                        ConnectionState::DiscoveringServices,
                        FailureReason::DiscoveryFailed(GattStatus::FAILURE),
                    )
                    .await;
                }
            }
            GattEvent::ConnectionStateChanged {
                new_state: LinkState::Connected,
                status,
            }
            | GattEvent::ConnectFailed { status } => {
                self.fail(
                    attempt,
                    ConnectionState::Connecting,
                    FailureReason::ConnectFailed(status),
                )
                .await;
            }
            GattEvent::ConnectionStateChanged {
                new_state: LinkState::Disconnected,
                status,
            } => {
                let changed = self.update(|snap| {
                    (snap.attempt == attempt && snap.state != ConnectionState::Disconnected)
                        .then_some(ConnectionState::Disconnected)
                });
                if changed {
                    info!("[{}] Disconnected (status {})", self.address, status);
                    self.release_link(attempt).await;
                }
            }
            GattEvent::ServicesDiscovered { status, services } => {
                if !status.is_success() {
                    self.fail(
                        attempt,
                        ConnectionState::DiscoveringServices,
                        FailureReason::DiscoveryFailed(status),
                    )
                    .await;
                    return;
                }
                let count = services.len();
                let ready = self.update(|snap| {
                    if snap.attempt != attempt
                        || snap.state != ConnectionState::DiscoveringServices
                    {
                        return None;
                    }
                    snap.services = build_service_map(services);
                    Some(ConnectionState::Ready)
                });
                if ready {
                    info!("[{}] Services discovered ({} service(s))", self.address, count);
                } else {
                    debug!("[{}] Ignoring services-discovered event", self.address);
                }
            }
        }
    }
}

fn build_service_map(services: Vec<DiscoveredService>) -> ServiceMap {
    let mut map = ServiceMap::new();
    for service in services {
        map.entry(service.uuid)
            .or_default()
            .extend(service.characteristics);
    }
    map
}

/// 单个设备的 GATT 会话
///
/// 必须在 tokio 运行时内创建；会话被丢弃时事件循环随之结束并释放链路。
pub struct GattSession {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl GattSession {
    pub fn new(address: impl AsRef<str>, radio: Arc<dyn Radio>, config: SessionConfig) -> Self {
        let address = crate::ble::advertisement::normalize_address(address.as_ref());
        let (snapshot, _) = watch::channel(GattSnapshot {
            address: address.clone(),
            state: ConnectionState::Disconnected,
            services: ServiceMap::new(),
            attempt: 0,
        });
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            address,
            radio,
            config,
            snapshot,
            transitions,
            tx,
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(run_session(Arc::clone(&shared), rx, shutdown.clone()));

        Self { shared, shutdown }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> GattSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GattSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.transitions.subscribe()
    }

    /// 会话已失败，或在至少一次连接之后回到了 `Disconnected`
    pub fn is_retired(&self) -> bool {
        let snap = self.shared.snapshot.borrow();
        snap.state.is_failed() || (snap.state == ConnectionState::Disconnected && snap.attempt > 0)
    }

    /// 发起连接
    ///
    /// 只负责发出请求；连接结果通过状态变化通知。
    pub async fn connect(&self) -> Result<(), GattError> {
        let shared = &self.shared;
        if !shared.radio.adapter_state().await.is_available() {
            warn!("[{}] Bluetooth is not enabled", shared.address);
            return Err(GattError::AdapterDisabled);
        }

        let mut attempt = 0;
        let mut current = ConnectionState::Disconnected;
        let started = shared.update(|snap| {
            current = snap.state;
            if snap.state != ConnectionState::Disconnected {
                return None;
            }
            snap.attempt += 1;
            attempt = snap.attempt;
            Some(ConnectionState::Connecting)
        });
        if !started {
            return Err(GattError::InvalidState(current));
        }

        info!("[{}] Connecting (attempt {})", shared.address, attempt);
        self.arm_connect_deadline(attempt);

        if let Err(e) = shared.radio.connect(&shared.address, shared.sink(attempt)).await {
            warn!("[{}] Connect request rejected: {}", shared.address, e);
            shared
                .fail(
                    attempt,
                    ConnectionState::Connecting,
                    FailureReason::ConnectFailed(GattStatus::FAILURE),
                )
                .await;
        }
        Ok(())
    }

    fn arm_connect_deadline(&self, attempt: u64) {
        let tx = self.shared.tx.clone();
        let timeout = self.shared.config.connect_timeout;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    let _ = tx.send(SessionMessage::ConnectDeadline { attempt });
                }
            }
        });
    }

    /// 读取特征值，仅在 `Ready` 状态下可用
    pub async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, GattError> {
        {
            let snap = self.shared.snapshot.borrow();
            if snap.state != ConnectionState::Ready {
                return Err(GattError::NotReady { state: snap.state });
            }
            let present = snap
                .services
                .get(&service)
                .is_some_and(|chars| chars.contains(&characteristic));
            if !present {
                return Err(GattError::CharacteristicNotFound {
                    service,
                    characteristic,
                });
            }
        }

        let value = self
            .shared
            .radio
            .read_characteristic(&self.shared.address, service, characteristic)
            .await?;
        debug!(
            "[{}] Read {} byte(s) from {}",
            self.shared.address,
            value.len(),
            characteristic
        );
        Ok(value)
    }

    /// 主动断开，任意状态下均可调用
    ///
    /// 只释放本会话仍持有的链路；`Failed` 时链路已在失败时释放。
    pub async fn disconnect(&self) {
        let mut live = None;
        let changed = self.shared.update(|snap| {
            if snap.state == ConnectionState::Disconnected {
                return None;
            }
            if !snap.state.is_failed() {
                live = Some(snap.attempt);
            }
            snap.attempt += 1;
            Some(ConnectionState::Disconnected)
        });
        if changed {
            info!("[{}] Disconnected by caller", self.shared.address);
        }
        if let Some(attempt) = live {
            self.shared.release_link(attempt).await;
        }
    }

    /// 等待会话进入 `Ready`，返回发现的服务表
    ///
    /// 需在 `connect` 之后调用。
    pub async fn wait_ready(&self) -> Result<ServiceMap, GattError> {
        let mut rx = self.subscribe();
        let snap = rx
            .wait_for(|snap| {
                matches!(
                    snap.state,
                    ConnectionState::Ready
                        | ConnectionState::Failed(_)
                        | ConnectionState::Disconnected
                )
            })
            .await
            .map_err(|_| GattError::ConnectionLost)?
            .clone();

        match snap.state {
            ConnectionState::Ready => Ok(snap.services),
            ConnectionState::Failed(reason) => Err(GattError::SessionFailed(reason)),
            _ => Err(GattError::ConnectionLost),
        }
    }
}

impl Drop for GattSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let (state, attempt) = {
            let snap = self.shared.snapshot.borrow();
            (snap.state, snap.attempt)
        };
        if state == ConnectionState::Disconnected || state.is_failed() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            handle.spawn(async move {
                shared.release_link(attempt).await;
            });
        }
    }
}

async fn run_session(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<SessionMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        match message {
            SessionMessage::ConnectDeadline { attempt } => {
                shared
                    .fail(
                        attempt,
                        ConnectionState::Connecting,
                        FailureReason::ConnectTimeout,
                    )
                    .await;
            }
            SessionMessage::Radio { attempt, event } => {
                if attempt != shared.current_attempt() {
                    debug!(
                        "[{}] Dropping stale event from attempt {}: {:?}",
                        shared.address, attempt, event
                    );
                    continue;
                }
                shared.handle_event(attempt, event).await;
            }
        }
    }
    debug!("[{}] Session event loop stopped", shared.address);
}
