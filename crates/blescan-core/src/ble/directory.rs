//! 连接目录
//!
//! 按地址保存 [`GattSession`]，保证每个地址最多只有一个未退役的会话。

use crate::ble::advertisement::normalize_address;
use crate::ble::gatt::{GattError, GattSession, SessionConfig};
use crate::ble::radio::Radio;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ConnectionDirectory {
    radio: Arc<dyn Radio>,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Arc<GattSession>>>,
}

impl ConnectionDirectory {
    pub fn new(radio: Arc<dyn Radio>, config: SessionConfig) -> Self {
        Self {
            radio,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 返回该地址的现有会话；若会话已退役（失败或已断开）则新建一个替换它
    pub fn get_or_create(&self, address: &str) -> Arc<GattSession> {
        let address = normalize_address(address);
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&address)
            && !existing.is_retired()
        {
            return Arc::clone(existing);
        }

        debug!("Creating GATT session for {}", address);
        let session = Arc::new(GattSession::new(
            &address,
            Arc::clone(&self.radio),
            self.config,
        ));
        sessions.insert(address, Arc::clone(&session));
        session
    }

    /// 取得（或新建）会话并发起连接
    pub async fn connect(&self, address: &str) -> Result<Arc<GattSession>, GattError> {
        let session = self.get_or_create(address);
        session.connect().await?;
        Ok(session)
    }

    pub fn get(&self, address: &str) -> Option<Arc<GattSession>> {
        self.sessions
            .lock()
            .get(&normalize_address(address))
            .cloned()
    }

    pub fn remove(&self, address: &str) -> Option<Arc<GattSession>> {
        self.sessions.lock().remove(&normalize_address(address))
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.sessions.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub async fn disconnect_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::ConnectionState;
    use crate::ble::radio::{GattEvent, GattStatus, LinkState};
    use crate::ble::simulated::SimulatedRadio;
    use crate::ble::{DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC};
    use std::time::Duration;

    fn directory(radio: &Arc<SimulatedRadio>) -> ConnectionDirectory {
        ConnectionDirectory::new(radio.clone(), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_reuses_active_session() {
        let radio = Arc::new(SimulatedRadio::new());
        let dir = directory(&radio);

        let first = dir.connect("aa:01").await.unwrap();
        let second = dir.get_or_create("AA:01");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dir.addresses(), vec!["AA:01".to_string()]);
    }

    #[tokio::test]
    async fn test_unused_session_is_reused() {
        let radio = Arc::new(SimulatedRadio::new());
        let dir = directory(&radio);

        let first = dir.get_or_create("AA:01");
        let second = dir.get_or_create("AA:01");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_replaces_failed_session() {
        let radio = Arc::new(SimulatedRadio::new());
        let dir = directory(&radio);

        let first = dir.connect("AA:01").await.unwrap();
        radio.emit(
            "AA:01",
            GattEvent::ConnectFailed {
                status: GattStatus::ERROR,
            },
        );
        let mut rx = first.subscribe();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.state.is_failed()))
            .await
            .unwrap()
            .unwrap();

        let second = dir.get_or_create("AA:01");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), ConnectionState::Disconnected);
        assert!(dir.get("AA:01").is_some_and(|s| Arc::ptr_eq(&s, &second)));
    }

    #[tokio::test]
    async fn test_sessions_do_not_interfere() {
        let radio = Arc::new(SimulatedRadio::new());
        let dir = directory(&radio);

        let a = dir.connect("AA:01").await.unwrap();
        let b = dir.connect("AA:02").await.unwrap();
        radio.emit(
            "AA:01",
            GattEvent::ConnectionStateChanged {
                new_state: LinkState::Connected,
                status: GattStatus::SUCCESS,
            },
        );
        let mut rx = a.subscribe();
        tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(|s| s.state == ConnectionState::DiscoveringServices),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(b.state(), ConnectionState::Connecting);

        dir.disconnect_all().await;
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert_eq!(b.state(), ConnectionState::Disconnected);
        assert!(dir.remove("AA:02").is_some());
        assert_eq!(dir.addresses(), vec!["AA:01".to_string()]);
    }

    #[tokio::test]
    async fn test_retired_session_cannot_release_replacement() {
        let radio = Arc::new(SimulatedRadio::demo());
        let dir = directory(&radio);
        let address = "C4:7C:8D:6A:10:89";

        radio.refuse_next_connect();
        let old = dir.connect(address).await.unwrap();
        assert!(old.state().is_failed());

        let new = dir.connect(address).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        new.wait_ready().await.unwrap();

        old.disconnect().await;
        assert_eq!(old.state(), ConnectionState::Disconnected);

        assert_eq!(new.state(), ConnectionState::Ready);
        let value = new
            .read_characteristic(DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC)
            .await
            .unwrap();
        assert_eq!(value, b"MS1089");
    }
}
