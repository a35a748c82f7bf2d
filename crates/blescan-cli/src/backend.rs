//! 无线电后端选择

use anyhow::{Context, Result};
use blescan_core::{BtleplugRadio, Radio, SimulatedRadio};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// 模拟外设的广播间隔
const SIMULATED_ADVERTISING_INTERVAL: Duration = Duration::from_millis(300);

pub struct Backend {
    pub radio: Arc<dyn Radio>,
    advertiser: Option<JoinHandle<()>>,
}

impl Backend {
    pub async fn open(simulate: bool) -> Result<Self> {
        if simulate {
            tracing::info!("Using simulated radio");
            let radio = Arc::new(SimulatedRadio::demo());
            let advertiser = radio.spawn_advertiser(SIMULATED_ADVERTISING_INTERVAL);
            return Ok(Self {
                radio,
                advertiser: Some(advertiser),
            });
        }

        let radio = BtleplugRadio::new()
            .await
            .context("无法打开蓝牙适配器 (可使用 --simulate 在无硬件时试用)")?;
        Ok(Self {
            radio: Arc::new(radio),
            advertiser: None,
        })
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if let Some(advertiser) = self.advertiser.take() {
            advertiser.abort();
        }
    }
}
