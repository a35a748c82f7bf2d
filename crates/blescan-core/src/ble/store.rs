//! 扫描结果存储
//!
//! 按首次发现顺序保存去重后的设备列表。内部维护地址到位置的索引，
//! 更新同一地址时原位替换，不改变顺序。

use crate::ble::advertisement::AdvertisementRecord;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// upsert 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// 新地址，追加到末尾
    Inserted(usize),
    /// 已有地址，原位替换
    Replaced(usize),
}

impl UpsertOutcome {
    pub fn position(self) -> usize {
        match self {
            UpsertOutcome::Inserted(pos) | UpsertOutcome::Replaced(pos) => pos,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

#[derive(Debug, Default)]
struct Entries {
    records: Vec<AdvertisementRecord>,
    index: HashMap<String, usize>,
}

#[derive(Debug)]
struct Shared {
    entries: RwLock<Entries>,
    revision: watch::Sender<u64>,
}

/// 可在多个任务间共享的结果存储，clone 后指向同一份数据
#[derive(Debug, Clone)]
pub struct ScanResultStore {
    shared: Arc<Shared>,
}

impl Default for ScanResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanResultStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(Entries::default()),
                revision,
            }),
        }
    }

    /// 插入或替换一条记录
    ///
    /// 后到的记录整体覆盖旧记录，不做字段级合并。
    pub fn upsert(&self, record: AdvertisementRecord) -> UpsertOutcome {
        let outcome = {
            let mut entries = self.shared.entries.write();
            if let Some(&pos) = entries.index.get(&record.address) {
                entries.records[pos] = record;
                UpsertOutcome::Replaced(pos)
            } else {
                let pos = entries.records.len();
                entries.index.insert(record.address.clone(), pos);
                entries.records.push(record);
                UpsertOutcome::Inserted(pos)
            }
        };
        self.bump();
        outcome
    }

    /// 当前内容的拷贝，之后的修改不会反映到已取得的快照中
    pub fn snapshot(&self) -> Vec<AdvertisementRecord> {
        self.shared.entries.read().records.clone()
    }

    pub fn get(&self, address: &str) -> Option<AdvertisementRecord> {
        let address = crate::ble::advertisement::normalize_address(address);
        let entries = self.shared.entries.read();
        entries
            .index
            .get(&address)
            .map(|&pos| entries.records[pos].clone())
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空列表，之后的记录重新从位置 0 开始排序
    pub fn clear(&self) {
        {
            let mut entries = self.shared.entries.write();
            entries.records.clear();
            entries.index.clear();
        }
        self.bump();
    }

    /// 订阅修改通知，值为单调递增的修订号
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.shared.revision.borrow()
    }

    fn bump(&self) {
        self.shared.revision.send_modify(|rev| *rev += 1);
    }
}
