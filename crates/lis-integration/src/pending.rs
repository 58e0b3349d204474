//! 待匹配队列
//!
//! 患者尚未建档时，结果按 (设备ID, 患者外部标识) 暂存；同一键的新消息覆盖旧条目，不合并。

use chrono::{DateTime, Utc};
use lis_core::ParsedResult;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 暂存的结果
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMatch {
    pub device_id: String,
    pub patient_external_id: String,
    pub results: Vec<ParsedResult>,
    pub queued_at: DateTime<Utc>,
    revision: u64,
}

impl PendingMatch {
    pub fn new(
        device_id: impl Into<String>,
        patient_external_id: impl Into<String>,
        results: Vec<ParsedResult>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            patient_external_id: patient_external_id.into(),
            results,
            queued_at: Utc::now(),
            revision: 0,
        }
    }
}

type PendingKey = (String, String);

#[derive(Debug, Default)]
struct PendingTable {
    entries: HashMap<PendingKey, PendingMatch>,
    next_revision: u64,
}

/// 待匹配队列（进程内，不持久化）
#[derive(Debug, Default)]
pub struct PendingMatchQueue {
    table: RwLock<PendingTable>,
}

impl PendingMatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入或覆盖条目，返回是否替换了旧条目
    pub async fn upsert(&self, mut entry: PendingMatch) -> bool {
        let mut table = self.table.write().await;
        table.next_revision += 1;
        entry.revision = table.next_revision;

        let key = (entry.device_id.clone(), entry.patient_external_id.clone());
        table.entries.insert(key, entry).is_some()
    }

    pub async fn get(&self, device_id: &str, patient_external_id: &str) -> Option<PendingMatch> {
        let key = (device_id.to_string(), patient_external_id.to_string());
        self.table.read().await.entries.get(&key).cloned()
    }

    /// 全部条目的快照，按入队时间排序
    pub async fn snapshot(&self) -> Vec<PendingMatch> {
        let mut entries: Vec<PendingMatch> =
            self.table.read().await.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.revision);
        entries
    }

    /// 只有条目在快照之后未被覆盖时才删除
    pub async fn remove_if_unchanged(&self, entry: &PendingMatch) -> bool {
        let mut table = self.table.write().await;
        let key = (entry.device_id.clone(), entry.patient_external_id.clone());

        match table.entries.get(&key) {
            Some(current) if current.revision == entry.revision => {
                table.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
