//! 传输状态模型 - 每个远程文件一条记录，支持断点续传

use crate::remote::RemoteId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// 远程已不存在，保留记录用于识别重新出现的文件
    Orphaned,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "pending"),
            TransferStatus::InProgress => write!(f, "in_progress"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Failed => write!(f, "failed"),
            TransferStatus::Orphaned => write!(f, "orphaned"),
        }
    }
}

impl From<&str> for TransferStatus {
    fn from(s: &str) -> Self {
        match s {
            "in_progress" => TransferStatus::InProgress,
            "completed" => TransferStatus::Completed,
            "failed" => TransferStatus::Failed,
            "orphaned" => TransferStatus::Orphaned,
            _ => TransferStatus::Pending,
        }
    }
}

/// 单个文件的迁移记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub remote_id: RemoteId,
    /// 相对目标根目录的路径
    pub path: String,
    pub expected_size: u64,
    pub status: TransferStatus,
    /// 完成时校验过的磁盘文件大小
    #[serde(default)]
    pub bytes_on_disk: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// 远程文件已变化，本地已有的数据属于旧版本，下次传输前必须删除
    #[serde(default)]
    pub restart: bool,
    #[serde(default = "Utc::now")]
    pub first_seen: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    /// 新发现的文件
    pub fn pending(remote_id: RemoteId, path: &str, expected_size: u64) -> Self {
        Self {
            remote_id,
            path: path.to_string(),
            expected_size,
            status: TransferStatus::Pending,
            bytes_on_disk: 0,
            last_error: None,
            retry_count: 0,
            restart: false,
            first_seen: Utc::now(),
            last_attempt: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Completed | TransferStatus::Failed
        )
    }
}

/// 汇总计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateCounters {
    pub bytes_transferred: u64,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub orphaned: usize,
}

impl StateCounters {
    fn slot(&mut self, status: TransferStatus) -> &mut usize {
        match status {
            TransferStatus::Pending => &mut self.pending,
            TransferStatus::InProgress => &mut self.in_progress,
            TransferStatus::Completed => &mut self.completed,
            TransferStatus::Failed => &mut self.failed,
            TransferStatus::Orphaned => &mut self.orphaned,
        }
    }

    pub fn count(&self, status: TransferStatus) -> usize {
        match status {
            TransferStatus::Pending => self.pending,
            TransferStatus::InProgress => self.in_progress,
            TransferStatus::Completed => self.completed,
            TransferStatus::Failed => self.failed,
            TransferStatus::Orphaned => self.orphaned,
        }
    }

    pub(crate) fn transition(&mut self, from: Option<TransferStatus>, to: TransferStatus) {
        if let Some(from) = from {
            let slot = self.slot(from);
            *slot = slot.saturating_sub(1);
        }
        *self.slot(to) += 1;
    }
}

/// 完整的迁移状态（持久化为 JSON）
///
/// 新增字段必须带默认值，旧版本写出的文件才能被读取；
/// 不认识的字段在读取时会被忽略。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    /// 每次保存递增
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub records: BTreeMap<RemoteId, TransferRecord>,
    #[serde(default)]
    pub counters: StateCounters,
    #[serde(default)]
    pub migration_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl Default for MigrationState {
    fn default() -> Self {
        Self {
            version: 0,
            records: BTreeMap::new(),
            counters: StateCounters::default(),
            migration_started_at: Some(Utc::now()),
            last_scan_at: None,
        }
    }
}

impl MigrationState {
    pub fn get(&self, id: RemoteId) -> Option<&TransferRecord> {
        self.records.get(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 插入新记录；已存在时返回 false 且不做修改
    pub fn insert(&mut self, record: TransferRecord) -> bool {
        if self.records.contains_key(&record.remote_id) {
            return false;
        }
        self.counters.transition(None, record.status);
        self.records.insert(record.remote_id, record);
        true
    }

    /// 修改单条记录并同步计数，记录不存在时返回 None
    pub fn update<R>(
        &mut self,
        id: RemoteId,
        mutation: impl FnOnce(&mut TransferRecord) -> R,
    ) -> Option<R> {
        let record = self.records.get_mut(&id)?;
        let before = record.status;
        let result = mutation(record);
        let after = record.status;
        if before != after {
            self.counters.transition(Some(before), after);
        }
        Some(result)
    }

    pub fn add_bytes_transferred(&mut self, bytes: u64) {
        self.counters.bytes_transferred = self.counters.bytes_transferred.saturating_add(bytes);
    }

    /// 按状态重新统计（加载后调用，纠正手工编辑或旧版本留下的不一致）
    pub fn recount(&mut self) {
        let bytes = self.counters.bytes_transferred;
        self.counters = StateCounters {
            bytes_transferred: bytes,
            ..StateCounters::default()
        };
        for record in self.records.values() {
            *self.counters.slot(record.status) += 1;
        }
    }

    /// 上次运行遗留的 in_progress 一律降级为 pending
    pub fn demote_in_progress(&mut self) -> usize {
        let ids: Vec<RemoteId> = self
            .records
            .values()
            .filter(|r| r.status == TransferStatus::InProgress)
            .map(|r| r.remote_id)
            .collect();
        for id in &ids {
            self.update(*id, |r| r.status = TransferStatus::Pending);
        }
        ids.len()
    }

    pub fn records_with_status(&self, status: TransferStatus) -> impl Iterator<Item = &TransferRecord> {
        self.records.values().filter(move |r| r.status == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            TransferStatus::Pending,
            TransferStatus::InProgress,
            TransferStatus::Completed,
            TransferStatus::Failed,
            TransferStatus::Orphaned,
        ] {
            assert_eq!(TransferStatus::from(status.to_string().as_str()), status);
        }
        assert_eq!(TransferStatus::from("bogus"), TransferStatus::Pending);
    }

    #[test]
    fn test_update_keeps_counters_in_sync() {
        let mut state = MigrationState::default();
        assert!(state.insert(TransferRecord::pending(1, "a", 10)));
        assert!(state.insert(TransferRecord::pending(2, "b", 10)));
        assert!(!state.insert(TransferRecord::pending(2, "b", 10)));
        assert_eq!(state.counters.pending, 2);

        state.update(1, |r| r.status = TransferStatus::Completed);
        assert_eq!(state.counters.pending, 1);
        assert_eq!(state.counters.completed, 1);

        assert!(state.update(99, |r| r.status = TransferStatus::Failed).is_none());
    }

    #[test]
    fn test_demote_in_progress() {
        let mut state = MigrationState::default();
        state.insert(TransferRecord::pending(1, "a", 10));
        state.update(1, |r| r.status = TransferStatus::InProgress);

        assert_eq!(state.demote_in_progress(), 1);
        assert_eq!(state.get(1).unwrap().status, TransferStatus::Pending);
        assert_eq!(state.counters.in_progress, 0);
        assert_eq!(state.counters.pending, 1);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let json = r#"{
            "version": 3,
            "future_field": {"x": 1},
            "records": {
                "7": {"remote_id": 7, "path": "a.mkv", "expected_size": 5,
                      "status": "completed", "checksum": "abc"}
            }
        }"#;
        let mut state: MigrationState = serde_json::from_str(json).unwrap();
        state.recount();

        assert_eq!(state.version, 3);
        assert_eq!(state.get(7).unwrap().status, TransferStatus::Completed);
        assert_eq!(state.counters.completed, 1);
    }
}
