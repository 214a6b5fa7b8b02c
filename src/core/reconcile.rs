use crate::core::transfer::{MigrationState, TransferRecord, TransferStatus};
use crate::core::tree::Tree;
use chrono::Utc;
use tracing::debug;

/// 对账结果统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// 新发现的文件
    pub added: usize,
    /// 远程已消失的文件
    pub orphaned: usize,
    /// 曾经消失又重新出现的文件
    pub reappeared: usize,
    /// 路径或大小发生变化的文件
    pub changed: usize,
    pub unchanged: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.orphaned == 0 && self.reappeared == 0 && self.changed == 0
    }
}

/// 用最新扫描结果对账迁移状态
///
/// 幂等：对同一棵树重复对账，第二次不会产生任何变化。
pub fn reconcile(state: &mut MigrationState, tree: &Tree) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();

    for node in tree.flatten() {
        let updated = state.update(node.id, |record| {
            let mut outcome = Change::Unchanged;

            if record.status == TransferStatus::Orphaned {
                record.status = TransferStatus::Pending;
                outcome = Change::Reappeared;
            }

            if record.path != node.path || record.expected_size != node.size {
                debug!(
                    "文件变化: {} ({} 字节) -> {} ({} 字节)",
                    record.path, record.expected_size, node.path, node.size
                );
                // 目标位置或大小变了，原来的完成结论不再成立
                record.path = node.path.clone();
                record.expected_size = node.size;
                record.restart = true;
                if record.status != TransferStatus::Pending {
                    record.status = TransferStatus::Pending;
                    record.retry_count = 0;
                    record.last_error = None;
                    record.completed_at = None;
                    record.bytes_on_disk = 0;
                }
                if outcome == Change::Unchanged {
                    outcome = Change::Changed;
                }
            }
            outcome
        });

        match updated {
            Some(Change::Unchanged) => summary.unchanged += 1,
            Some(Change::Changed) => summary.changed += 1,
            Some(Change::Reappeared) => summary.reappeared += 1,
            None => {
                state.insert(TransferRecord::pending(node.id, &node.path, node.size));
                summary.added += 1;
            }
        }
    }

    let vanished: Vec<_> = state
        .records
        .values()
        .filter(|r| r.status != TransferStatus::Orphaned && !tree.contains(r.remote_id))
        .map(|r| r.remote_id)
        .collect();
    for id in vanished {
        state.update(id, |r| r.status = TransferStatus::Orphaned);
        summary.orphaned += 1;
    }

    state.last_scan_at = Some(Utc::now());
    summary
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Unchanged,
    Changed,
    Reappeared,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteEntry, ROOT_FOLDER_ID};

    fn tree(entries: Vec<RemoteEntry>) -> Tree {
        Tree::from_entries(ROOT_FOLDER_ID, entries).unwrap()
    }

    fn movies() -> Tree {
        tree(vec![
            RemoteEntry::folder(10, "Movies", ROOT_FOLDER_ID),
            RemoteEntry::file(1, "A.mkv", 500, 10),
            RemoteEntry::folder(11, "Sub", 10),
            RemoteEntry::file(2, "B.srt", 1, 11),
        ])
    }

    #[test]
    fn test_empty_state_gets_one_pending_record_per_file() {
        let mut state = MigrationState::default();
        let summary = reconcile(&mut state, &movies());

        assert_eq!(summary.added, 2);
        assert_eq!(state.len(), 2);
        assert!(state.get(10).is_none());
        assert!(state.get(11).is_none());
        assert!(state
            .records
            .values()
            .all(|r| r.status == TransferStatus::Pending));
        assert_eq!(state.get(2).unwrap().path, "Movies/Sub/B.srt");
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut state = MigrationState::default();
        reconcile(&mut state, &movies());
        state.update(1, |r| r.status = TransferStatus::Completed);

        let once = state.clone();
        let summary = reconcile(&mut state, &movies());

        assert!(summary.is_noop());
        assert_eq!(state.records, once.records);
        assert_eq!(state.counters, once.counters);
    }

    #[test]
    fn test_vanished_files_become_orphaned_and_reappear_as_pending() {
        let mut state = MigrationState::default();
        reconcile(&mut state, &movies());
        state.update(1, |r| r.status = TransferStatus::Completed);

        let smaller = tree(vec![
            RemoteEntry::folder(10, "Movies", ROOT_FOLDER_ID),
            RemoteEntry::file(1, "A.mkv", 500, 10),
        ]);
        let summary = reconcile(&mut state, &smaller);
        assert_eq!(summary.orphaned, 1);
        assert_eq!(state.get(2).unwrap().status, TransferStatus::Orphaned);
        assert_eq!(state.counters.orphaned, 1);

        // 再次对账不会重复计数
        assert_eq!(reconcile(&mut state, &smaller).orphaned, 0);

        let summary = reconcile(&mut state, &movies());
        assert_eq!(summary.reappeared, 1);
        assert_eq!(state.get(2).unwrap().status, TransferStatus::Pending);
        assert_eq!(state.get(1).unwrap().status, TransferStatus::Completed);
    }

    #[test]
    fn test_completed_file_with_new_size_is_downloaded_again() {
        let mut state = MigrationState::default();
        reconcile(&mut state, &movies());
        state.update(1, |r| {
            r.status = TransferStatus::Completed;
            r.bytes_on_disk = 500;
        });

        let resized = tree(vec![
            RemoteEntry::folder(10, "Movies", ROOT_FOLDER_ID),
            RemoteEntry::file(1, "A.mkv", 700, 10),
            RemoteEntry::folder(11, "Sub", 10),
            RemoteEntry::file(2, "B.srt", 1, 11),
        ]);
        let summary = reconcile(&mut state, &resized);

        assert_eq!(summary.changed, 1);
        let record = state.get(1).unwrap();
        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.expected_size, 700);
        assert_eq!(record.bytes_on_disk, 0);
        assert!(record.restart);
        assert!(!state.get(2).unwrap().restart);
    }
}
