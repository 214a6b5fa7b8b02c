use crate::core::tree::Tree;
use crate::error::{MigrateError, RemoteError, Result};
use crate::remote::{NodeKind, RemoteEntry, RemoteId, RemoteLister};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 远程目录扫描器
pub struct FileScanner {
    max_concurrent: usize,
    cancel: CancellationToken,
}

impl FileScanner {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// 创建带取消令牌的扫描器
    pub fn with_cancel(max_concurrent: usize, cancel: CancellationToken) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            cancel,
        }
    }

    /// 完整扫描 `root_id` 下的所有节点
    ///
    /// 要么返回完整的目录树，要么返回错误，不会返回部分结果。
    pub async fn scan(&self, lister: &dyn RemoteLister, root_id: RemoteId) -> Result<Tree> {
        info!("开始扫描远程目录: {}, root={}", lister.name(), root_id);

        let mut entries: Vec<RemoteEntry> = Vec::new();
        let mut pending: VecDeque<RemoteId> = VecDeque::from([root_id]);
        let mut in_flight = FuturesUnordered::new();
        let mut folders_scanned = 0usize;
        let mut files_found = 0usize;
        let mut bytes_found = 0u64;

        loop {
            while in_flight.len() < self.max_concurrent {
                let Some(folder_id) = pending.pop_front() else {
                    break;
                };
                in_flight.push(self.list_folder(lister, folder_id));
            }

            let Some(result) = in_flight.next().await else {
                break;
            };
            let (folder_id, listed) = result?;
            folders_scanned += 1;

            for mut entry in listed {
                // 以实际列出的目录为准
                entry.parent_id = Some(folder_id);
                match entry.kind {
                    NodeKind::Folder => pending.push_back(entry.id),
                    NodeKind::File => {
                        files_found += 1;
                        bytes_found += entry.size;
                    }
                }
                entries.push(entry);
            }

            if folders_scanned % 100 == 0 {
                info!(
                    "扫描中: {} 个目录, {} 个文件, {} MB",
                    folders_scanned,
                    files_found,
                    bytes_found / (1024 * 1024)
                );
            }
        }

        let tree = Tree::from_entries(root_id, entries)?;
        info!(
            "扫描完成: {} 个目录, {} 个文件, 共 {} 字节",
            folders_scanned,
            tree.file_count(),
            tree.total_file_bytes()
        );
        Ok(tree)
    }

    /// 列出单个目录，限流时按提示等待后重试
    async fn list_folder(
        &self,
        lister: &dyn RemoteLister,
        folder_id: RemoteId,
    ) -> Result<(RemoteId, Vec<RemoteEntry>)> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Interrupted);
            }

            let listed = tokio::select! {
                r = lister.list(folder_id) => r,
                _ = self.cancel.cancelled() => return Err(MigrateError::Interrupted),
            };

            match listed {
                Ok(entries) => {
                    debug!("目录 {} 包含 {} 个条目", folder_id, entries.len());
                    return Ok((folder_id, entries));
                }
                Err(RemoteError::RateLimited { retry_after }) => {
                    warn!("列目录 {} 被限流，{:?} 后重试", folder_id, retry_after);
                    tokio::select! {
                        _ = tokio::time::sleep(retry_after) => {}
                        _ = self.cancel.cancelled() => return Err(MigrateError::Interrupted),
                    }
                }
                Err(e) => {
                    error!("列目录 {} 失败: {}", folder_id, e);
                    return Err(e.into());
                }
            }
        }
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new(4)
    }
}
