//! 迁移状态持久化
//!
//! 所有对 `MigrationState` 的修改都经过 `StateStore` 的互斥锁串行执行。
//! 保存时只在序列化期间持锁，文件写入在锁外完成，写入顺序由单独的写锁保证。

use crate::core::transfer::{MigrationState, TransferRecord, TransferStatus};
use crate::error::{MigrateError, Result};
use crate::remote::RemoteId;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 认领成功的传输任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub remote_id: RemoteId,
    pub path: String,
    pub expected_size: u64,
    /// 本次尝试之前已失败的次数
    pub retry_count: u32,
    /// 本地已有数据来自旧版本，不能续传
    pub restart: bool,
}

/// 迁移状态存储
pub struct StateStore {
    path: PathBuf,
    state: Mutex<MigrationState>,
    /// 已落盘的最新版本号，同时作为文件写入锁
    persisted_version: Mutex<u64>,
    read_only: bool,
    corrupt_backup: Option<PathBuf>,
}

impl StateStore {
    /// 加载状态文件
    ///
    /// 文件不存在时返回空状态；内容损坏时把原文件改名备份并返回空状态。
    /// 只有其它 I/O 错误才会中止。
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(path.into(), false).await
    }

    /// 只读加载（dry run），不会改名损坏的文件，`save` 也不会写盘
    pub async fn load_read_only(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(path.into(), true).await
    }

    async fn open(path: PathBuf, read_only: bool) -> Result<Self> {
        let mut corrupt_backup = None;

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<MigrationState>(&bytes) {
                Ok(mut state) => {
                    state.recount();
                    let demoted = state.demote_in_progress();
                    if demoted > 0 {
                        warn!("上次运行有 {} 个文件未完成，已恢复为待处理", demoted);
                    }
                    info!(
                        "已加载迁移状态 v{}: {} 条记录 (完成 {}, 失败 {}, 待处理 {})",
                        state.version,
                        state.len(),
                        state.counters.completed,
                        state.counters.failed,
                        state.counters.pending
                    );
                    state
                }
                Err(e) => {
                    warn!("状态文件损坏，将从空状态开始: {:?} - {}", path, e);
                    if !read_only {
                        corrupt_backup = backup_corrupt(&path).await;
                    }
                    MigrationState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("状态文件不存在，创建新状态: {:?}", path);
                MigrationState::default()
            }
            Err(e) => return Err(MigrateError::state_io(&path, e)),
        };

        let version = state.version;
        Ok(Self {
            path,
            state: Mutex::new(state),
            persisted_version: Mutex::new(version),
            read_only,
            corrupt_backup,
        })
    }

    /// 内存中的空状态（不关联磁盘文件写入，主要用于测试）
    pub fn in_memory(state: MigrationState) -> Self {
        let version = state.version;
        Self {
            path: PathBuf::new(),
            state: Mutex::new(state),
            persisted_version: Mutex::new(version),
            read_only: true,
            corrupt_backup: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// 加载时损坏文件的备份位置
    pub fn corrupt_backup(&self) -> Option<&Path> {
        self.corrupt_backup.as_deref()
    }

    /// 原子保存：先写临时文件再改名
    ///
    /// 返回是否真正写盘。比已落盘版本旧的快照会被丢弃。
    pub async fn save(&self) -> Result<bool> {
        if self.read_only {
            return Ok(false);
        }

        let (version, bytes) = {
            let mut state = self.state.lock().await;
            state.version += 1;
            (state.version, serde_json::to_vec_pretty(&*state)?)
        };

        let mut persisted = self.persisted_version.lock().await;
        if version <= *persisted {
            debug!("跳过过期的状态快照 v{} (已保存 v{})", version, *persisted);
            return Ok(false);
        }

        write_atomic(&self.path, &bytes).await?;
        *persisted = version;
        debug!("状态已保存 v{} ({} 字节)", version, bytes.len());
        Ok(true)
    }

    /// 唯一的记录修改入口
    pub async fn update_record<R>(
        &self,
        id: RemoteId,
        mutation: impl FnOnce(&mut TransferRecord) -> R,
    ) -> Option<R> {
        self.state.lock().await.update(id, mutation)
    }

    /// 在锁内对整个状态执行操作（对账等批量修改）
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut MigrationState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// 认领一个待处理文件：pending -> in_progress
    ///
    /// 检查和修改在同一次加锁内完成，同一文件不会被两个任务同时认领。
    pub async fn claim(&self, id: RemoteId) -> Option<Claim> {
        let mut state = self.state.lock().await;
        state
            .update(id, |record| {
                if record.status != TransferStatus::Pending {
                    return None;
                }
                record.status = TransferStatus::InProgress;
                record.last_attempt = Some(Utc::now());
                Some(Claim {
                    remote_id: record.remote_id,
                    path: record.path.clone(),
                    expected_size: record.expected_size,
                    retry_count: record.retry_count,
                    restart: record.restart,
                })
            })
            .flatten()
    }

    pub async fn add_bytes_transferred(&self, bytes: u64) {
        if bytes > 0 {
            self.state.lock().await.add_bytes_transferred(bytes);
        }
    }

    /// 人工干预：把所有失败的文件重新放回待处理
    pub async fn reset_failed(&self) -> usize {
        let mut state = self.state.lock().await;
        let ids: Vec<RemoteId> = state
            .records_with_status(TransferStatus::Failed)
            .map(|r| r.remote_id)
            .collect();
        for id in &ids {
            state.update(*id, |r| {
                r.status = TransferStatus::Pending;
                r.retry_count = 0;
            });
        }
        ids.len()
    }

    pub async fn snapshot(&self) -> MigrationState {
        self.state.lock().await.clone()
    }

    pub async fn status_of(&self, id: RemoteId) -> Option<TransferStatus> {
        self.state.lock().await.get(id).map(|r| r.status)
    }

    /// 启动定时自动保存，`cancel` 触发后退出
    pub fn spawn_autosave(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // 第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.save().await {
                            warn!("自动保存失败: {}", e);
                        }
                    }
                }
            }
            debug!("自动保存已停止");
        })
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MigrateError::state_io(parent, e))?;
    }

    let temp_path = sibling_path(path, "tmp");
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| MigrateError::state_io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| MigrateError::state_io(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| MigrateError::state_io(&temp_path, e))?;
    drop(file);

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| MigrateError::state_io(path, e))
}

/// 把损坏的状态文件改名保留，失败时只记录警告
async fn backup_corrupt(path: &Path) -> Option<PathBuf> {
    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
    let backup = sibling_path(path, &suffix);
    match tokio::fs::rename(path, &backup).await {
        Ok(()) => {
            warn!("损坏的状态文件已备份到 {:?}", backup);
            Some(backup)
        }
        Err(e) => {
            warn!("备份损坏的状态文件失败: {}", e);
            None
        }
    }
}

/// `state.json` -> `state.json.<suffix>`
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
