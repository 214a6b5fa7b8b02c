//! 传输调度
//!
//! 单个派发循环按给定顺序（父目录在前）从队列取文件，通过信号量限制并发，
//! 每个传输在 `JoinSet` 中独立运行。结果由任务自己写回 `StateStore`，
//! 派发循环只负责重试排队与限流暂停。

use crate::core::retry::{RetryDecision, RetryPolicy, TransferOutcome};
use crate::core::store::{Claim, StateStore};
use crate::core::transfer::TransferStatus;
use crate::remote::{existing_len, FetchResult, Fetcher, RemoteId};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 调度配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// 中断信号发出后，留给下载器自行停止的时间
    pub force_stop_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            force_stop_window: Duration::from_secs(5),
        }
    }
}

/// 本次调度的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub completed: usize,
    pub failed: usize,
    /// 安排了退避重试的次数
    pub retried: usize,
    pub rate_limited: usize,
    pub interrupted: usize,
    pub bytes_written: u64,
}

/// 单个传输任务的结果
#[derive(Debug)]
struct TaskReport {
    remote_id: RemoteId,
    decision: RetryDecision,
    bytes_written: u64,
}

/// 传输任务共享的上下文
struct Worker {
    store: Arc<StateStore>,
    fetcher: Arc<dyn Fetcher>,
    destination: PathBuf,
    policy: RetryPolicy,
    abort: CancellationToken,
    force_stop_window: Duration,
}

pub struct TransferScheduler {
    store: Arc<StateStore>,
    fetcher: Arc<dyn Fetcher>,
    destination: PathBuf,
    config: SchedulerConfig,
    stop: CancellationToken,
    abort: CancellationToken,
}

impl TransferScheduler {
    pub fn new(
        store: Arc<StateStore>,
        fetcher: Arc<dyn Fetcher>,
        destination: impl Into<PathBuf>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            destination: destination.into(),
            config,
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    /// 使用外部的停机令牌：`stop` 停止派发，`abort` 中断进行中的传输
    pub fn with_tokens(mut self, stop: CancellationToken, abort: CancellationToken) -> Self {
        self.stop = stop;
        self.abort = abort;
        self
    }

    fn is_stopping(&self) -> bool {
        self.stop.is_cancelled() || self.abort.is_cancelled()
    }

    /// 传输给定的文件，直到全部结束或收到停机请求
    ///
    /// 只有处于 pending 的记录会被认领，重复的 ID 只处理一次。
    pub async fn run(&self, ids: Vec<RemoteId>) -> SchedulerSummary {
        let mut seen = HashSet::with_capacity(ids.len());
        let mut queue: VecDeque<RemoteId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();

        let max_concurrency = self.config.max_concurrency.max(1);
        let worker = Arc::new(Worker {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            destination: self.destination.clone(),
            policy: self.config.retry,
            abort: self.abort.clone(),
            force_stop_window: self.config.force_stop_window,
        });

        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut active: JoinSet<TaskReport> = JoinSet::new();
        let mut task_ids: HashMap<tokio::task::Id, RemoteId> = HashMap::new();
        let mut delayed: JoinSet<RemoteId> = JoinSet::new();
        let mut pause_until: Option<Instant> = None;
        let mut summary = SchedulerSummary::default();

        info!(
            "开始传输 {} 个文件 (并发 {}, 下载器 {})",
            queue.len(),
            max_concurrency,
            self.fetcher.name()
        );

        loop {
            if queue.is_empty() && active.is_empty() && delayed.is_empty() {
                break;
            }
            let pause = pause_until.filter(|until| *until > Instant::now());
            if pause.is_none() {
                pause_until = None;
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.abort.cancelled() => break,
                Some(joined) = active.join_next_with_id(), if !active.is_empty() => {
                    let report = match joined {
                        Ok((task_id, report)) => {
                            task_ids.remove(&task_id);
                            report
                        }
                        Err(e) => {
                            self.recover_failed_task(task_ids.remove(&e.id()), &e).await;
                            continue;
                        }
                    };
                    self.absorb(report, &mut summary, &mut queue, &mut delayed, &mut pause_until);
                }
                Some(joined) = delayed.join_next(), if !delayed.is_empty() => {
                    if let Ok(id) = joined {
                        queue.push_back(id);
                    }
                }
                _ = tokio::time::sleep_until(pause.unwrap_or_else(Instant::now)), if pause.is_some() => {
                    debug!("限流暂停结束，恢复派发");
                    pause_until = None;
                }
                permit = semaphore.clone().acquire_owned(), if pause.is_none() && !queue.is_empty() => {
                    let Ok(permit) = permit else { break };
                    let Some(id) = queue.pop_front() else { continue };
                    let Some(claim) = self.store.claim(id).await else {
                        debug!("文件 {} 不是待处理状态，跳过", id);
                        continue;
                    };

                    let worker = Arc::clone(&worker);
                    let handle = active.spawn(async move {
                        let report = worker.transfer(claim).await;
                        drop(permit);
                        report
                    });
                    task_ids.insert(handle.id(), id);
                }
            }
        }

        if self.is_stopping() {
            info!(
                "停止派发：{} 个未开始，{} 个等待重试，等待 {} 个进行中的传输结束",
                queue.len(),
                delayed.len(),
                active.len()
            );
        }
        // 等待重试的记录已经是 pending
        delayed.abort_all();

        while let Some(joined) = active.join_next_with_id().await {
            match joined {
                Ok((task_id, report)) => {
                    task_ids.remove(&task_id);
                    self.absorb(report, &mut summary, &mut queue, &mut delayed, &mut pause_until);
                }
                Err(e) => self.recover_failed_task(task_ids.remove(&e.id()), &e).await,
            }
        }
        delayed.abort_all();

        info!(
            "传输结束: 完成 {}, 失败 {}, 重试 {}, 限流 {}, 中断 {}, 写入 {} 字节",
            summary.completed,
            summary.failed,
            summary.retried,
            summary.rate_limited,
            summary.interrupted,
            summary.bytes_written
        );
        summary
    }

    fn absorb(
        &self,
        report: TaskReport,
        summary: &mut SchedulerSummary,
        queue: &mut VecDeque<RemoteId>,
        delayed: &mut JoinSet<RemoteId>,
        pause_until: &mut Option<Instant>,
    ) {
        summary.bytes_written += report.bytes_written;
        let stopping = self.is_stopping();

        match report.decision {
            RetryDecision::Complete => summary.completed += 1,
            RetryDecision::GiveUp { .. } => summary.failed += 1,
            RetryDecision::Retry { after, .. } => {
                summary.retried += 1;
                if !stopping {
                    let id = report.remote_id;
                    delayed.spawn(async move {
                        tokio::time::sleep(after).await;
                        id
                    });
                }
            }
            RetryDecision::Pause(after) => {
                summary.rate_limited += 1;
                let until = Instant::now() + after;
                if pause_until.map_or(true, |current| until > current) {
                    *pause_until = Some(until);
                }
                if !stopping {
                    queue.push_front(report.remote_id);
                }
            }
            RetryDecision::Requeue => {
                summary.interrupted += 1;
                if !stopping {
                    queue.push_back(report.remote_id);
                }
            }
        }
    }

    /// 任务异常退出时把记录放回 pending
    async fn recover_failed_task(&self, id: Option<RemoteId>, err: &tokio::task::JoinError) {
        error!("传输任务异常退出: {}", err);
        if let Some(id) = id {
            self.store
                .update_record(id, |r| {
                    r.status = TransferStatus::Pending;
                    r.last_error = Some(format!("传输任务异常退出: {}", err));
                })
                .await;
        }
    }
}

impl Worker {
    async fn transfer(&self, claim: Claim) -> TaskReport {
        let destination = self.destination.join(&claim.path);
        debug!("开始传输 {} -> {:?}", claim.path, destination);

        let (outcome, bytes_written) = self.attempt(&claim, &destination).await;
        let decision = self.policy.decide(&outcome, claim.retry_count);
        self.apply(&claim, &outcome, &decision, bytes_written).await;

        TaskReport {
            remote_id: claim.remote_id,
            decision,
            bytes_written,
        }
    }

    async fn attempt(&self, claim: &Claim, destination: &Path) -> (TransferOutcome, u64) {
        if claim.restart {
            if let Err(reason) = self.discard_stale(claim, destination).await {
                return (TransferOutcome::RetryableFailure(reason), 0);
            }
        }

        match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.is_dir() => {
                return (
                    TransferOutcome::PermanentFailure(format!("目标路径是目录: {}", claim.path)),
                    0,
                );
            }
            Ok(meta) if meta.len() == claim.expected_size => {
                info!("文件已存在且大小一致，跳过下载: {}", claim.path);
                return (TransferOutcome::Success { bytes_written: 0 }, 0);
            }
            Ok(meta) if meta.len() > claim.expected_size => {
                warn!(
                    "本地文件比远程大 ({} > {})，重新下载: {}",
                    meta.len(),
                    claim.expected_size,
                    claim.path
                );
                if let Err(e) = tokio::fs::remove_file(destination).await {
                    return (
                        TransferOutcome::RetryableFailure(format!("删除过大的文件失败: {}", e)),
                        0,
                    );
                }
            }
            _ => {}
        }

        if let Some(parent) = destination.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return (
                    TransferOutcome::RetryableFailure(format!("创建目录失败: {}", e)),
                    0,
                );
            }
        }

        let before = existing_len(destination).await;
        let result = tokio::select! {
            result = self.fetcher.fetch(claim.remote_id, destination, claim.expected_size, &self.abort) => result,
            _ = async {
                self.abort.cancelled().await;
                tokio::time::sleep(self.force_stop_window).await;
            } => {
                warn!("下载器未在 {:?} 内停止，强制中断: {}", self.force_stop_window, claim.path);
                let after = existing_len(destination).await;
                FetchResult::interrupted(after.saturating_sub(before))
            }
        };

        let bytes_written = result.bytes_written;
        let outcome = TransferOutcome::from(result);
        if !matches!(outcome, TransferOutcome::Success { .. }) {
            return (outcome, bytes_written);
        }

        // 只有磁盘上的大小与远程一致才算完成
        match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.len() == claim.expected_size => (outcome, bytes_written),
            Ok(meta) => (
                TransferOutcome::RetryableFailure(format!(
                    "大小校验失败: 应为 {} 字节，实际 {} 字节",
                    claim.expected_size,
                    meta.len()
                )),
                bytes_written,
            ),
            Err(e) => (
                TransferOutcome::RetryableFailure(format!(
                    "大小校验失败: 应为 {} 字节，无法读取文件: {}",
                    claim.expected_size, e
                )),
                bytes_written,
            ),
        }
    }

    /// 删除旧版本留下的本地文件，成功后清除记录上的重新下载标记
    async fn discard_stale(&self, claim: &Claim, destination: &Path) -> Result<(), String> {
        match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.is_file() => {
                warn!("远程文件已变化，删除旧的本地文件: {}", claim.path);
                tokio::fs::remove_file(destination)
                    .await
                    .map_err(|e| format!("删除旧版本文件失败: {}", e))?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(format!("读取旧版本文件失败: {}", e)),
        }
        self.store
            .update_record(claim.remote_id, |r| r.restart = false)
            .await;
        Ok(())
    }

    /// `bytes_written` 不论成败都计入累计传输量，续传时之前写入的部分已经算过
    async fn apply(
        &self,
        claim: &Claim,
        outcome: &TransferOutcome,
        decision: &RetryDecision,
        bytes_written: u64,
    ) {
        let reason = match outcome {
            TransferOutcome::RetryableFailure(reason) | TransferOutcome::PermanentFailure(reason) => {
                Some(reason.clone())
            }
            _ => None,
        };

        self.store
            .update_record(claim.remote_id, |record| match decision {
                RetryDecision::Complete => {
                    record.status = TransferStatus::Completed;
                    record.bytes_on_disk = claim.expected_size;
                    record.completed_at = Some(Utc::now());
                    record.last_error = None;
                }
                RetryDecision::Retry { retry_count, .. } => {
                    record.status = TransferStatus::Pending;
                    record.retry_count = *retry_count;
                    record.last_error = reason.clone();
                }
                RetryDecision::GiveUp { retry_count } => {
                    record.status = TransferStatus::Failed;
                    record.retry_count = *retry_count;
                    record.last_error = reason.clone();
                }
                RetryDecision::Pause(_) | RetryDecision::Requeue => {
                    record.status = TransferStatus::Pending;
                }
            })
            .await;

        self.store.add_bytes_transferred(bytes_written).await;

        match decision {
            RetryDecision::Complete => {
                info!("完成: {} ({} 字节)", claim.path, claim.expected_size);
            }
            RetryDecision::GiveUp { retry_count } => {
                error!(
                    "传输失败 (共 {} 次): {} - {}",
                    retry_count,
                    claim.path,
                    reason.as_deref().unwrap_or("")
                );
            }
            RetryDecision::Retry { after, retry_count } => {
                warn!(
                    "传输失败，{:?} 后重试 ({}/{}): {} - {}",
                    after,
                    retry_count,
                    self.policy.max_attempts,
                    claim.path,
                    reason.as_deref().unwrap_or("")
                );
            }
            RetryDecision::Pause(after) => {
                warn!("触发限流，暂停派发 {:?}: {}", after, claim.path);
            }
            RetryDecision::Requeue => {
                info!("传输被中断，保留部分文件以便续传: {}", claim.path);
            }
        }

        if matches!(decision, RetryDecision::Complete | RetryDecision::GiveUp { .. }) {
            if let Err(e) = self.store.save().await {
                warn!("保存状态失败: {}", e);
            }
        }
    }
}
