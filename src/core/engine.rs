//! 迁移引擎 - 串联扫描、对账、过滤、传输与停机

use crate::core::filter::{FilterEngine, FilterRules};
use crate::core::reconcile::{reconcile, ReconcileSummary};
use crate::core::scanner::FileScanner;
use crate::core::scheduler::{SchedulerConfig, SchedulerSummary, TransferScheduler};
use crate::core::shutdown::ShutdownHandle;
use crate::core::store::StateStore;
use crate::core::transfer::{MigrationState, TransferStatus};
use crate::core::tree::Tree;
use crate::error::{MigrateError, Result};
use crate::remote::{Fetcher, RemoteId, RemoteLister, ROOT_FOLDER_ID};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub root_folder: RemoteId,
    /// 本地目标根目录
    pub destination: PathBuf,
    pub state_file: PathBuf,
    pub filters: FilterRules,
    pub scheduler: SchedulerConfig,
    pub scan_concurrency: usize,
    pub autosave_interval: Duration,
    pub shutdown_grace: Duration,
    pub dry_run: bool,
    pub retry_failed: bool,
}

impl EngineOptions {
    pub fn new(destination: impl Into<PathBuf>, state_file: impl Into<PathBuf>) -> Self {
        Self {
            root_folder: ROOT_FOLDER_ID,
            destination: destination.into(),
            state_file: state_file.into(),
            filters: FilterRules::default(),
            scheduler: SchedulerConfig::default(),
            scan_concurrency: 4,
            autosave_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            dry_run: false,
            retry_failed: false,
        }
    }
}

/// 运行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 所有选中的文件都已完成
    Completed,
    /// 还有失败或未处理的文件
    Partial,
    /// 收到停机请求提前结束，可以直接重新运行继续
    Interrupted,
    /// 只生成了计划
    DryRun,
}

impl RunOutcome {
    /// 进程退出码
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Completed | RunOutcome::DryRun => 0,
            RunOutcome::Partial => 2,
            RunOutcome::Interrupted => 3,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Partial => write!(f, "partial"),
            RunOutcome::Interrupted => write!(f, "interrupted"),
            RunOutcome::DryRun => write!(f, "dry-run"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub remote_id: RemoteId,
    pub path: String,
    pub size: u64,
}

/// dry run 输出的计划
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    pub files: Vec<PlannedFile>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    pub path: String,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// 一次运行的汇总
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub completed: usize,
    pub failed: usize,
    pub orphaned: usize,
    /// 过滤后仍待处理的文件数
    pub pending_remaining: usize,
    /// 被过滤规则排除的文件数
    pub filtered_out: usize,
    /// 累计写入字节数（跨运行）
    pub bytes_transferred: u64,
    pub reconcile: ReconcileSummary,
    pub transfers: SchedulerSummary,
    pub plan: Option<MigrationPlan>,
    pub failures: Vec<FailedFile>,
    pub elapsed: Duration,
}

pub struct MigrationEngine {
    options: EngineOptions,
    lister: Arc<dyn RemoteLister>,
    fetcher: Arc<dyn Fetcher>,
    shutdown: ShutdownHandle,
}

impl MigrationEngine {
    pub fn new(
        options: EngineOptions,
        lister: Arc<dyn RemoteLister>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            options,
            lister,
            fetcher,
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// 执行一次完整迁移
    ///
    /// 只有扫描阶段远程不可用、认证失败或状态文件读写失败会返回错误；
    /// 单个文件的失败记录在状态中并体现在报告里。
    pub async fn run(&self) -> Result<MigrationReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("migration", run_id = %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<MigrationReport> {
        let started = Instant::now();
        let options = &self.options;
        info!(
            "开始迁移: {} 目录 {} -> {:?}{}",
            self.lister.name(),
            options.root_folder,
            options.destination,
            if options.dry_run { " (dry run)" } else { "" }
        );

        let filter = FilterEngine::new(&options.filters)?;

        let scanner =
            FileScanner::with_cancel(options.scan_concurrency, self.shutdown.stop_token());
        let tree = match scanner.scan(self.lister.as_ref(), options.root_folder).await {
            Ok(tree) => tree,
            Err(MigrateError::Interrupted) => {
                warn!("扫描阶段收到停机请求，状态未改动");
                let store = StateStore::load_read_only(&options.state_file).await?;
                let state = store.snapshot().await;
                let mut report = self.report(run_id, &state, None, started);
                report.outcome = RunOutcome::Interrupted;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        info!(
            "扫描完成: {} 个文件, {} 个目录, 共 {} 字节",
            tree.file_count(),
            tree.len() - tree.file_count(),
            tree.total_file_bytes()
        );

        let store = Arc::new(if options.dry_run {
            StateStore::load_read_only(&options.state_file).await?
        } else {
            StateStore::load(&options.state_file).await?
        });

        if options.retry_failed {
            let reset = store.reset_failed().await;
            info!("{} 个失败的文件已重新加入队列", reset);
        }

        let summary = store.with_state(|state| reconcile(state, &tree)).await;
        info!(
            "对账完成: 新增 {}, 变化 {}, 重新出现 {}, 远程已删除 {}, 未变化 {}",
            summary.added, summary.changed, summary.reappeared, summary.orphaned, summary.unchanged
        );
        store.save().await?;

        let selection = Selection::new(&tree, &filter, &store.snapshot().await);
        info!(
            "待传输 {} 个文件 ({} 字节)，过滤排除 {} 个",
            selection.pending.len(),
            selection.pending_bytes,
            selection.filtered_out
        );

        if options.dry_run {
            let plan = MigrationPlan {
                files: selection
                    .pending
                    .iter()
                    .filter_map(|id| tree.get(*id))
                    .map(|node| PlannedFile {
                        remote_id: node.id,
                        path: node.path.clone(),
                        size: node.size,
                    })
                    .collect(),
                total_bytes: selection.pending_bytes,
            };
            let state = store.snapshot().await;
            let mut report = self.report(run_id, &state, Some(&selection), started);
            report.reconcile = summary;
            report.plan = Some(plan);
            report.outcome = RunOutcome::DryRun;
            return Ok(report);
        }

        self.create_folders(&tree).await;

        let transfers = if self.shutdown.is_shutdown_requested() {
            SchedulerSummary::default()
        } else {
            self.transfer(&store, selection.pending.clone()).await
        };

        store.save().await?;
        let state = store.snapshot().await;
        let mut report = self.report(run_id, &state, Some(&selection), started);
        report.reconcile = summary;
        report.transfers = transfers;

        info!(
            "迁移结束 ({}): 完成 {}, 失败 {}, 待处理 {}, 远程已删除 {}, 用时 {:?}",
            report.outcome,
            report.completed,
            report.failed,
            report.pending_remaining,
            report.orphaned,
            report.elapsed
        );
        Ok(report)
    }

    /// 运行调度器，期间开启自动保存与停机宽限计时
    async fn transfer(&self, store: &Arc<StateStore>, ids: Vec<RemoteId>) -> SchedulerSummary {
        let done = CancellationToken::new();
        // 无论如何退出都要停掉后台任务
        let _stop_background = scopeguard::guard(done.clone(), |token| token.cancel());

        let autosave = store.spawn_autosave(self.options.autosave_interval, done.clone());
        let grace = self
            .shutdown
            .spawn_grace_watcher(self.options.shutdown_grace, done.clone());

        let scheduler = TransferScheduler::new(
            Arc::clone(store),
            Arc::clone(&self.fetcher),
            &self.options.destination,
            self.options.scheduler.clone(),
        )
        .with_tokens(self.shutdown.stop_token(), self.shutdown.abort_token());
        let summary = scheduler.run(ids).await;

        done.cancel();
        let _ = autosave.await;
        let _ = grace.await;
        summary
    }

    /// 预先创建目录结构（包括空目录）
    async fn create_folders(&self, tree: &Tree) {
        for folder in tree.folders() {
            let path = self.options.destination.join(&folder.path);
            if let Err(e) = tokio::fs::create_dir_all(&path).await {
                warn!("创建目录失败 {:?}: {}", path, e);
            }
        }
    }

    fn report(
        &self,
        run_id: Uuid,
        state: &MigrationState,
        selection: Option<&Selection>,
        started: Instant,
    ) -> MigrationReport {
        let counters = &state.counters;
        let (pending_remaining, failed_in_scope, filtered_out) = match selection {
            Some(selection) => {
                let in_scope = |status| {
                    selection
                        .matched
                        .iter()
                        .filter(|id| state.get(**id).is_some_and(|r| r.status == status))
                        .count()
                };
                (
                    in_scope(TransferStatus::Pending) + in_scope(TransferStatus::InProgress),
                    in_scope(TransferStatus::Failed),
                    selection.filtered_out,
                )
            }
            None => (
                counters.pending + counters.in_progress,
                counters.failed,
                0,
            ),
        };

        let outcome = if self.shutdown.is_shutdown_requested() {
            RunOutcome::Interrupted
        } else if pending_remaining > 0 || failed_in_scope > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Completed
        };

        MigrationReport {
            run_id,
            outcome,
            completed: counters.completed,
            failed: counters.failed,
            orphaned: counters.orphaned,
            pending_remaining,
            filtered_out,
            bytes_transferred: counters.bytes_transferred,
            reconcile: ReconcileSummary::default(),
            transfers: SchedulerSummary::default(),
            plan: None,
            failures: state
                .records_with_status(TransferStatus::Failed)
                .map(|r| FailedFile {
                    path: r.path.clone(),
                    last_error: r.last_error.clone(),
                    retry_count: r.retry_count,
                })
                .collect(),
            elapsed: started.elapsed(),
        }
    }
}

/// 过滤后的文件集合
struct Selection {
    /// 满足过滤规则的文件
    matched: HashSet<RemoteId>,
    /// 其中待处理的文件，保持父目录在前的顺序
    pending: Vec<RemoteId>,
    pending_bytes: u64,
    filtered_out: usize,
}

impl Selection {
    fn new(tree: &Tree, filter: &FilterEngine, state: &MigrationState) -> Self {
        let mut selection = Selection {
            matched: HashSet::new(),
            pending: Vec::new(),
            pending_bytes: 0,
            filtered_out: 0,
        };

        for node in tree.flatten() {
            if !filter.matches(node) {
                selection.filtered_out += 1;
                continue;
            }
            selection.matched.insert(node.id);
            if state
                .get(node.id)
                .is_some_and(|r| r.status == TransferStatus::Pending)
            {
                selection.pending.push(node.id);
                selection.pending_bytes += node.size;
            }
        }
        selection
    }
}
