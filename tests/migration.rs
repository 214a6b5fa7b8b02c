mod common;

use cloudmigrate_lib::core::{
    FilterRules, MigrationEngine, RunOutcome, ShutdownHandle, StateStore, TransferStatus,
};
use cloudmigrate_lib::remote::{Fetcher, RemoteLister, ROOT_FOLDER_ID};
use common::{options, FakeFetcher, FakeRemote};
use std::sync::Arc;
use tempfile::TempDir;

fn engine(
    options: cloudmigrate_lib::core::EngineOptions,
    remote: &Arc<FakeRemote>,
    fetcher: &Arc<FakeFetcher>,
) -> MigrationEngine {
    let lister: Arc<dyn RemoteLister> = remote.clone();
    let fetcher: Arc<dyn Fetcher> = fetcher.clone();
    MigrationEngine::new(options, lister, fetcher)
}

/// Movies/a.mkv, Movies/a.srt, TV/b.mkv
fn media_library() -> Arc<FakeRemote> {
    let remote = FakeRemote::new();
    remote
        .folder(1, "Movies", ROOT_FOLDER_ID)
        .folder(2, "TV", ROOT_FOLDER_ID)
        .file(10, "a.mkv", 100, 1)
        .file(11, "a.srt", 10, 1)
        .file(20, "b.mkv", 200, 2);
    Arc::new(remote)
}

#[tokio::test]
async fn test_full_migration_then_idempotent_rerun() {
    let dir = TempDir::new().unwrap();
    let remote = media_library();

    let fetcher = Arc::new(FakeFetcher::new());
    let report = engine(options(&dir), &remote, &fetcher).run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.completed, 3);
    assert_eq!(report.bytes_transferred, 310);
    assert_eq!(fetcher.calls(), 3);
    let dest = dir.path().join("dest");
    assert_eq!(std::fs::metadata(dest.join("Movies/a.mkv")).unwrap().len(), 100);
    assert_eq!(std::fs::metadata(dest.join("TV/b.mkv")).unwrap().len(), 200);

    // 第二次运行不应再下载任何文件
    let fetcher = Arc::new(FakeFetcher::new());
    let report = engine(options(&dir), &remote, &fetcher).run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.completed, 3);
    assert_eq!(report.bytes_transferred, 310);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_dry_run_fetches_nothing_and_writes_no_state() {
    let dir = TempDir::new().unwrap();
    let remote = media_library();
    let fetcher = Arc::new(FakeFetcher::new());

    let mut options = options(&dir);
    options.dry_run = true;
    let report = engine(options, &remote, &fetcher).run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::DryRun);
    let plan = report.plan.expect("dry run 应输出计划");
    assert_eq!(plan.files.len(), 3);
    assert_eq!(plan.total_bytes, 310);
    let paths: Vec<_> = plan.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, ["Movies/a.mkv", "Movies/a.srt", "TV/b.mkv"]);

    assert_eq!(fetcher.calls(), 0);
    assert!(!dir.path().join("state.json").exists());
    assert!(!dir.path().join("dest").exists());
}

#[tokio::test]
async fn test_filters_limit_transfers_without_making_run_partial() {
    let dir = TempDir::new().unwrap();
    let remote = media_library();
    let fetcher = Arc::new(FakeFetcher::new());

    let mut options = options(&dir);
    options.filters = FilterRules {
        include_patterns: vec!["Movies/**".into()],
        blocked_extensions: vec!["srt".into()],
        ..FilterRules::default()
    };
    let report = engine(options, &remote, &fetcher).run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.completed, 1);
    assert_eq!(report.filtered_out, 2);
    assert_eq!(report.pending_remaining, 0);
    assert_eq!(fetcher.fetched(), vec![10]);

    // 被排除的文件仍然记录为待处理，之后放开过滤可以继续
    let store = StateStore::load_read_only(dir.path().join("state.json")).await.unwrap();
    assert_eq!(store.status_of(11).await, Some(TransferStatus::Pending));
    assert_eq!(store.status_of(20).await, Some(TransferStatus::Pending));
    // 空目录结构照样创建
    assert!(dir.path().join("dest/TV").is_dir());
}

#[tokio::test]
async fn test_files_already_on_disk_complete_without_fetch() {
    let dir = TempDir::new().unwrap();
    let remote = media_library();
    let dest = dir.path().join("dest");
    std::fs::create_dir_all(dest.join("Movies")).unwrap();
    std::fs::write(dest.join("Movies/a.mkv"), vec![b'a'; 100]).unwrap();

    let fetcher = Arc::new(FakeFetcher::new());
    let report = engine(options(&dir), &remote, &fetcher).run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.completed, 3);
    assert!(!fetcher.fetched().contains(&10));
    // 原有内容没有被覆盖
    assert_eq!(std::fs::read(dest.join("Movies/a.mkv")).unwrap(), vec![b'a'; 100]);
}

#[tokio::test]
async fn test_shutdown_keeps_in_flight_files_pending() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new();
    remote.folder(1, "Library", ROOT_FOLDER_ID);
    for i in 0..53u64 {
        remote.file(100 + i, &format!("file-{:02}.bin", i), 1000, 1);
    }
    let remote = Arc::new(remote);

    // 前 5 个立即完成，之后的 3 个挂起，剩下 45 个从未开始
    let fetcher = Arc::new(FakeFetcher::hang_after(5));
    let shutdown = ShutdownHandle::new();
    let engine = engine(options(&dir), &remote, &fetcher).with_shutdown(shutdown.clone());

    let (report, ()) = tokio::join!(engine.run(), async {
        fetcher.wait_for_hanging(3).await;
        assert!(shutdown.request_shutdown());
        assert!(!shutdown.request_shutdown());
    });
    let report = report.unwrap();

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.outcome.exit_code(), 3);
    assert_eq!(report.completed, 5);
    assert_eq!(report.pending_remaining, 48);
    assert_eq!(report.transfers.interrupted, 3);
    assert_eq!(fetcher.calls(), 8);
    assert_eq!(fetcher.hung().len(), 3);

    let store = StateStore::load_read_only(dir.path().join("state.json")).await.unwrap();
    let state = store.snapshot().await;
    assert_eq!(state.counters.completed, 5);
    assert_eq!(state.counters.pending, 48);
    assert_eq!(state.counters.in_progress, 0);
    // 5 个完成的文件加上 3 个中断文件各写入的一半
    assert_eq!(state.counters.bytes_transferred, 6500);

    // 挂起的文件保留了部分数据，下次可以续传
    for id in &fetcher.hung() {
        let record = state.get(*id).unwrap();
        assert_eq!(record.status, TransferStatus::Pending);
        let path = dir.path().join("dest").join(&record.path);
        assert_eq!(std::fs::metadata(path).unwrap().len(), 500);
    }
}

#[tokio::test]
async fn test_interrupted_run_resumes_on_next_run() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new();
    for i in 0..6u64 {
        remote.file(10 + i, &format!("part-{}.bin", i), 400, ROOT_FOLDER_ID);
    }
    let remote = Arc::new(remote);

    let fetcher = Arc::new(FakeFetcher::hang_after(2));
    let shutdown = ShutdownHandle::new();
    let first = engine(options(&dir), &remote, &fetcher).with_shutdown(shutdown.clone());
    let (report, ()) = tokio::join!(first.run(), async {
        fetcher.wait_for_hanging(1).await;
        shutdown.request_shutdown();
    });
    let report = report.unwrap();
    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.completed, 2);
    let store = StateStore::load_read_only(dir.path().join("state.json")).await.unwrap();
    let done_first: Vec<_> = store
        .snapshot()
        .await
        .records_with_status(TransferStatus::Completed)
        .map(|r| r.remote_id)
        .collect();
    assert_eq!(done_first.len(), 2);

    let fetcher = Arc::new(FakeFetcher::new());
    let report = engine(options(&dir), &remote, &fetcher).run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.completed, 6);
    assert_eq!(fetcher.calls(), 4);
    let fetched = fetcher.fetched();
    assert!(done_first.iter().all(|id| !fetched.contains(id)));

    for i in 0..6 {
        let path = dir.path().join(format!("dest/part-{}.bin", i));
        assert_eq!(std::fs::metadata(path).unwrap().len(), 400);
    }
}

#[tokio::test]
async fn test_remote_deletion_marks_record_orphaned() {
    let dir = TempDir::new().unwrap();
    let remote = media_library();

    let fetcher = Arc::new(FakeFetcher::new());
    engine(options(&dir), &remote, &fetcher).run().await.unwrap();

    remote.remove(20);
    let report = engine(options(&dir), &remote, &fetcher).run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.reconcile.orphaned, 1);
    // 本地文件不会被删除
    assert!(dir.path().join("dest/TV/b.mkv").exists());
}

#[tokio::test]
async fn test_corrupt_state_file_is_backed_up_and_rebuilt() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    std::fs::write(&state_path, b"{ not json").unwrap();
    let remote = media_library();

    let fetcher = Arc::new(FakeFetcher::new());
    let report = engine(options(&dir), &remote, &fetcher).run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.completed, 3);

    let backups: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("state.json.corrupt-"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(
        std::fs::read(dir.path().join(&backups[0])).unwrap(),
        b"{ not json"
    );

    let store = StateStore::load_read_only(&state_path).await.unwrap();
    assert_eq!(store.snapshot().await.counters.completed, 3);
}

#[tokio::test]
async fn test_changed_remote_file_is_downloaded_from_scratch() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new();
    remote.file(7, "clip.mp4", 200, ROOT_FOLDER_ID);
    let remote = Arc::new(remote);

    let old = Arc::new(FakeFetcher::with_fill(b'o'));
    engine(options(&dir), &remote, &old).run().await.unwrap();
    let output = dir.path().join("dest/clip.mp4");
    assert_eq!(std::fs::read(&output).unwrap(), vec![b'o'; 200]);

    // 云端文件被替换为更大的新版本
    remote.resize(7, 300);
    let new = Arc::new(FakeFetcher::with_fill(b'n'));
    let report = engine(options(&dir), &remote, &new).run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(new.offsets(), vec![(7, 0)]);
    assert_eq!(std::fs::read(&output).unwrap(), vec![b'n'; 300]);

    let store = StateStore::load_read_only(dir.path().join("state.json")).await.unwrap();
    let state = store.snapshot().await;
    let record = state.get(7).unwrap();
    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(record.expected_size, 300);
    assert!(!record.restart);
}
