#![allow(dead_code)]

use async_trait::async_trait;
use cloudmigrate_lib::core::{EngineOptions, SchedulerConfig};
use cloudmigrate_lib::error::RemoteError;
use cloudmigrate_lib::remote::{
    FetchResult, Fetcher, RemoteEntry, RemoteId, RemoteLister, ROOT_FOLDER_ID,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// 内存中的远程目录
#[derive(Default)]
pub struct FakeRemote {
    children: Mutex<HashMap<RemoteId, Vec<RemoteEntry>>>,
    lists: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn folder(&self, id: RemoteId, name: &str, parent: RemoteId) -> &Self {
        self.push(RemoteEntry::folder(id, name, parent));
        self
    }

    pub fn file(&self, id: RemoteId, name: &str, size: u64, parent: RemoteId) -> &Self {
        self.push(RemoteEntry::file(id, name, size, parent));
        self
    }

    /// 删除远程文件（模拟用户在云端删除）
    pub fn remove(&self, id: RemoteId) {
        let mut children = self.children.lock().unwrap();
        for entries in children.values_mut() {
            entries.retain(|e| e.id != id);
        }
    }

    /// 修改远程文件大小（模拟云端文件被替换）
    pub fn resize(&self, id: RemoteId, size: u64) {
        let mut children = self.children.lock().unwrap();
        for entry in children.values_mut().flatten().filter(|e| e.id == id) {
            entry.size = size;
        }
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    fn push(&self, entry: RemoteEntry) {
        let parent = entry.parent_id.unwrap_or(ROOT_FOLDER_ID);
        self.children
            .lock()
            .unwrap()
            .entry(parent)
            .or_default()
            .push(entry);
    }
}

#[async_trait]
impl RemoteLister for FakeRemote {
    async fn list(&self, folder_id: RemoteId) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .children
            .lock()
            .unwrap()
            .get(&folder_id)
            .cloned()
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// 按预期大小写入 `x`（或 `with_fill` 指定的字节）的下载器
///
/// 设置 `hang_after` 后，超过该数量的调用只写入一半数据，然后一直等待取消。
#[derive(Default)]
pub struct FakeFetcher {
    calls: AtomicUsize,
    hanging: AtomicUsize,
    hang_after: Option<usize>,
    fill: Option<u8>,
    fetched: Mutex<Vec<RemoteId>>,
    offsets: Mutex<Vec<(RemoteId, u64)>>,
    hung: Mutex<Vec<RemoteId>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hang_after(completed: usize) -> Self {
        Self {
            hang_after: Some(completed),
            ..Self::default()
        }
    }

    pub fn with_fill(fill: u8) -> Self {
        Self {
            fill: Some(fill),
            ..Self::default()
        }
    }

    /// 每次调用开始时本地已有的字节数
    pub fn offsets(&self) -> Vec<(RemoteId, u64)> {
        self.offsets.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn hanging(&self) -> usize {
        self.hanging.load(Ordering::SeqCst)
    }

    pub fn fetched(&self) -> Vec<RemoteId> {
        self.fetched.lock().unwrap().clone()
    }

    /// 挂起后被中断的文件
    pub fn hung(&self) -> Vec<RemoteId> {
        self.hung.lock().unwrap().clone()
    }

    /// 等待指定数量的调用进入挂起状态
    pub async fn wait_for_hanging(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.hanging() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("传输没有按预期挂起");
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        remote_id: RemoteId,
        destination: &Path,
        expected_size: u64,
        cancel: &CancellationToken,
    ) -> FetchResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(remote_id);

        let existing = tokio::fs::metadata(destination)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        self.offsets.lock().unwrap().push((remote_id, existing));
        let fill = self.fill.unwrap_or(b'x');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)
            .await
            .unwrap();

        let missing = expected_size.saturating_sub(existing);
        if self.hang_after.is_some_and(|limit| call >= limit) {
            let half = missing / 2;
            file.write_all(&vec![fill; half as usize]).await.unwrap();
            file.flush().await.unwrap();
            self.hung.lock().unwrap().push(remote_id);
            self.hanging.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            return FetchResult::interrupted(half);
        }

        file.write_all(&vec![fill; missing as usize]).await.unwrap();
        file.sync_all().await.unwrap();
        FetchResult::success(missing)
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// 临时目录下的引擎参数：目标目录 `dest`，状态文件 `state.json`
pub fn options(dir: &TempDir) -> EngineOptions {
    let mut options = EngineOptions::new(dir.path().join("dest"), dir.path().join("state.json"));
    options.scheduler = SchedulerConfig {
        max_concurrency: 3,
        ..SchedulerConfig::default()
    };
    options.autosave_interval = Duration::from_millis(50);
    options.shutdown_grace = Duration::from_millis(200);
    options
}
