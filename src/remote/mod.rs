pub mod axel;
pub mod http;
pub mod putio;

use crate::error::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use axel::AxelFetcher;
pub use http::HttpFetcher;
pub use putio::PutioClient;

/// 远程文件唯一标识
pub type RemoteId = u64;

/// 根目录的远程 ID
pub const ROOT_FOLDER_ID: RemoteId = 0;

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// 列目录返回的单个条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: RemoteId,
    pub name: String,
    pub kind: NodeKind,
    /// 文件大小（目录为 0）
    pub size: u64,
    pub parent_id: Option<RemoteId>,
}

impl RemoteEntry {
    pub fn file(id: RemoteId, name: &str, size: u64, parent_id: RemoteId) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: NodeKind::File,
            size,
            parent_id: Some(parent_id),
        }
    }

    pub fn folder(id: RemoteId, name: &str, parent_id: RemoteId) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: NodeKind::Folder,
            size: 0,
            parent_id: Some(parent_id),
        }
    }
}

/// 远程目录列表接口
#[async_trait]
pub trait RemoteLister: Send + Sync {
    /// 列出目录的直接子节点（分页由实现自行处理）
    async fn list(&self, folder_id: RemoteId) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// 获取名称（用于日志）
    fn name(&self) -> &str;
}

/// 下载地址解析
#[async_trait]
pub trait DownloadUrlResolver: Send + Sync {
    async fn download_url(&self, remote_id: RemoteId) -> Result<String, RemoteError>;
}

/// 单次下载的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    TransientFailure(String),
    RateLimited(Duration),
    /// 重试也无法成功（例如远程文件已被删除）
    PermanentFailure(String),
    /// 收到中断请求，已写入的部分保留在磁盘上
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// 本次调用新写入的字节数（不含续传前已存在的部分）
    pub bytes_written: u64,
    pub outcome: FetchOutcome,
}

impl FetchResult {
    pub fn success(bytes_written: u64) -> Self {
        Self {
            bytes_written,
            outcome: FetchOutcome::Success,
        }
    }

    pub fn failure(bytes_written: u64, reason: impl Into<String>) -> Self {
        Self {
            bytes_written,
            outcome: FetchOutcome::TransientFailure(reason.into()),
        }
    }

    pub fn interrupted(bytes_written: u64) -> Self {
        Self {
            bytes_written,
            outcome: FetchOutcome::Interrupted,
        }
    }

    /// 把解析下载地址时的远程错误转换为下载结果
    pub fn from_remote_error(err: RemoteError) -> Self {
        let outcome = match err {
            RemoteError::RateLimited { retry_after } => FetchOutcome::RateLimited(retry_after),
            RemoteError::NotFound(msg) => FetchOutcome::PermanentFailure(msg),
            other => FetchOutcome::TransientFailure(other.to_string()),
        };
        Self {
            bytes_written: 0,
            outcome,
        }
    }
}

/// 下载能力
///
/// 实现必须支持续传：`destination` 已存在的部分文件从其当前长度继续写入，
/// 而不是从头开始。`cancel` 触发后应尽快停止并保证磁盘上的部分文件有效。
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        remote_id: RemoteId,
        destination: &Path,
        expected_size: u64,
        cancel: &CancellationToken,
    ) -> FetchResult;

    fn name(&self) -> &str;
}

/// 已存在的部分文件长度，不存在时为 0
pub(crate) async fn existing_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}
