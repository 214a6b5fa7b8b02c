//! 错误类型

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 远程 API 调用错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// 被限流，`retry_after` 为服务端建议的等待时长
    #[error("请求被限流，建议等待 {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("远程服务不可用: {0}")]
    Unavailable(String),
    #[error("认证失败: {0}")]
    Unauthorized(String),
    #[error("远程文件不存在: {0}")]
    NotFound(String),
}

/// 迁移过程中的致命错误
///
/// 单个文件的传输失败不会出现在这里，它们被限制在调度器内部，
/// 只记录到对应的 `TransferRecord` 中。
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("远程服务不可用: {0}")]
    RemoteUnavailable(#[source] RemoteError),
    #[error("认证失败: {0}")]
    Unauthorized(String),
    #[error("状态文件读写失败 {path:?}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("状态序列化失败: {0}")]
    StateEncode(#[from] serde_json::Error),
    #[error("远程目录树无效: {0}")]
    InvalidTree(String),
    #[error("配置无效: {0}")]
    Config(#[from] ConfigError),
    /// 扫描阶段收到关闭请求
    #[error("操作已取消")]
    Interrupted,
}

impl MigrateError {
    pub fn state_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MigrateError::StateIo {
            path: path.into(),
            source,
        }
    }
}

impl From<RemoteError> for MigrateError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized(msg) => MigrateError::Unauthorized(msg),
            other => MigrateError::RemoteUnavailable(other),
        }
    }
}

/// 配置校验错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("缺少必填项: {0}")]
    Missing(&'static str),
    #[error("目标路径不存在: {0:?}")]
    DestinationMissing(PathBuf),
    #[error("{field} 超出范围: {message}")]
    OutOfRange {
        field: &'static str,
        message: String,
    },
    #[error("过滤规则无效: {0}")]
    InvalidFilter(String),
}

pub type Result<T, E = MigrateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_remote_error_maps_to_unauthorized() {
        let err: MigrateError = RemoteError::Unauthorized("bad token".into()).into();
        assert!(matches!(err, MigrateError::Unauthorized(ref m) if m == "bad token"));

        let err: MigrateError = RemoteError::Unavailable("503".into()).into();
        assert!(matches!(err, MigrateError::RemoteUnavailable(_)));
    }
}
