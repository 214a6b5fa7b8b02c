//! 优雅停机
//!
//! 两阶段：`stop` 触发后不再派发新传输，宽限期结束后 `abort` 触发，
//! 中断仍在进行的传输。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    stop: CancellationToken,
    abort: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求停机，只有第一次调用生效，返回本次调用是否发起了停机
    pub fn request_shutdown(&self) -> bool {
        if self
            .requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("已在停机过程中，忽略重复的停机请求");
            return false;
        }
        info!("收到停机请求，停止派发新任务");
        self.stop.cancel();
        true
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// 停止派发新任务
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// 中断进行中的传输
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// 停机请求后等待 `grace`，然后中断所有进行中的传输
    ///
    /// `done` 触发时（运行已正常结束）直接退出。
    pub fn spawn_grace_watcher(&self, grace: Duration, done: CancellationToken) -> JoinHandle<()> {
        let stop = self.stop.clone();
        let abort = self.abort.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => return,
                _ = stop.cancelled() => {}
            }
            tokio::select! {
                _ = done.cancelled() => {}
                _ = abort.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    warn!("宽限期 {:?} 已到，中断进行中的传输", grace);
                    abort.cancel();
                }
            }
        })
    }

    /// 监听 SIGINT / SIGTERM，每次信号都调用 `request_shutdown`
    pub fn install_signal_handlers(&self) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = wait_for_signal().await {
                    warn!("无法监听停机信号: {}", e);
                    return;
                }
                handle.request_shutdown();
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shutdown_is_idempotent() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_shutdown_requested());
        assert!(handle.request_shutdown());
        assert!(!handle.request_shutdown());
        assert!(handle.stop_token().is_cancelled());
        assert!(!handle.abort_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_grace_watcher_aborts_after_grace() {
        let handle = ShutdownHandle::new();
        let done = CancellationToken::new();
        let watcher = handle.spawn_grace_watcher(Duration::from_millis(30), done);

        handle.request_shutdown();
        watcher.await.unwrap();
        assert!(handle.abort_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_grace_watcher_exits_when_run_finishes() {
        let handle = ShutdownHandle::new();
        let done = CancellationToken::new();
        let watcher = handle.spawn_grace_watcher(Duration::from_millis(30), done.clone());

        done.cancel();
        watcher.await.unwrap();
        assert!(!handle.abort_token().is_cancelled());
    }
}
