//! axel 多连接下载，失败时可回退到内置 HTTP 下载

use crate::remote::http::HttpFetcher;
use crate::remote::{existing_len, DownloadUrlResolver, FetchOutcome, FetchResult, Fetcher, RemoteId};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct AxelFetcher {
    binary: PathBuf,
    connections: u32,
    timeout: Duration,
    resolver: Arc<dyn DownloadUrlResolver>,
    fallback: Option<HttpFetcher>,
}

impl AxelFetcher {
    pub fn new(resolver: Arc<dyn DownloadUrlResolver>, connections: u32, timeout: Duration) -> Self {
        Self {
            binary: PathBuf::from("axel"),
            connections,
            timeout,
            resolver,
            fallback: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// axel 不可用或退出码非零时改用 `fallback`
    pub fn with_fallback(mut self, fallback: HttpFetcher) -> Self {
        self.fallback = Some(fallback);
        self
    }

    async fn run_axel(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let resume = existing_len(destination).await > 0;

        let mut command = Command::new(&self.binary);
        command
            .arg("-n")
            .arg(self.connections.to_string())
            .arg("-T")
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg("-o")
            .arg(destination);
        if resume {
            command.arg("-c");
        }
        command
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| format!("无法启动 {:?}: {}", self.binary, e))?;
        debug!("axel 开始下载 {:?} (续传: {})", destination, resume);

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(format!("axel 退出码 {}", status.code().unwrap_or(-1))),
                Err(e) => Err(format!("等待 axel 失败: {}", e)),
            },
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(String::new())
            }
        }
    }
}

#[async_trait]
impl Fetcher for AxelFetcher {
    async fn fetch(
        &self,
        remote_id: RemoteId,
        destination: &Path,
        expected_size: u64,
        cancel: &CancellationToken,
    ) -> FetchResult {
        let url = tokio::select! {
            biased;
            _ = cancel.cancelled() => return FetchResult::interrupted(0),
            url = self.resolver.download_url(remote_id) => url,
        };
        let url = match url {
            Ok(url) => url,
            Err(e) => return FetchResult::from_remote_error(e),
        };

        let before = existing_len(destination).await;
        let result = self.run_axel(&url, destination, cancel).await;
        let written = existing_len(destination).await.saturating_sub(before);

        if cancel.is_cancelled() {
            return FetchResult::interrupted(written);
        }
        let reason = match result {
            Ok(()) => return FetchResult::success(written),
            Err(reason) => reason,
        };

        match &self.fallback {
            Some(http) => {
                warn!("{}，改用 HTTP 下载 {:?}", reason, destination);
                let mut result = http.fetch_url(&url, destination, expected_size, cancel).await;
                result.bytes_written += written;
                result
            }
            None => FetchResult {
                bytes_written: written,
                outcome: FetchOutcome::TransientFailure(reason),
            },
        }
    }

    fn name(&self) -> &str {
        "axel"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticUrl(String);

    #[async_trait]
    impl DownloadUrlResolver for StaticUrl {
        async fn download_url(&self, _remote_id: RemoteId) -> Result<String, RemoteError> {
            Ok(self.0.clone())
        }
    }

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-axel");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn resolver(url: &str) -> Arc<dyn DownloadUrlResolver> {
        Arc::new(StaticUrl(url.to_string()))
    }

    #[tokio::test]
    async fn test_axel_arguments_and_success() {
        let dir = TempDir::new().unwrap();
        // -n 4 -T 30 -o <dest> <url>
        let binary = script(&dir, r#"[ "$1" = "-n" ] && [ "$5" = "-o" ] && printf hello > "$6""#);
        let dest = dir.path().join("out.bin");

        let fetcher = AxelFetcher::new(resolver("http://example.invalid/f"), 4, Duration::from_secs(30))
            .with_binary(binary);
        let result = fetcher.fetch(1, &dest, 5, &CancellationToken::new()).await;

        assert_eq!(result, FetchResult::success(5));
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_failure_without_fallback_is_transient() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "exit 3");
        let fetcher = AxelFetcher::new(resolver("http://example.invalid/f"), 4, Duration::from_secs(30))
            .with_binary(binary);

        let result = fetcher
            .fetch(1, &dir.path().join("out.bin"), 5, &CancellationToken::new())
            .await;
        assert!(matches!(result.outcome, FetchOutcome::TransientFailure(ref r) if r.contains("3")));
    }

    #[tokio::test]
    async fn test_missing_binary_falls_back_to_http() {
        let server = MockServer::start().await;
        Mock::given(path("/f"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");
        let url_resolver = resolver(&format!("{}/f", server.uri()));
        let http = HttpFetcher::new(url_resolver.clone(), Duration::from_secs(5), "test").unwrap();
        let fetcher = AxelFetcher::new(url_resolver, 4, Duration::from_secs(30))
            .with_binary(dir.path().join("no-such-axel"))
            .with_fallback(http);

        let result = fetcher.fetch(1, &dest, 10, &CancellationToken::new()).await;

        assert_eq!(result, FetchResult::success(10));
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
    }
}
