//! 内置 HTTP 下载器，基于 Range 请求断点续传

use crate::remote::putio::retry_after;
use crate::remote::{
    existing_len, DownloadUrlResolver, FetchOutcome, FetchResult, Fetcher, RemoteId,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

pub struct HttpFetcher {
    client: Client,
    resolver: Arc<dyn DownloadUrlResolver>,
    /// 两个数据块之间允许的最长间隔
    read_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(
        resolver: Arc<dyn DownloadUrlResolver>,
        read_timeout: Duration,
        user_agent: &str,
    ) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .connect_timeout(read_timeout)
            .build()?;
        Ok(Self {
            client,
            resolver,
            read_timeout,
        })
    }

    /// 下载 `url` 到 `destination`，已有部分从末尾续传
    pub async fn fetch_url(
        &self,
        url: &str,
        destination: &Path,
        expected_size: u64,
        cancel: &CancellationToken,
    ) -> FetchResult {
        if expected_size == 0 {
            return match File::create(destination).await {
                Ok(_) => FetchResult::success(0),
                Err(e) => FetchResult::failure(0, format!("创建文件失败: {}", e)),
            };
        }

        let existing = existing_len(destination).await;
        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={}-", existing));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return FetchResult::interrupted(0),
            response = request.send() => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => return FetchResult::failure(0, format!("请求失败: {}", e)),
        };

        let append = match response.status() {
            StatusCode::PARTIAL_CONTENT if existing > 0 => {
                let expected_prefix = format!("bytes {}-", existing);
                let range_ok = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map_or(true, |v| v.starts_with(&expected_prefix));
                if !range_ok {
                    return FetchResult::failure(0, "服务端返回的续传范围不匹配");
                }
                debug!("从 {} 字节处续传 {:?}", existing, destination);
                true
            }
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
                if existing > 0 {
                    warn!("服务端不支持续传，从头下载 {:?}", destination);
                }
                false
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // 本地已经是完整文件，交给大小校验判断
                return FetchResult::success(0);
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return FetchResult {
                    bytes_written: 0,
                    outcome: FetchOutcome::RateLimited(
                        retry_after(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER),
                    ),
                };
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return FetchResult {
                    bytes_written: 0,
                    outcome: FetchOutcome::PermanentFailure(format!(
                        "远程文件不存在 (HTTP {})",
                        response.status()
                    )),
                };
            }
            status => return FetchResult::failure(0, format!("HTTP {}", status)),
        };

        let file = if append {
            OpenOptions::new().append(true).open(destination).await
        } else {
            File::create(destination).await
        };
        let mut file = match file {
            Ok(file) => file,
            Err(e) => return FetchResult::failure(0, format!("打开文件失败: {}", e)),
        };

        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return FetchResult::interrupted(written);
                }
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            match next {
                Ok(Some(Ok(chunk))) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        let _ = file.flush().await;
                        return FetchResult::failure(written, format!("写入失败: {}", e));
                    }
                    written += chunk.len() as u64;
                }
                Ok(Some(Err(e))) => {
                    let _ = file.flush().await;
                    return FetchResult::failure(written, format!("下载中断: {}", e));
                }
                Ok(None) => break,
                Err(_) => {
                    let _ = file.flush().await;
                    return FetchResult::failure(
                        written,
                        format!("{:?} 内没有收到数据", self.read_timeout),
                    );
                }
            }
        }

        if let Err(e) = file.sync_all().await {
            return FetchResult::failure(written, format!("写入磁盘失败: {}", e));
        }
        FetchResult::success(written)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
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
        match url {
            Ok(url) => self.fetch_url(&url, destination, expected_size, cancel).await,
            Err(e) => FetchResult::from_remote_error(e),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
