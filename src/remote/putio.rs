//! Put.io API 客户端

use crate::config::PutioConfig;
use crate::error::RemoteError;
use crate::remote::{DownloadUrlResolver, NodeKind, RemoteEntry, RemoteId, RemoteLister};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 服务端没有给出 Retry-After 时的等待时间
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);
/// 单次等待限流窗口重置的上限
const MAX_RATE_LIMIT_SLEEP: Duration = Duration::from_secs(60);
const PAGE_SIZE: u32 = 1000;

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    files: Vec<PutioFile>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutioFile {
    id: RemoteId,
    name: String,
    #[serde(default)]
    file_type: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    parent_id: Option<RemoteId>,
}

impl From<PutioFile> for RemoteEntry {
    fn from(file: PutioFile) -> Self {
        let kind = if file.file_type.eq_ignore_ascii_case("FOLDER") {
            NodeKind::Folder
        } else {
            NodeKind::File
        };
        RemoteEntry {
            id: file.id,
            name: file.name,
            kind,
            size: if kind == NodeKind::Folder { 0 } else { file.size },
            parent_id: file.parent_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UrlResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    info: AccountInfo,
}

/// 账户信息
#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub username: String,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub disk: Option<DiskInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskInfo {
    #[serde(default)]
    pub avail: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub size: u64,
}

pub struct PutioClient {
    client: Client,
    base_url: String,
    token: String,
    retry_limit: u32,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    /// 5xx / 网络错误的退避单位，第 n 次重试等待 `unit × 2^n`
    backoff_unit: Duration,
}

impl PutioClient {
    pub fn new(config: &PutioConfig, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unavailable(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.oauth_token.clone(),
            retry_limit: config.retry_limit,
            min_interval: Duration::from_secs_f64(1.0 / f64::from(config.requests_per_second.max(1))),
            last_request: Mutex::new(None),
            backoff_unit: Duration::from_secs(1),
        })
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// 客户端限速：两次请求之间至少间隔 `min_interval`
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// 发送请求并解析 JSON，5xx 和网络错误按指数退避重试
    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<T, RemoteError> {
        let mut attempt = 0u32;
        loop {
            self.throttle().await;

            let failure = match build().bearer_auth(&self.token).send().await {
                Ok(response) => {
                    let status = response.status();
                    match status {
                        StatusCode::TOO_MANY_REQUESTS => {
                            let retry_after =
                                retry_after(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER);
                            warn!("Put.io 限流 {}，建议等待 {:?}", endpoint, retry_after);
                            return Err(RemoteError::RateLimited { retry_after });
                        }
                        StatusCode::UNAUTHORIZED => {
                            return Err(RemoteError::Unauthorized(
                                "OAuth token 无效或已过期".to_string(),
                            ));
                        }
                        StatusCode::NOT_FOUND => {
                            return Err(RemoteError::NotFound(endpoint.to_string()));
                        }
                        s if s.is_client_error() => {
                            let body = response.text().await.unwrap_or_default();
                            return Err(RemoteError::Unavailable(format!(
                                "{} 请求错误 {}: {}",
                                endpoint, s, body
                            )));
                        }
                        s if s.is_server_error() => format!("服务端错误 {}", s),
                        _ => {
                            self.respect_rate_limit(response.headers()).await;
                            match response.text().await {
                                Ok(body) => {
                                    return serde_json::from_str(&body).map_err(|e| {
                                        RemoteError::Unavailable(format!(
                                            "{} 响应解析失败: {}",
                                            endpoint, e
                                        ))
                                    });
                                }
                                Err(e) => format!("读取响应失败: {}", e),
                            }
                        }
                    }
                }
                Err(e) => format!("请求失败: {}", e),
            };

            if attempt >= self.retry_limit {
                return Err(RemoteError::Unavailable(format!(
                    "{} 重试 {} 次后仍失败: {}",
                    endpoint, self.retry_limit, failure
                )));
            }
            let delay = self.backoff_unit.saturating_mul(1u32 << attempt.min(16));
            warn!(
                "{} 失败，{:?} 后重试 ({}/{}): {}",
                endpoint,
                delay,
                attempt + 1,
                self.retry_limit,
                failure
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// 限流窗口已用完时等待到重置时间（最多 60 秒）
    async fn respect_rate_limit(&self, headers: &HeaderMap) {
        let remaining = header_u64(headers, "x-ratelimit-remaining");
        let reset = header_u64(headers, "x-ratelimit-reset");
        if let (Some(0), Some(reset)) = (remaining, reset) {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if reset > now {
                let wait = Duration::from_secs(reset - now).min(MAX_RATE_LIMIT_SLEEP);
                debug!("Put.io 限流窗口已用完，等待 {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }
    }

    pub async fn account_info(&self) -> Result<AccountInfo, RemoteError> {
        let url = self.url("account/info");
        let response: AccountResponse = self.call("account/info", || self.client.get(&url)).await?;
        Ok(response.info)
    }

    /// 列出目录的全部子节点（自动翻页）
    pub async fn list_folder(&self, folder_id: RemoteId) -> Result<Vec<RemoteEntry>, RemoteError> {
        let url = self.url("files/list");
        let query = [
            ("parent_id", folder_id.to_string()),
            ("per_page", PAGE_SIZE.to_string()),
        ];
        let mut page: ListResponse = self
            .call("files/list", || self.client.get(&url).query(&query))
            .await?;

        let mut entries: Vec<RemoteEntry> = page.files.drain(..).map(RemoteEntry::from).collect();
        let continue_url = self.url("files/list/continue");
        while let Some(cursor) = page.cursor.take().filter(|c| !c.is_empty()) {
            let form = [("cursor", cursor), ("per_page", PAGE_SIZE.to_string())];
            page = self
                .call("files/list/continue", || self.client.post(&continue_url).form(&form))
                .await?;
            entries.extend(page.files.drain(..).map(RemoteEntry::from));
        }

        debug!("目录 {} 有 {} 个子节点", folder_id, entries.len());
        Ok(entries)
    }

    pub async fn file_download_url(&self, file_id: RemoteId) -> Result<String, RemoteError> {
        let endpoint = format!("files/{}/url", file_id);
        let url = self.url(&endpoint);
        let response: UrlResponse = self.call(&endpoint, || self.client.get(&url)).await?;
        Ok(response.url)
    }
}

#[async_trait]
impl RemoteLister for PutioClient {
    async fn list(&self, folder_id: RemoteId) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.list_folder(folder_id).await
    }

    fn name(&self) -> &str {
        "put.io"
    }
}

#[async_trait]
impl DownloadUrlResolver for PutioClient {
    async fn download_url(&self, remote_id: RemoteId) -> Result<String, RemoteError> {
        self.file_download_url(remote_id).await
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// 解析 Retry-After（秒数）
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_u64(headers, RETRY_AFTER.as_str()).map(Duration::from_secs)
}
