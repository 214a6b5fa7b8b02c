//! 迁移配置（TOML）

use crate::core::engine::EngineOptions;
use crate::core::filter::{FilterEngine, FilterRules};
use crate::core::retry::RetryPolicy;
use crate::core::scheduler::SchedulerConfig;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::remote::{RemoteId, ROOT_FOLDER_ID};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Put.io 账户与 API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutioConfig {
    #[serde(default)]
    pub oauth_token: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// 从哪个远程目录开始迁移，0 为根目录
    #[serde(default = "default_root_folder_id")]
    pub root_folder_id: RemoteId,
    /// 客户端限速（每秒请求数）
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// API 请求遇到 5xx / 网络错误时的重试次数
    #[serde(default = "default_request_retry_limit")]
    pub retry_limit: u32,
}

fn default_api_base_url() -> String {
    "https://api.put.io/v2".to_string()
}

fn default_root_folder_id() -> RemoteId {
    ROOT_FOLDER_ID
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_user_agent() -> String {
    format!("cloudmigrate/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_retry_limit() -> u32 {
    3
}

impl Default for PutioConfig {
    fn default() -> Self {
        Self {
            oauth_token: String::new(),
            api_base_url: default_api_base_url(),
            root_folder_id: default_root_folder_id(),
            requests_per_second: default_requests_per_second(),
            user_agent: default_user_agent(),
            retry_limit: default_request_retry_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(default)]
    pub base_path: PathBuf,
}

/// 下载方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloaderKind {
    /// 外部 axel 多连接下载
    #[default]
    Axel,
    /// 内置 HTTP 断点续传
    Http,
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub downloader: DownloaderKind,
    /// 单个文件的连接数（axel）
    #[serde(default = "default_connections")]
    pub connections: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// 同时进行的文件传输数
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 单个文件最多尝试次数
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_seconds")]
    pub retry_base_delay_seconds: u64,
    #[serde(default = "default_retry_max_delay_seconds")]
    pub retry_max_delay_seconds: u64,
    /// axel 不可用或失败时改用内置 HTTP 下载
    #[serde(default = "default_true")]
    pub use_fallback_downloader: bool,
    /// 扫描远程目录的并发数
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    /// 停机时等待进行中传输的时间
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    /// 中断信号发出后等待下载器自行退出的时间
    #[serde(default = "default_force_stop_seconds")]
    pub force_stop_seconds: u64,
}

fn default_connections() -> u32 {
    4
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    3
}

fn default_retry_max_attempts() -> u32 {
    4
}

fn default_retry_base_delay_seconds() -> u64 {
    2
}

fn default_retry_max_delay_seconds() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_scan_concurrency() -> usize {
    4
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

fn default_force_stop_seconds() -> u64 {
    5
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            downloader: DownloaderKind::default(),
            connections: default_connections(),
            timeout_seconds: default_timeout_seconds(),
            max_concurrency: default_max_concurrency(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_seconds: default_retry_base_delay_seconds(),
            retry_max_delay_seconds: default_retry_max_delay_seconds(),
            use_fallback_downloader: default_true(),
            scan_concurrency: default_scan_concurrency(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            force_stop_seconds: default_force_stop_seconds(),
        }
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_secs(self.retry_base_delay_seconds),
            max_delay: Duration::from_secs(self.retry_max_delay_seconds),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: self.max_concurrency,
            retry: self.retry_policy(),
            force_stop_window: Duration::from_secs(self.force_stop_seconds),
        }
    }
}

/// 过滤配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    #[serde(flatten)]
    pub rules: FilterRules,
    /// 以 GB 表示的最大文件大小，与 `max_size` 同时存在时取较小值
    #[serde(default)]
    pub max_file_size_gb: Option<f64>,
}

impl FiltersConfig {
    /// 合并后的过滤规则
    pub fn rules(&self) -> FilterRules {
        let mut rules = self.rules.clone();
        if let Some(gb) = self.max_file_size_gb.filter(|gb| *gb > 0.0) {
            let bytes = (gb * 1024.0 * 1024.0 * 1024.0) as u64;
            rules.max_size = Some(rules.max_size.map_or(bytes, |max| max.min(bytes)));
        }
        rules
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_file")]
    pub file_path: PathBuf,
    #[serde(default = "default_autosave_interval_seconds")]
    pub autosave_interval_seconds: u64,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("migration_state.json")
}

fn default_autosave_interval_seconds() -> u64 {
    30
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            file_path: default_state_file(),
            autosave_interval_seconds: default_autosave_interval_seconds(),
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub putio: PutioConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub logging: LogConfig,
    /// 只输出计划，不下载也不写状态文件（命令行参数）
    #[serde(skip)]
    pub dry_run: bool,
    /// 把失败的文件重新放回待处理（命令行参数）
    #[serde(skip)]
    pub retry_failed: bool,
}

const SAMPLE_CONFIG: &str = r#"# cloudmigrate configuration

[putio]
oauth_token = "YOUR_PUTIO_OAUTH_TOKEN_HERE"
api_base_url = "https://api.put.io/v2"
root_folder_id = 0
requests_per_second = 5

[destination]
base_path = "/path/to/your/nas/downloads"

[transfer]
# "axel" or "http"
downloader = "axel"
connections = 4
timeout_seconds = 30
max_concurrency = 3
retry_max_attempts = 4
use_fallback_downloader = true
shutdown_grace_seconds = 30

[filters]
allowed_extensions = ["mp4", "mkv", "avi", "mp3", "flac"]
blocked_extensions = ["tmp", "part"]
# max_file_size_gb = 50
# exclude_patterns = ["**/Sample/**"]

[state]
file_path = "migration_state.json"
autosave_interval_seconds = 30

[logging]
level = "info"
file_path = "migration.log"
"#;

impl MigrationConfig {
    /// 从 TOML 文件加载配置（不做校验）
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// 写出示例配置
    pub fn write_sample(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建配置目录失败: {}", parent.display()))?;
        }
        fs::write(path, SAMPLE_CONFIG)
            .with_context(|| format!("写入示例配置失败: {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.putio.oauth_token.trim().is_empty() {
            return Err(ConfigError::Missing("putio.oauth_token"));
        }
        if self.destination.base_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("destination.base_path"));
        }
        if !self.destination.base_path.is_dir() {
            return Err(ConfigError::DestinationMissing(
                self.destination.base_path.clone(),
            ));
        }

        let transfer = &self.transfer;
        if !(1..=16).contains(&transfer.connections) {
            return Err(out_of_range("transfer.connections", "必须在 1 到 16 之间"));
        }
        if transfer.timeout_seconds == 0 {
            return Err(out_of_range("transfer.timeout_seconds", "必须大于 0"));
        }
        if transfer.max_concurrency == 0 {
            return Err(out_of_range("transfer.max_concurrency", "至少为 1"));
        }
        if transfer.retry_max_attempts == 0 {
            return Err(out_of_range("transfer.retry_max_attempts", "至少为 1"));
        }
        if transfer.scan_concurrency == 0 {
            return Err(out_of_range("transfer.scan_concurrency", "至少为 1"));
        }
        if self.putio.requests_per_second == 0 {
            return Err(out_of_range("putio.requests_per_second", "必须大于 0"));
        }
        if self.state.autosave_interval_seconds == 0 {
            return Err(out_of_range("state.autosave_interval_seconds", "必须大于 0"));
        }

        // 编译一次规则即可发现无效的 glob 和大小范围
        FilterEngine::new(&self.filters.rules())?;
        Ok(())
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.state.autosave_interval_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.transfer.shutdown_grace_seconds)
    }

    /// 转换为引擎运行参数
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            root_folder: self.putio.root_folder_id,
            destination: self.destination.base_path.clone(),
            state_file: self.state.file_path.clone(),
            filters: self.filters.rules(),
            scheduler: self.transfer.scheduler_config(),
            scan_concurrency: self.transfer.scan_concurrency,
            autosave_interval: self.autosave_interval(),
            shutdown_grace: self.shutdown_grace(),
            dry_run: self.dry_run,
            retry_failed: self.retry_failed,
        }
    }
}

fn out_of_range(field: &'static str, message: &str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        message: message.to_string(),
    }
}
