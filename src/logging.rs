//! 日志模块 - 控制台输出 + 可选的按大小轮转的文件日志

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志文件路径，未设置时只输出到控制台
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

fn default_max_size_mb() -> u32 {
    5
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
            file_path: None,
            max_size_mb: default_max_size_mb(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" | "warning" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    /// `RUST_LOG` 优先，否则使用配置的级别
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{},hyper=warn,reqwest=warn",
                self.tracing_level().as_str().to_lowercase()
            ))
        })
    }
}

/// 带大小限制的日志写入器，超过上限时 `x.log` 轮转为 `x.log.old`
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl SizeRotatingWriter {
    pub fn new(file_path: &Path, max_size_mb: u32) -> io::Result<Self> {
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let max_size = u64::from(max_size_mb.max(1)) * 1024 * 1024;
        let mut writer = Self {
            file_path: file_path.to_path_buf(),
            max_size,
            written: 0,
            writer: None,
        };
        writer.open()?;
        Ok(writer)
    }

    fn open(&mut self) -> io::Result<()> {
        let current = fs::metadata(&self.file_path).map(|m| m.len()).unwrap_or(0);
        if current > self.max_size {
            self.rotate()?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.file_path.file_name().unwrap_or_default().to_os_string();
        name.push(".old");
        self.file_path.with_file_name(name)
    }

    /// 轮转日志文件，只保留一个备份
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
        }
        let backup = self.backup_path();
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        if self.file_path.exists() {
            fs::rename(&self.file_path, &backup)?;
        }
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size && self.written > 0 {
            self.rotate()?;
            self.open()?;
        }
        if self.writer.is_none() {
            self.open()?;
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("日志文件不可用"))?;
        let n = writer.write(buf)?;
        writer.flush()?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// 初始化全局日志
///
/// 返回的 guard 需要保持到进程退出，否则文件日志可能丢失最后几行。
pub fn init_logging(config: &LogConfig) -> io::Result<Option<WorkerGuard>> {
    if !config.enabled {
        let _ = tracing_subscriber::registry().try_init();
        return Ok(None);
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .boxed();

    let (file_layer, guard) = match &config.file_path {
        Some(path) => {
            let writer = SizeRotatingWriter::new(path, config.max_size_mb)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(console_layer)
        .with(file_layer)
        .try_init();

    Ok(guard)
}
