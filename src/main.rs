use anyhow::Context;
use clap::Parser;
use cloudmigrate_lib::config::{DownloaderKind, MigrationConfig};
use cloudmigrate_lib::core::{MigrationEngine, MigrationReport, RunOutcome, ShutdownHandle};
use cloudmigrate_lib::error::MigrateError;
use cloudmigrate_lib::logging::init_logging;
use cloudmigrate_lib::remote::{AxelFetcher, DownloadUrlResolver, Fetcher, HttpFetcher, PutioClient};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// 致命错误的退出码
const EXIT_FATAL: u8 = 1;

/// 把 Put.io 上的文件迁移到本地存储，可随时中断并续传
#[derive(Debug, Parser)]
#[command(name = "cloudmigrate", version, about)]
struct Cli {
    /// 配置文件路径，不存在时会生成示例配置
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// 只扫描并输出计划，不下载也不写状态文件
    #[arg(long)]
    dry_run: bool,

    /// 把上次失败的文件重新加入队列
    #[arg(long)]
    retry_failed: bool,

    /// 覆盖配置文件中的 OAuth token
    #[arg(long, env = "PUTIO_OAUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if !cli.config.exists() {
        return match MigrationConfig::write_sample(&cli.config) {
            Ok(()) => {
                println!("已生成示例配置: {}", cli.config.display());
                println!("请编辑配置文件后重新运行。");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{:#}", e);
                ExitCode::from(EXIT_FATAL)
            }
        };
    }

    match run(cli).await {
        Ok(report) => {
            print_report(&report);
            ExitCode::from(report.outcome.exit_code() as u8)
        }
        Err(e) => {
            error!("迁移中止: {:#}", e);
            eprintln!("迁移中止: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<MigrationReport> {
    let mut config = MigrationConfig::load(&cli.config)?;
    if let Some(token) = cli.token {
        config.putio.oauth_token = token;
    }
    config.dry_run = cli.dry_run;
    config.retry_failed = cli.retry_failed;
    config.validate().context("配置校验失败")?;

    let _log_guard = init_logging(&config.logging).context("初始化日志失败")?;

    let client = Arc::new(
        PutioClient::new(&config.putio, config.transfer.timeout()).map_err(MigrateError::from)?,
    );
    let account = client.account_info().await.map_err(MigrateError::from)?;
    info!("已登录 Put.io 账户: {}", account.username);

    let fetcher = build_fetcher(&config, client.clone())?;

    let shutdown = ShutdownHandle::new();
    let signals = shutdown.install_signal_handlers();

    let engine = MigrationEngine::new(config.engine_options(), client, fetcher)
        .with_shutdown(shutdown);
    let report = engine.run().await;
    signals.abort();

    Ok(report?)
}

fn build_fetcher(
    config: &MigrationConfig,
    resolver: Arc<dyn DownloadUrlResolver>,
) -> anyhow::Result<Arc<dyn Fetcher>> {
    let transfer = &config.transfer;
    let http = || {
        HttpFetcher::new(resolver.clone(), transfer.timeout(), &config.putio.user_agent)
            .context("创建 HTTP 下载器失败")
    };

    let fetcher: Arc<dyn Fetcher> = match transfer.downloader {
        DownloaderKind::Http => Arc::new(http()?),
        DownloaderKind::Axel => {
            let axel = AxelFetcher::new(resolver.clone(), transfer.connections, transfer.timeout());
            if transfer.use_fallback_downloader {
                Arc::new(axel.with_fallback(http()?))
            } else {
                Arc::new(axel)
            }
        }
    };
    info!("下载器: {}", fetcher.name());
    Ok(fetcher)
}

fn print_report(report: &MigrationReport) {
    if let Some(plan) = &report.plan {
        println!("计划传输 {} 个文件，共 {}", plan.files.len(), human_bytes(plan.total_bytes));
        for file in &plan.files {
            println!("  {} ({})", file.path, human_bytes(file.size));
        }
        println!("被过滤排除: {}", report.filtered_out);
        return;
    }

    println!("运行 {} 结果: {}", report.run_id, report.outcome);
    println!("  已完成:     {}", report.completed);
    println!("  失败:       {}", report.failed);
    println!("  待处理:     {}", report.pending_remaining);
    println!("  远程已删除: {}", report.orphaned);
    println!("  过滤排除:   {}", report.filtered_out);
    println!("  累计传输:   {}", human_bytes(report.bytes_transferred));

    if !report.failures.is_empty() {
        println!("失败的文件:");
        for failure in &report.failures {
            println!(
                "  {} (尝试 {} 次): {}",
                failure.path,
                failure.retry_count,
                failure.last_error.as_deref().unwrap_or("未知错误")
            );
        }
    }
    if report.outcome == RunOutcome::Interrupted {
        println!("已中断，重新运行即可从当前进度继续。");
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
