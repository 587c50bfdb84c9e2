use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use taskmgr::app::Application;
use taskmgr::shutdown::{wait_for_signal, ShutdownManager};
use taskmgr_core::{init_logging, AppConfig};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

/// 集群任务执行与调度节点
#[derive(Debug, Parser)]
#[command(name = "taskmgr", version, about = "集群任务执行与调度节点")]
struct Cli {
    /// 配置文件路径，未指定时按默认路径搜索
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 覆盖配置中的节点ID
    #[arg(long, value_name = "ID")]
    node_id: Option<String>,

    /// 日志级别，未指定时使用配置文件中的值
    #[arg(short, long, value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// 等待本节点任务停止的最长时间（秒）
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())
        .with_context(|| format!("加载配置失败: {:?}", cli.config))?;
    if let Some(node_id) = cli.node_id {
        config.node.node_id = Some(node_id);
    }

    let log_level = cli
        .log_level
        .unwrap_or_else(|| config.observability.log_level.clone());
    let log_format = cli
        .log_format
        .map(|format| format.as_str().to_string())
        .unwrap_or_else(|| config.observability.log_format.clone());
    init_logging(&log_level, &log_format)?;

    info!(config = ?cli.config, "启动任务调度节点");

    if let Some(address) = &config.observability.metrics_listen_address {
        init_metrics(address)?;
    }

    let shutdown_timeout = Duration::from_secs(cli.shutdown_timeout);
    let app = Arc::new(Application::new(config, shutdown_timeout).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;

        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("节点运行失败: {:#}", e);
            }
        })
    };

    tokio::select! {
        _ = wait_for_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        result = &mut app_handle => {
            if let Err(e) = result {
                error!("节点任务异常结束: {}", e);
            }
            warn!("节点提前退出");
            return Ok(());
        }
    }

    shutdown_manager.shutdown().await;

    // 比节点自身的等待多留一些余量
    let grace = shutdown_timeout + Duration::from_secs(10);
    match tokio::time::timeout(grace, app_handle).await {
        Ok(Ok(())) => info!("节点已优雅关闭"),
        Ok(Err(e)) => error!("节点关闭时发生错误: {}", e),
        Err(_) => warn!("节点关闭超时，强制退出"),
    }

    Ok(())
}

/// 安装Prometheus指标导出器
fn init_metrics(address: &str) -> Result<()> {
    let address: SocketAddr = address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {address}"))?;
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .context("安装Prometheus指标导出器失败")?;
    info!(%address, "Prometheus指标导出器已启动");
    Ok(())
}
