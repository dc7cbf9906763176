use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use portal_config::AppConfig;
use portal_workers::{
    app::Application,
    runtime::WorkerRuntime,
    shutdown::{wait_for_signal, ShutdownManager},
    stubs,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("portal-workers")
        .version("1.0.0")
        .about("门户后台任务执行与资源池化服务")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径（缺省时查找 config/portal-workers.toml）"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("运维端点监听地址，覆盖配置中的 server.bind_address"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").cloned();
    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let log_format = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or("pretty");

    init_logging(log_level, log_format)?;
    info!("启动门户后台任务执行服务");

    let mut config = AppConfig::load(config_path.as_deref())
        .with_context(|| format!("加载配置失败: {}", config_path.as_deref().unwrap_or("<默认>")))?;
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.server.bind_address = bind.clone();
    }

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("安装 Prometheus 指标导出器失败: {}", e);
            None
        }
    };

    let bind_address = config.server.bind_address.clone();
    let shutdown_timeout = config.task_queue.shutdown_timeout() + config.batch.item_timeout();

    // 连接池预建连接和缓存连接都会阻塞
    let runtime = tokio::task::spawn_blocking(move || {
        WorkerRuntime::start(config, stubs::local_collaborators())
    })
    .await
    .context("启动运行时线程失败")?
    .context("启动运行时失败")?;
    let runtime = Arc::new(runtime);

    let shutdown_manager = ShutdownManager::new();
    let app = Application::new(Arc::clone(&runtime), metrics);
    let server_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.serve(&bind_address, shutdown_rx).await {
                error!("运维端点运行失败: {e:#}");
            }
        })
    };

    wait_for_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    if tokio::time::timeout(Duration::from_secs(10), server_handle)
        .await
        .is_err()
    {
        warn!("运维端点关闭超时");
    }

    let stopping = Arc::clone(&runtime);
    match tokio::time::timeout(
        shutdown_timeout,
        tokio::task::spawn_blocking(move || stopping.shutdown()),
    )
    .await
    {
        Ok(Ok(())) => info!("运行时已优雅关闭"),
        Ok(Err(e)) => error!("运行时关闭时发生错误: {e}"),
        Err(_) => warn!("运行时关闭超时，强制退出"),
    }

    info!("门户后台任务执行服务已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        _ => return Err(anyhow::anyhow!("不支持的日志格式: {log_format}")),
    }

    Ok(())
}
