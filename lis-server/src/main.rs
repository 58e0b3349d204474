//! LIS仪器接入服务主程序

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use crate::config::LisConfig;
use lis_core::{DeviceDirectory, PatientDirectory, ResultStore};
use lis_database::{DatabasePool, MemoryStore, PostgresStore};
use lis_integration::{
    AdapterRegistry, BroadcastEventSink, ConnectionManager, EventSink, ResultGateway,
    WebhookEventSink,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// LIS服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "lis-server")]
#[command(about = "LIS 检验仪器接入服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,
}

/// 数据访问组件
struct Stores {
    devices: Arc<dyn DeviceDirectory>,
    patients: Arc<dyn PatientDirectory>,
    results: Arc<dyn ResultStore>,
}

fn init_logging(config: &LisConfig, level: Option<&str>) {
    let filter = EnvFilter::try_new(level.unwrap_or(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_stores(config: &LisConfig) -> Result<Stores> {
    let database = &config.database;

    if let Some(url) = &database.url {
        info!("连接PostgreSQL数据库...");
        let pool = DatabasePool::connect(
            url,
            database.max_connections,
            Duration::from_secs(database.connect_timeout_secs),
        )
        .await
        .context("连接数据库失败")?;

        let store = Arc::new(PostgresStore::new(pool));
        store.create_tables().await.context("初始化数据库表失败")?;
        return Ok(Stores {
            devices: store.clone(),
            patients: store.clone(),
            results: store,
        });
    }

    let store = match &database.seed_file {
        Some(path) => MemoryStore::load_seed_file(path)
            .await
            .with_context(|| format!("加载种子文件 {} 失败", path.display()))?,
        None => {
            warn!("未配置数据库，使用空的内存存储");
            MemoryStore::new()
        }
    };
    let store = Arc::new(store);
    Ok(Stores {
        devices: store.clone(),
        patients: store.clone(),
        results: store,
    })
}

fn build_event_sink(config: &LisConfig) -> Arc<dyn EventSink> {
    if let Some(url) = &config.events.webhook_url {
        info!("新结果通知将发送到 {}", url);
        return Arc::new(WebhookEventSink::new(url.clone(), config.events.webhook_secret.clone()));
    }

    let sink = BroadcastEventSink::new(config.events.broadcast_capacity);
    let mut receiver = sink.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => info!(
                    "新检验结果: 设备 {} 患者 {} 结果 {}",
                    event.device_name, event.patient_name, event.result_id
                ),
                Err(RecvError::Lagged(skipped)) => warn!("通知订阅落后，丢弃 {} 条", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
    Arc::new(sink)
}

fn spawn_pending_sweep(manager: Arc<ConnectionManager>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;

        loop {
            interval.tick().await;
            let summary = manager.gateway().reconcile_pending().await;
            if summary.stored > 0 || summary.failed > 0 || summary.discarded > 0 {
                info!(
                    "待匹配结果重试: 保存 {} 条, 仍待匹配 {} 条, 失败 {} 条, 丢弃 {} 条",
                    summary.stored, summary.still_pending, summary.failed, summary.discarded
                );
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = LisConfig::load(args.config.as_deref())?;

    init_logging(&config, args.log_level.as_deref());
    info!("启动LIS服务器 {}...", config.server.name);

    let stores = open_stores(&config).await?;
    let events = build_event_sink(&config);

    let gateway = Arc::new(ResultGateway::new(
        stores.devices.clone(),
        stores.patients,
        stores.results,
        events,
        config.integration.timeouts(),
    ));
    let registry = AdapterRegistry::with_defaults();
    info!("已注册协议: {:?}", registry.registered_protocols());

    let manager = Arc::new(ConnectionManager::new(
        stores.devices,
        gateway,
        registry,
        config.integration.manager_settings(),
    ));

    let summary = manager.start_all().await.context("启动设备失败")?;
    info!("设备已启动: {:?}", summary.started);
    for (device_id, reason) in &summary.failed {
        error!("设备 {} 启动失败: {}", device_id, reason);
    }

    if let Some(interval_secs) = config.integration.pending_sweep_interval_secs {
        info!("待匹配结果每 {} 秒重试一次", interval_secs);
        spawn_pending_sweep(manager.clone(), interval_secs);
    }

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    info!("收到退出信号，正在关闭设备连接...");
    manager.stop_all().await;
    info!("LIS服务器已停止");

    Ok(())
}
