//! 活动 Worker 进程入口
//!
//! 装配依赖（数据库、缓存、额度账本、发送器注册表、模板渲染器），
//! 启动 N 个队列 Worker 与一个排期 Worker，收到 ctrl-c 后通过
//! watch 通道通知所有 Worker 优雅退出。

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use campaign_core::credits::CreditLedger;
use campaign_core::dispatch::DispatchPipeline;
use campaign_core::monitor::ProgressMonitor;
use campaign_core::sender::SenderRegistry;
use campaign_core::template::TemplateRenderer;
use campaign_shared::cache::Cache;
use campaign_shared::config::AppConfig;
use campaign_shared::database::Database;
use campaign_shared::observability;
use campaign_shared::queue::JobQueue;
use campaign_worker::runner::QueueWorker;
use campaign_worker::schedule_worker::CampaignScheduleWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("campaign-worker")?;
    let _metrics_handle = observability::init(&config.service_name, &config.observability).await?;

    info!(
        environment = %config.environment,
        concurrency = config.queue.concurrency,
        "Starting campaign-worker..."
    );

    let db = Database::connect(&config.database).await?;
    let cache = Cache::new(&config.redis)?;
    let pool = db.pool().clone();

    let queue = JobQueue::new(pool.clone());
    let ledger = CreditLedger::new(
        pool.clone(),
        cache.clone(),
        Duration::from_secs(config.campaign.credit_cache_ttl_seconds),
    );
    let senders = SenderRegistry::from_config(&config.sender)?;
    let renderer = TemplateRenderer::new(config.campaign.unsubscribe_base_url.clone());

    let pipeline = DispatchPipeline::new(
        pool.clone(),
        queue.clone(),
        ledger,
        senders,
        renderer,
        config.queue.clone(),
        config.campaign.clone(),
    );
    let monitor = ProgressMonitor::new(pool.clone(), queue.clone(), config.campaign.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_interval = Duration::from_millis(config.queue.poll_interval_ms);

    let mut handles = Vec::new();

    for _ in 0..config.queue.concurrency {
        let worker = QueueWorker::new(
            pool.clone(),
            queue.clone(),
            pipeline.clone(),
            monitor.clone(),
            poll_interval,
        );
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    let schedule_worker =
        CampaignScheduleWorker::new(pool.clone(), queue.clone(), config.campaign.clone());
    handles.push(tokio::spawn(schedule_worker.run(shutdown_rx.clone())));

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，通知 Worker 停止");
    let _ = shutdown_tx.send(true);

    futures::future::join_all(handles).await;

    db.close().await;
    info!("campaign-worker 已退出");
    Ok(())
}
