//! 排期 Worker
//!
//! 轮询到期的 scheduled 活动并入队其派发与监控任务——把
//! `schedule_campaign(at)` 的时间点变成实际的发送触发。
//! 使用 `FOR UPDATE SKIP LOCKED` 保证多实例部署时同一活动不会被
//! 并发触发；对已有在途派发任务的活动跳过入队，派发任务自身的
//! 状态 CAS 是最后一道幂等屏障。

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info};

use campaign_core::dispatch::{DispatchPayload, enqueue_monitor, job_types};
use campaign_shared::config::CampaignConfig;
use campaign_shared::error::Result;
use campaign_shared::observability::metrics;
use campaign_shared::queue::{JobQueue, NewJob, queues};

/// 排期 Worker
pub struct CampaignScheduleWorker {
    pool: PgPool,
    queue: JobQueue,
    campaign_cfg: CampaignConfig,
    poll_interval: Duration,
}

/// 到期活动行
#[derive(sqlx::FromRow)]
struct DueCampaign {
    id: i64,
    tenant_id: String,
}

impl CampaignScheduleWorker {
    pub fn new(pool: PgPool, queue: JobQueue, campaign_cfg: CampaignConfig) -> Self {
        Self {
            pool,
            queue,
            campaign_cfg,
            poll_interval: Duration::from_secs(30),
        }
    }

    /// 创建带自定义轮询间隔的 Worker（主要用于测试）
    #[allow(dead_code)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// 主循环：持续检查到期活动直到收到 shutdown 信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval = ?self.poll_interval, "CampaignScheduleWorker 已启动");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.process_due_campaigns().await {
                error!(error = %e, "排期活动处理出错");
            }

            metrics::set_worker_last_run("campaign_schedule_worker");

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("CampaignScheduleWorker 已停止");
    }

    /// 找出到期的 scheduled 活动并入队派发
    ///
    /// 行锁在整个入队过程中持有，其他实例会跳过被锁的行；
    /// 在途派发任务的存在性检查挡住上一轮已触发但尚未执行的活动。
    async fn process_due_campaigns(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let due = sqlx::query_as::<_, DueCampaign>(
            r#"
            SELECT id, tenant_id
            FROM campaigns
            WHERE status = 'scheduled'
              AND scheduled_at <= NOW()
            ORDER BY scheduled_at ASC
            LIMIT 10
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        if due.is_empty() {
            tx.rollback().await?;
            return Ok(());
        }

        info!(count = due.len(), "发现到期的排期活动");

        for campaign in &due {
            // 在途派发任务存在时跳过，避免重复触发
            let already_queued: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM queue_jobs
                    WHERE job_type = $1
                      AND status IN ('pending', 'running')
                      AND (payload->>'campaign_id')::BIGINT = $2
                )
                "#,
            )
            .bind(job_types::DISPATCH)
            .bind(campaign.id)
            .fetch_one(&self.pool)
            .await?;

            if already_queued {
                continue;
            }

            let payload = DispatchPayload {
                campaign_id: campaign.id,
                tenant_id: campaign.tenant_id.clone(),
            };
            self.queue
                .enqueue(
                    NewJob::new(job_types::DISPATCH, serde_json::to_value(&payload)?)
                        .on_queue(queues::CAMPAIGNS),
                )
                .await?;

            enqueue_monitor(
                &self.queue,
                &campaign.tenant_id,
                campaign.id,
                self.campaign_cfg.monitor_interval_seconds,
            )
            .await?;

            info!(campaign_id = campaign.id, "到期活动已触发派发");
        }

        tx.commit().await?;
        Ok(())
    }
}
