//! 进度监控
//!
//! 通过延迟任务轮询 pending 消息是否耗尽，并在耗尽时把活动收尾为
//! completed。不是常驻循环——每次检查结束后重新入队一个带延迟的
//! 自身，跨 Worker 重启依然有效。
//!
//! 轮询不是无界的：活动开始后超过配置的截止时长仍有 pending 消息
//! （例如网关长时间不可用导致发送任务耗尽重试后卡住）时，监控会把
//! 残留消息标记失败并把活动强制收尾为 failed，而不是永远轮询下去。

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use campaign_shared::config::CampaignConfig;
use campaign_shared::error::Result;
use campaign_shared::queue::JobQueue;

use crate::dispatch::{MonitorPayload, enqueue_monitor};
use crate::models::{Campaign, CampaignStatus};
use crate::tenant::TenantContext;

/// 进度监控器
#[derive(Clone)]
pub struct ProgressMonitor {
    pool: PgPool,
    queue: JobQueue,
    campaign_cfg: CampaignConfig,
}

impl ProgressMonitor {
    pub fn new(pool: PgPool, queue: JobQueue, campaign_cfg: CampaignConfig) -> Self {
        Self {
            pool,
            queue,
            campaign_cfg,
        }
    }

    /// 执行一次进度检查
    ///
    /// 活动不在发送中时直接退出（覆盖暂停/取消/已收尾的竞态），
    /// 因此对已 completed 的活动重放是无副作用的空操作。
    pub async fn check(&self, payload: &MonitorPayload) -> Result<()> {
        let ctx = TenantContext::resolve(&self.pool, &payload.tenant_id).await?;

        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            SELECT id, tenant_id, name, template_id, list_id, status,
                   total_recipients, sent_count, delivered_count, failed_count,
                   opened_count, clicked_count,
                   scheduled_at, started_at, completed_at, created_at, updated_at
            FROM campaigns
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(payload.campaign_id)
        .bind(&ctx.tenant.id)
        .fetch_optional(&self.pool)
        .await?;

        let campaign = match campaign {
            Some(c) => c,
            None => {
                warn!(campaign_id = payload.campaign_id, "监控目标活动不存在，停止监控");
                return Ok(());
            }
        };

        if campaign.current_status()? != CampaignStatus::Sending {
            info!(
                campaign_id = campaign.id,
                status = %campaign.status,
                "活动不在发送中，监控退出"
            );
            return Ok(());
        }

        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM campaign_messages WHERE campaign_id = $1 AND status = 'pending'",
        )
        .bind(campaign.id)
        .fetch_one(&self.pool)
        .await?;

        if pending == 0 {
            // CAS 收尾：暂停/取消与本次检查竞态时保持各自语义
            let updated = sqlx::query(
                r#"
                UPDATE campaigns
                SET status = 'completed', completed_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND status = 'sending'
                "#,
            )
            .bind(campaign.id)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated == 1 {
                info!(
                    campaign_id = campaign.id,
                    sent = campaign.sent_count,
                    failed = campaign.failed_count,
                    "活动全部消息处理完毕，收尾为 completed"
                );
            }
            return Ok(());
        }

        // 截止时长检查：卡死的 pending 消息不该让活动永远处于 sending
        let deadline_exceeded = campaign
            .started_at
            .map(|started| {
                Utc::now() - started > Duration::seconds(self.campaign_cfg.monitor_deadline_seconds)
            })
            .unwrap_or(false);

        if deadline_exceeded {
            self.finalize_stuck_campaign(&campaign, pending).await?;
            return Ok(());
        }

        info!(
            campaign_id = campaign.id,
            pending,
            interval = self.campaign_cfg.monitor_interval_seconds,
            "仍有 pending 消息，重新调度监控"
        );

        enqueue_monitor(
            &self.queue,
            &ctx.tenant.id,
            campaign.id,
            self.campaign_cfg.monitor_interval_seconds,
        )
        .await
    }

    /// 强制收尾超过截止时长的活动
    async fn finalize_stuck_campaign(&self, campaign: &Campaign, pending: i64) -> Result<()> {
        warn!(
            campaign_id = campaign.id,
            pending,
            deadline_seconds = self.campaign_cfg.monitor_deadline_seconds,
            "活动超过监控截止时长仍有 pending 消息，强制收尾为 failed"
        );

        let failed = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'failed',
                error_message = 'Delivery deadline exceeded; message stuck in pending',
                updated_at = NOW()
            WHERE campaign_id = $1 AND status = 'pending'
            "#,
        )
        .bind(campaign.id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'failed', failed_count = failed_count + $2,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(campaign.id)
        .bind(failed as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
