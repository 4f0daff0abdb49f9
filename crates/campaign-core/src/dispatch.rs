//! 派发管道
//!
//! 把一个活动扇出为每收件人一条消息记录与一个发送任务，并执行单条
//! 消息的发送流程。所有入口都以状态重查开头：任务队列是 at-least-once
//! 投递，Worker 可能在任意两步之间崩溃重放，暂停/取消也不会撤回已
//! 入队的任务，因此每个任务都要自行确认活动仍在发送、消息仍是
//! pending，否则静默跳过。
//!
//! 发送速率用入队延迟平滑：第 N 条消息延迟 ceil(N / rate) 秒入队，
//! 默认 10 条/秒。这是刻意简单的固定速率——发送本身已经被 Worker
//! 并发度分摊，延迟只为摊平网关压力。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, info, warn};

use campaign_shared::config::{CampaignConfig, QueueConfig};
use campaign_shared::error::{CampaignError, Result};
use campaign_shared::observability::metrics;
use campaign_shared::queue::{JobQueue, NewJob, queues};

use crate::credits::CreditLedger;
use crate::models::{
    Campaign, CampaignMessage, CampaignStatus, MessageStatus, MessageTemplate, Subscriber,
};
use crate::sender::SenderRegistry;
use crate::template::TemplateRenderer;
use crate::tenant::TenantContext;

// ---------------------------------------------------------------------------
// 任务类型与载荷
// ---------------------------------------------------------------------------

/// campaigns 队列上的任务类型
pub mod job_types {
    /// 活动扇出
    pub const DISPATCH: &str = "campaign.dispatch";
    /// 单条消息发送
    pub const SEND_MESSAGE: &str = "campaign.send_message";
    /// 进度监控
    pub const MONITOR: &str = "campaign.monitor";
}

/// 活动扇出任务载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub campaign_id: i64,
    pub tenant_id: String,
}

/// 单条消息发送任务载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub message_id: i64,
    pub campaign_id: i64,
    pub tenant_id: String,
}

/// 进度监控任务载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorPayload {
    pub campaign_id: i64,
    pub tenant_id: String,
}

/// 计算第 position 条消息的入队延迟（秒）
///
/// delay = ceil(position / rate)，position 从 0 开始。
pub fn stagger_delay_seconds(position: usize, rate_per_second: u32) -> i64 {
    if rate_per_second == 0 {
        return 0;
    }
    (position as f64 / rate_per_second as f64).ceil() as i64
}

/// 入队操作的并发分片大小
const ENQUEUE_CHUNK_SIZE: usize = 100;

/// 为一批消息入队发送任务（带平滑延迟与队列级重试配置）
///
/// 扇出与恢复（resume）共用该入口。大列表按分片并发入队，
/// 分片之间顺序执行以控制数据库连接占用。
pub async fn enqueue_send_jobs(
    queue: &JobQueue,
    queue_cfg: &QueueConfig,
    campaign_cfg: &CampaignConfig,
    tenant_id: &str,
    campaign_id: i64,
    message_ids: &[i64],
) -> Result<()> {
    for (chunk_idx, chunk) in message_ids.chunks(ENQUEUE_CHUNK_SIZE).enumerate() {
        let enqueues: Vec<_> = chunk
            .iter()
            .enumerate()
            .map(|(idx_in_chunk, message_id)| {
                let position = chunk_idx * ENQUEUE_CHUNK_SIZE + idx_in_chunk;
                let payload = SendMessagePayload {
                    message_id: *message_id,
                    campaign_id,
                    tenant_id: tenant_id.to_string(),
                };
                async move {
                    queue
                        .enqueue(
                            NewJob::new(job_types::SEND_MESSAGE, serde_json::to_value(&payload)?)
                                .on_queue(queues::CAMPAIGNS)
                                .with_delay_seconds(stagger_delay_seconds(
                                    position,
                                    campaign_cfg.dispatch_rate_per_second,
                                ))
                                .with_retry(
                                    queue_cfg.send_max_attempts,
                                    queue_cfg.send_backoff_seconds,
                                ),
                        )
                        .await
                }
            })
            .collect();

        for result in futures::future::join_all(enqueues).await {
            result?;
        }
    }
    Ok(())
}

/// 入队一次进度监控检查
///
/// 监控检查自带少量重试：瞬时数据库故障不应让监控链断掉，
/// 否则活动会永远停在 sending。
pub async fn enqueue_monitor(
    queue: &JobQueue,
    tenant_id: &str,
    campaign_id: i64,
    delay_seconds: i64,
) -> Result<()> {
    let payload = MonitorPayload {
        campaign_id,
        tenant_id: tenant_id.to_string(),
    };
    queue
        .enqueue(
            NewJob::new(job_types::MONITOR, serde_json::to_value(&payload)?)
                .on_queue(queues::CAMPAIGNS)
                .with_delay_seconds(delay_seconds)
                .with_retry(3, 30),
        )
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// DispatchPipeline
// ---------------------------------------------------------------------------

/// 派发管道
#[derive(Clone)]
pub struct DispatchPipeline {
    pool: PgPool,
    queue: JobQueue,
    ledger: CreditLedger,
    senders: SenderRegistry,
    renderer: TemplateRenderer,
    queue_cfg: QueueConfig,
    campaign_cfg: CampaignConfig,
}

impl DispatchPipeline {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        ledger: CreditLedger,
        senders: SenderRegistry,
        renderer: TemplateRenderer,
        queue_cfg: QueueConfig,
        campaign_cfg: CampaignConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            ledger,
            senders,
            renderer,
            queue_cfg,
            campaign_cfg,
        }
    }

    /// 活动扇出
    ///
    /// 对过期任务（活动已不可发送）是幂等空操作；空收件人列表直接把
    /// 活动标记为 failed；扇出过程中的异常把活动标记为 failed 后重新
    /// 抛出，让队列的失败记账生效。
    pub async fn process_campaign(&self, payload: &DispatchPayload) -> Result<()> {
        let ctx = TenantContext::resolve(&self.pool, &payload.tenant_id).await?;
        let campaign = self.load_campaign(payload.campaign_id, &ctx.tenant.id).await?;

        if !campaign.current_status()?.can_be_sent() {
            info!(
                campaign_id = campaign.id,
                status = %campaign.status,
                "活动已不可发送，跳过扇出"
            );
            return Ok(());
        }

        // CAS 到 sending：同一活动被重复派发时只有一个任务能赢，
        // 这同时是扇出的幂等屏障
        let claimed = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'sending', started_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('draft', 'scheduled')
            "#,
        )
        .bind(campaign.id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 0 {
            info!(campaign_id = campaign.id, "活动已被其他派发任务认领，跳过");
            return Ok(());
        }

        match self.fan_out(&campaign).await {
            Ok(0) => {
                metrics::record_campaign_dispatch("empty");
                Ok(())
            }
            Ok(count) => {
                metrics::record_campaign_dispatch("success");
                info!(
                    campaign_id = campaign.id,
                    recipients = count,
                    "活动扇出完成"
                );
                Ok(())
            }
            Err(e) => {
                error!(campaign_id = campaign.id, error = %e, "活动扇出失败");
                self.finalize_campaign_failed(campaign.id).await;
                metrics::record_campaign_dispatch("error");
                // 重新抛出，让队列的失败记账生效；该活动不会自动重派，
                // 需要人工重新触发发送
                Err(e)
            }
        }
    }

    /// 加载合格收件人、批量建消息记录并入队发送任务
    ///
    /// 返回收件人数量；为 0 时活动已被标记 failed。
    async fn fan_out(&self, campaign: &Campaign) -> Result<usize> {
        let eligible: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM subscribers
            WHERE tenant_id = $1 AND list_id = $2
              AND status = 'active'
              AND opt_in_date IS NOT NULL
              AND opt_out_date IS NULL
            ORDER BY id
            "#,
        )
        .bind(&campaign.tenant_id)
        .bind(campaign.list_id)
        .fetch_all(&self.pool)
        .await?;

        if eligible.is_empty() {
            warn!(campaign_id = campaign.id, "订阅列表没有合格收件人，活动标记为失败");
            self.finalize_campaign_failed(campaign.id).await;
            return Ok(0);
        }

        sqlx::query("UPDATE campaigns SET total_recipients = $2, updated_at = NOW() WHERE id = $1")
            .bind(campaign.id)
            .bind(eligible.len() as i32)
            .execute(&self.pool)
            .await?;

        // 单条批量插入而非逐条 INSERT——大列表下的扇出热点。
        // 唯一约束 + ON CONFLICT 保证 (campaign, subscriber) 恰好一行，
        // 即使扇出被重放也不会产生重复记录。
        let message_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO campaign_messages (campaign_id, subscriber_id, status, created_at, updated_at)
            SELECT $1, s.id, 'pending', NOW(), NOW()
            FROM subscribers s
            WHERE s.tenant_id = $2 AND s.list_id = $3
              AND s.status = 'active'
              AND s.opt_in_date IS NOT NULL
              AND s.opt_out_date IS NULL
            ON CONFLICT (campaign_id, subscriber_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(campaign.id)
        .bind(&campaign.tenant_id)
        .bind(campaign.list_id)
        .fetch_all(&self.pool)
        .await?;

        enqueue_send_jobs(
            &self.queue,
            &self.queue_cfg,
            &self.campaign_cfg,
            &campaign.tenant_id,
            campaign.id,
            &message_ids,
        )
        .await?;

        Ok(eligible.len())
    }

    /// 单条消息发送
    ///
    /// 业务失败（收件人不合格、校验不通过、额度不足、网关拒绝）直接
    /// 把消息记为 failed 终态并正常返回；只有基础设施故障才返回 Err，
    /// 交给队列按退避重试。
    pub async fn send_campaign_message(&self, payload: &SendMessagePayload) -> Result<()> {
        let ctx = TenantContext::resolve(&self.pool, &payload.tenant_id).await?;

        let message = self.load_message(payload.message_id).await?;
        let campaign = self.load_campaign(message.campaign_id, &ctx.tenant.id).await?;

        // 活动不在发送中（暂停/取消/已收尾）：跳过且不改消息状态，
        // 恢复时这些消息会被重新入队
        if campaign.current_status()? != CampaignStatus::Sending {
            info!(
                message_id = message.id,
                campaign_id = campaign.id,
                campaign_status = %campaign.status,
                "活动不在发送中，跳过该消息"
            );
            return Ok(());
        }

        // at-least-once 重放保护：消息已离开 pending 就不再处理
        if message.current_status()? != MessageStatus::Pending {
            info!(
                message_id = message.id,
                status = %message.status,
                "消息已处理过，跳过重放"
            );
            return Ok(());
        }

        let template = self.load_template(campaign.template_id, &ctx.tenant.id).await?;
        let channel = template.current_channel()?;
        let subscriber = self.load_subscriber(message.subscriber_id).await?;

        // 收件人可能在扇出后退订或被禁用
        if !subscriber.is_eligible() {
            self.mark_message_failed(&message, channel.as_str(), "Subscriber is not active", None)
                .await?;
            return Ok(());
        }

        let sender = match self.senders.for_channel(channel) {
            Some(s) => s,
            None => {
                self.mark_message_failed(
                    &message,
                    channel.as_str(),
                    &format!("No sender registered for channel {channel}"),
                    None,
                )
                .await?;
                return Ok(());
            }
        };

        let validation = sender.validate(&subscriber, &template);
        if !validation.valid {
            let reason = validation
                .error
                .unwrap_or_else(|| "Recipient validation failed".to_string());
            self.mark_message_failed(&message, channel.as_str(), &reason, None).await?;
            return Ok(());
        }

        // 额度预检：不足时不重试——退避窗口内不会自行恢复
        let cost = sender.cost_per_message();
        if !self
            .ledger
            .can_use_channel(&ctx.tenant.id, channel, cost)
            .await?
        {
            self.mark_message_failed(&message, channel.as_str(), "Insufficient credits", None)
                .await?;
            return Ok(());
        }

        let rendered = self
            .renderer
            .render(&template, &subscriber, &ctx.tenant, &HashMap::new());

        let started = std::time::Instant::now();
        // 基础设施故障从这里向上传播，进入队列重试
        let outcome = sender.send(&subscriber, &template, &rendered).await?;
        metrics::record_provider_duration(channel.as_str(), started.elapsed().as_secs_f64());

        if !outcome.success {
            let reason = outcome
                .error
                .unwrap_or_else(|| "Provider rejected the message".to_string());
            self.mark_message_failed(
                &message,
                channel.as_str(),
                &reason,
                outcome.provider_response,
            )
            .await?;
            return Ok(());
        }

        // 记录发送结果（仍以 pending 为前置条件，防并发重放）
        let updated = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'sent', sent_at = NOW(),
                provider_message_id = $2, provider_response = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(message.id)
        .bind(&outcome.provider_message_id)
        .bind(&outcome.provider_response)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            warn!(
                message_id = message.id,
                "消息状态已被并发修改，跳过计数与扣费"
            );
            return Ok(());
        }

        sqlx::query(
            "UPDATE campaigns SET sent_count = sent_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(campaign.id)
        .execute(&self.pool)
        .await?;

        metrics::record_message_sent(channel.as_str());

        // 发送后扣费。消息已经发出，扣费失败不能撤回发送：
        // 额度在发送与扣费之间被并发耗尽时记录缺口，其余错误只告警
        // ——重放会被上面的 pending 屏障挡住，不会重复发送。
        match self.ledger.deduct_credits(&ctx.tenant.id, channel, cost).await {
            Ok(()) => {}
            Err(CampaignError::InsufficientCredits { .. }) => {
                metrics::record_credit_shortfall(channel.as_str());
                error!(
                    message_id = message.id,
                    tenant_id = %ctx.tenant.id,
                    channel = %channel,
                    "发送成功但额度已被并发耗尽，产生扣费缺口"
                );
            }
            Err(e) => {
                error!(
                    message_id = message.id,
                    tenant_id = %ctx.tenant.id,
                    error = %e,
                    "发送后扣费失败，用量可能少计"
                );
            }
        }

        info!(
            message_id = message.id,
            campaign_id = campaign.id,
            channel = %channel,
            provider_message_id = ?outcome.provider_message_id,
            "消息发送成功"
        );

        Ok(())
    }

    /// 把消息记为 failed 终态并累加活动失败计数
    async fn mark_message_failed(
        &self,
        message: &CampaignMessage,
        channel: &str,
        reason: &str,
        provider_response: Option<serde_json::Value>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'failed', error_message = $2, provider_response = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(message.id)
        .bind(reason)
        .bind(&provider_response)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            sqlx::query(
                "UPDATE campaigns SET failed_count = failed_count + 1, updated_at = NOW() WHERE id = $1",
            )
            .bind(message.campaign_id)
            .execute(&self.pool)
            .await?;

            metrics::record_message_failed(channel);
            warn!(
                message_id = message.id,
                campaign_id = message.campaign_id,
                reason = %reason,
                "消息进入失败终态"
            );
        }

        Ok(())
    }

    /// 把活动收尾为 failed（尽力而为，用于扇出异常路径）
    async fn finalize_campaign_failed(&self, campaign_id: i64) {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'failed', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!(campaign_id, error = %e, "标记活动失败时出错");
        }
    }

    // ---- 行加载辅助 ----

    async fn load_campaign(&self, campaign_id: i64, tenant_id: &str) -> Result<Campaign> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT id, tenant_id, name, template_id, list_id, status,
                   total_recipients, sent_count, delivered_count, failed_count,
                   opened_count, clicked_count,
                   scheduled_at, started_at, completed_at, created_at, updated_at
            FROM campaigns
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CampaignError::NotFound {
            entity: "Campaign".to_string(),
            id: campaign_id.to_string(),
        })
    }

    async fn load_message(&self, message_id: i64) -> Result<CampaignMessage> {
        sqlx::query_as::<_, CampaignMessage>(
            r#"
            SELECT id, campaign_id, subscriber_id, status, error_message,
                   provider_message_id, provider_response,
                   sent_at, delivered_at, opened_at, clicked_at, created_at, updated_at
            FROM campaign_messages
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CampaignError::NotFound {
            entity: "CampaignMessage".to_string(),
            id: message_id.to_string(),
        })
    }

    async fn load_template(&self, template_id: i64, tenant_id: &str) -> Result<MessageTemplate> {
        sqlx::query_as::<_, MessageTemplate>(
            r#"
            SELECT id, tenant_id, name, channel, subject, content, is_active,
                   created_at, updated_at
            FROM message_templates
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(template_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CampaignError::NotFound {
            entity: "MessageTemplate".to_string(),
            id: template_id.to_string(),
        })
    }

    async fn load_subscriber(&self, subscriber_id: i64) -> Result<Subscriber> {
        sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT id, tenant_id, list_id, first_name, last_name, email, phone,
                   status, opt_in_date, opt_out_date, created_at
            FROM subscribers
            WHERE id = $1
            "#,
        )
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CampaignError::NotFound {
            entity: "Subscriber".to_string(),
            id: subscriber_id.to_string(),
        })
    }
}

/// 发送任务耗尽重试后的失败钩子
///
/// 与业务失败不同，这里带上尝试次数，便于在数据里区分
/// 「网关拒绝」与「重试耗尽」两类失败。
pub async fn force_fail_message(
    pool: &PgPool,
    message_id: i64,
    campaign_id: i64,
    attempts: i32,
    last_error: &str,
) -> Result<()> {
    let note = format!("Send failed after {attempts} attempts: {last_error}");

    let updated = sqlx::query(
        r#"
        UPDATE campaign_messages
        SET status = 'failed', error_message = $2, updated_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(message_id)
    .bind(&note)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 1 {
        sqlx::query(
            "UPDATE campaigns SET failed_count = failed_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(campaign_id)
        .execute(pool)
        .await?;

        warn!(message_id, campaign_id, attempts, "消息重试耗尽，强制标记失败");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stagger_delay_at_default_rate() {
        // 10 条/秒 等价于每条 100ms 的间隔，向上取整到秒
        assert_eq!(stagger_delay_seconds(0, 10), 0);
        assert_eq!(stagger_delay_seconds(1, 10), 1);
        assert_eq!(stagger_delay_seconds(10, 10), 1);
        assert_eq!(stagger_delay_seconds(11, 10), 2);
        assert_eq!(stagger_delay_seconds(100, 10), 10);
        assert_eq!(stagger_delay_seconds(999, 10), 100);
    }

    #[test]
    fn test_stagger_delay_zero_rate_means_no_delay() {
        assert_eq!(stagger_delay_seconds(50, 0), 0);
    }

    #[test]
    fn test_payload_serde_roundtrip() {
        let payload = SendMessagePayload {
            message_id: 7,
            campaign_id: 3,
            tenant_id: "t-1".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        let back: SendMessagePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.message_id, 7);
        assert_eq!(back.campaign_id, 3);
        assert_eq!(back.tenant_id, "t-1");
    }
}
