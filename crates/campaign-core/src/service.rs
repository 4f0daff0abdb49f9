//! 活动服务
//!
//! 活动生命周期的唯一入口：创建、校验、排期、发送、暂停、恢复、
//! 取消、统计与投递事件回流。管理端或 API 层只应调用这里，任何
//! 其他组件都不应直接改写活动/消息行。
//!
//! 状态迁移一律用带状态前置条件的 UPDATE（CAS）执行，以受影响行数
//! 判定竞态：两个操作者同时暂停/取消时只有一个生效。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, warn};
use validator::Validate;

use campaign_shared::config::{CampaignConfig, QueueConfig};
use campaign_shared::error::{CampaignError, Result};
use campaign_shared::queue::{JobQueue, NewJob, queues};

use crate::credits::CreditLedger;
use crate::dispatch::{
    DispatchPayload, enqueue_monitor, enqueue_send_jobs, job_types,
};
use crate::models::{
    Campaign, CampaignMessage, CampaignStatus, MessageStatus, MessageTemplate, SubscriberList,
};
use crate::template::TemplateRenderer;
use crate::tenant::TenantContext;

// ---------------------------------------------------------------------------
// 请求与结果类型
// ---------------------------------------------------------------------------

/// 创建活动请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateCampaign {
    #[validate(length(min = 1, max = 200, message = "Campaign name must be 1-200 characters"))]
    pub name: String,
    pub template_id: i64,
    pub list_id: i64,
}

/// 活动校验结果
///
/// errors 为人类可读的字符串列表，由调用方决定是否阻断操作。
#[derive(Debug, Clone)]
pub struct CampaignValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// 活动统计
#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub campaign_id: i64,
    pub status: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub failed_count: i32,
    pub opened_count: i32,
    pub clicked_count: i32,
    /// 以下比率均以 sent_count 为分母，未发送时为 0
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
}

/// 收件人列表查询参数
#[derive(Debug, Clone, Default)]
pub struct RecipientQuery {
    pub status: Option<MessageStatus>,
    pub limit: i64,
    pub offset: i64,
}

// ---------------------------------------------------------------------------
// CampaignService
// ---------------------------------------------------------------------------

/// 活动服务
#[derive(Clone)]
pub struct CampaignService {
    pool: PgPool,
    queue: JobQueue,
    ledger: CreditLedger,
    renderer: TemplateRenderer,
    queue_cfg: QueueConfig,
    campaign_cfg: CampaignConfig,
}

impl CampaignService {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        ledger: CreditLedger,
        renderer: TemplateRenderer,
        queue_cfg: QueueConfig,
        campaign_cfg: CampaignConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            ledger,
            renderer,
            queue_cfg,
            campaign_cfg,
        }
    }

    /// 创建活动，初始状态恒为 draft
    pub async fn create_campaign(&self, tenant_id: &str, data: CreateCampaign) -> Result<Campaign> {
        data.validate()
            .map_err(|e| CampaignError::Validation(e.to_string()))?;

        let ctx = TenantContext::resolve(&self.pool, tenant_id).await?;

        // 引用的模板与列表必须属于该租户
        self.load_template(data.template_id, &ctx.tenant.id).await?;
        self.load_list(data.list_id, &ctx.tenant.id).await?;

        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns
                (tenant_id, name, template_id, list_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'draft', NOW(), NOW())
            RETURNING id, tenant_id, name, template_id, list_id, status,
                      total_recipients, sent_count, delivered_count, failed_count,
                      opened_count, clicked_count,
                      scheduled_at, started_at, completed_at, created_at, updated_at
            "#,
        )
        .bind(&ctx.tenant.id)
        .bind(&data.name)
        .bind(data.template_id)
        .bind(data.list_id)
        .fetch_one(&self.pool)
        .await?;

        info!(campaign_id = campaign.id, tenant_id = %tenant_id, "活动已创建");
        Ok(campaign)
    }

    /// 校验活动是否可发送
    ///
    /// 检查项：名称非空、模板存在且启用且自身校验通过、列表存在且有
    /// 合格收件人、租户在模板渠道上的可用额度足以覆盖预估成本
    /// （当前策略为每收件人 1 额度）。
    pub async fn validate_campaign(
        &self,
        campaign_id: i64,
        tenant_id: &str,
    ) -> Result<CampaignValidation> {
        let ctx = TenantContext::resolve(&self.pool, tenant_id).await?;
        let campaign = self.load_campaign(campaign_id, &ctx.tenant.id).await?;

        let mut errors = Vec::new();

        if campaign.name.trim().is_empty() {
            errors.push("Campaign name is required".to_string());
        }

        let template = sqlx::query_as::<_, MessageTemplate>(
            r#"
            SELECT id, tenant_id, name, channel, subject, content, is_active,
                   created_at, updated_at
            FROM message_templates
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(campaign.template_id)
        .bind(&ctx.tenant.id)
        .fetch_optional(&self.pool)
        .await?;

        let template = match template {
            Some(t) if !t.is_active => {
                errors.push("Template is not active".to_string());
                Some(t)
            }
            Some(t) => {
                let result = self.renderer.validate_template(&t);
                errors.extend(result.errors);
                Some(t)
            }
            None => {
                errors.push("Template not found".to_string());
                None
            }
        };

        let list = sqlx::query_as::<_, SubscriberList>(
            "SELECT id, tenant_id, name, created_at FROM subscriber_lists WHERE id = $1 AND tenant_id = $2",
        )
        .bind(campaign.list_id)
        .bind(&ctx.tenant.id)
        .fetch_optional(&self.pool)
        .await?;

        let mut eligible_count: i64 = 0;
        match list {
            Some(list) => {
                eligible_count = self.count_eligible(&ctx.tenant.id, list.id).await?;
                if eligible_count == 0 {
                    errors.push("Subscriber list has no eligible recipients".to_string());
                }
            }
            None => errors.push("Subscriber list not found".to_string()),
        }

        // 预估成本 = 合格收件人数 × 1 额度
        if eligible_count > 0 {
            if let Some(template) = &template {
                if let Ok(channel) = template.current_channel() {
                    let available = self
                        .ledger
                        .available_credits(&ctx.tenant.id, channel)
                        .await?;
                    if available < eligible_count {
                        errors.push(format!(
                            "Insufficient {channel} credits: required {eligible_count}, available {available}"
                        ));
                    }
                }
            }
        }

        Ok(CampaignValidation {
            valid: errors.is_empty(),
            errors,
        })
    }

    /// 排期活动
    ///
    /// 校验必须通过；状态 draft → scheduled，scheduled_at 为指定时间
    /// 或当前时间。到期后由排期 Worker 触发实际派发。
    pub async fn schedule_campaign(
        &self,
        campaign_id: i64,
        tenant_id: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<Campaign> {
        self.require_valid(campaign_id, tenant_id).await?;

        let scheduled_at = at.unwrap_or_else(Utc::now);

        let updated = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'scheduled', scheduled_at = $3, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status = 'draft'
            "#,
        )
        .bind(campaign_id)
        .bind(tenant_id)
        .bind(scheduled_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            let campaign = self.load_campaign(campaign_id, tenant_id).await?;
            return Err(CampaignError::StatusConflict {
                entity: "Campaign".to_string(),
                expected: CampaignStatus::Draft.as_str().to_string(),
                actual: campaign.status,
            });
        }

        info!(campaign_id, scheduled_at = %scheduled_at, "活动已排期");
        self.load_campaign(campaign_id, tenant_id).await
    }

    /// 触发活动发送
    ///
    /// 校验通过且状态可发送时，入队派发任务与首次进度检查（延迟一个
    /// 监控间隔）。状态不在这里翻转——派发任务确认有收件人后才置为
    /// sending。
    pub async fn send_campaign(&self, campaign_id: i64, tenant_id: &str) -> Result<()> {
        let campaign = self.load_campaign(campaign_id, tenant_id).await?;
        if !campaign.current_status()?.can_be_sent() {
            return Err(CampaignError::StatusConflict {
                entity: "Campaign".to_string(),
                expected: "draft|scheduled".to_string(),
                actual: campaign.status,
            });
        }

        self.require_valid(campaign_id, tenant_id).await?;

        let payload = DispatchPayload {
            campaign_id,
            tenant_id: tenant_id.to_string(),
        };
        self.queue
            .enqueue(
                NewJob::new(job_types::DISPATCH, serde_json::to_value(&payload)?)
                    .on_queue(queues::CAMPAIGNS),
            )
            .await?;

        enqueue_monitor(
            &self.queue,
            tenant_id,
            campaign_id,
            self.campaign_cfg.monitor_interval_seconds,
        )
        .await?;

        info!(campaign_id, tenant_id = %tenant_id, "活动发送已触发");
        Ok(())
    }

    /// 暂停发送中的活动
    ///
    /// 软暂停：只翻转数据库状态，已入队的发送任务在执行时自查活动
    /// 状态并跳过。
    pub async fn pause_campaign(&self, campaign_id: i64, tenant_id: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'paused', updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status = 'sending'
            "#,
        )
        .bind(campaign_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            let campaign = self.load_campaign(campaign_id, tenant_id).await?;
            return Err(CampaignError::StatusConflict {
                entity: "Campaign".to_string(),
                expected: CampaignStatus::Sending.as_str().to_string(),
                actual: campaign.status,
            });
        }

        info!(campaign_id, "活动已暂停");
        Ok(())
    }

    /// 恢复已暂停的活动
    ///
    /// 暂停期间跳过的发送任务已经消费掉了，恢复时把所有仍为 pending
    /// 的消息重新入队为新的发送任务，并重启进度监控。
    pub async fn resume_campaign(&self, campaign_id: i64, tenant_id: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'sending', updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status = 'paused'
            "#,
        )
        .bind(campaign_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            let campaign = self.load_campaign(campaign_id, tenant_id).await?;
            return Err(CampaignError::StatusConflict {
                entity: "Campaign".to_string(),
                expected: CampaignStatus::Paused.as_str().to_string(),
                actual: campaign.status,
            });
        }

        let pending_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM campaign_messages
            WHERE campaign_id = $1 AND status = 'pending'
            ORDER BY id
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        enqueue_send_jobs(
            &self.queue,
            &self.queue_cfg,
            &self.campaign_cfg,
            tenant_id,
            campaign_id,
            &pending_ids,
        )
        .await?;

        enqueue_monitor(
            &self.queue,
            tenant_id,
            campaign_id,
            self.campaign_cfg.monitor_interval_seconds,
        )
        .await?;

        info!(campaign_id, resumed_pending = pending_ids.len(), "活动已恢复发送");
        Ok(())
    }

    /// 取消活动（不可逆）
    ///
    /// 所有 pending 消息记为 failed("Campaign cancelled")，活动置为
    /// failed 并盖上 completed_at。已入队的发送任务执行时会看到非
    /// sending 状态而自行跳过。
    pub async fn cancel_campaign(&self, campaign_id: i64, tenant_id: &str) -> Result<()> {
        let campaign = self.load_campaign(campaign_id, tenant_id).await?;
        if !campaign.current_status()?.can_cancel() {
            return Err(CampaignError::StatusConflict {
                entity: "Campaign".to_string(),
                expected: "any status except completed".to_string(),
                actual: campaign.status,
            });
        }

        let cancelled = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'failed', error_message = 'Campaign cancelled', updated_at = NOW()
            WHERE campaign_id = $1 AND status = 'pending'
            "#,
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'failed', failed_count = failed_count + $3,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status != 'completed'
            "#,
        )
        .bind(campaign_id)
        .bind(tenant_id)
        .bind(cancelled as i32)
        .execute(&self.pool)
        .await?;

        warn!(campaign_id, cancelled_pending = cancelled, "活动已取消");
        Ok(())
    }

    /// 活动统计
    pub async fn get_campaign_stats(
        &self,
        campaign_id: i64,
        tenant_id: &str,
    ) -> Result<CampaignStats> {
        let campaign = self.load_campaign(campaign_id, tenant_id).await?;
        Ok(stats_from_campaign(&campaign))
    }

    /// 收件人投递记录列表（分页，可按状态过滤）
    pub async fn get_campaign_recipients(
        &self,
        campaign_id: i64,
        tenant_id: &str,
        query: RecipientQuery,
    ) -> Result<Vec<CampaignMessage>> {
        // 先确认活动属于该租户
        self.load_campaign(campaign_id, tenant_id).await?;

        let limit = if query.limit <= 0 { 50 } else { query.limit.min(500) };
        let offset = query.offset.max(0);

        let messages = match query.status {
            Some(status) => {
                sqlx::query_as::<_, CampaignMessage>(
                    r#"
                    SELECT id, campaign_id, subscriber_id, status, error_message,
                           provider_message_id, provider_response,
                           sent_at, delivered_at, opened_at, clicked_at, created_at, updated_at
                    FROM campaign_messages
                    WHERE campaign_id = $1 AND status = $2
                    ORDER BY id
                    LIMIT $3 OFFSET $4
                    "#,
                )
                .bind(campaign_id)
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CampaignMessage>(
                    r#"
                    SELECT id, campaign_id, subscriber_id, status, error_message,
                           provider_message_id, provider_response,
                           sent_at, delivered_at, opened_at, clicked_at, created_at, updated_at
                    FROM campaign_messages
                    WHERE campaign_id = $1
                    ORDER BY id
                    LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(campaign_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(messages)
    }

    /// 投递事件回流
    ///
    /// 网关以 provider_message_id 回报 delivered/bounced/opened/clicked/
    /// unsubscribed。状态只进不退：迟到或重复的事件直接忽略（返回
    /// false），网关回调不保证顺序也不保证只送一次。unsubscribed 同时
    /// 把订阅者标记退订。
    pub async fn record_message_event(
        &self,
        tenant_id: &str,
        provider_message_id: &str,
        event: MessageStatus,
    ) -> Result<bool> {
        if matches!(
            event,
            MessageStatus::Pending | MessageStatus::Sent | MessageStatus::Failed
        ) {
            return Err(CampaignError::Validation(format!(
                "Unsupported delivery event: {event}"
            )));
        }

        let message = sqlx::query_as::<_, CampaignMessage>(
            r#"
            SELECT m.id, m.campaign_id, m.subscriber_id, m.status, m.error_message,
                   m.provider_message_id, m.provider_response,
                   m.sent_at, m.delivered_at, m.opened_at, m.clicked_at, m.created_at, m.updated_at
            FROM campaign_messages m
            JOIN campaigns c ON c.id = m.campaign_id
            WHERE m.provider_message_id = $1 AND c.tenant_id = $2
            "#,
        )
        .bind(provider_message_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CampaignError::NotFound {
            entity: "CampaignMessage".to_string(),
            id: provider_message_id.to_string(),
        })?;

        let current = message.current_status()?;
        if !current.can_advance_to(event) {
            info!(
                message_id = message.id,
                current = %current,
                event = %event,
                "事件不满足只进不退约束，忽略"
            );
            return Ok(false);
        }

        // 时间戳列按事件类型落到对应字段
        let timestamp_column = match event {
            MessageStatus::Delivered => Some("delivered_at"),
            MessageStatus::Opened => Some("opened_at"),
            MessageStatus::Clicked => Some("clicked_at"),
            _ => None,
        };

        let sql = match timestamp_column {
            Some(column) => format!(
                r#"
                UPDATE campaign_messages
                SET status = $2, {column} = NOW(), updated_at = NOW()
                WHERE id = $1 AND status = $3
                "#
            ),
            None => r#"
                UPDATE campaign_messages
                SET status = $2, updated_at = NOW()
                WHERE id = $1 AND status = $3
                "#
            .to_string(),
        };

        let updated = sqlx::query(&sql)
            .bind(message.id)
            .bind(event.as_str())
            .bind(current.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            // 并发事件抢先推进了状态
            return Ok(false);
        }

        // 对应的活动计数各推进一次
        let counter_column = match event {
            MessageStatus::Delivered => Some("delivered_count"),
            MessageStatus::Opened => Some("opened_count"),
            MessageStatus::Clicked => Some("clicked_count"),
            _ => None,
        };
        if let Some(column) = counter_column {
            let sql = format!(
                "UPDATE campaigns SET {column} = {column} + 1, updated_at = NOW() WHERE id = $1"
            );
            sqlx::query(&sql)
                .bind(message.campaign_id)
                .execute(&self.pool)
                .await?;
        }

        // 退订事件同步到订阅者本身
        if event == MessageStatus::Unsubscribed {
            sqlx::query(
                r#"
                UPDATE subscribers
                SET status = 'unsubscribed', opt_out_date = NOW()
                WHERE id = $1
                "#,
            )
            .bind(message.subscriber_id)
            .execute(&self.pool)
            .await?;
        }

        info!(
            message_id = message.id,
            event = %event,
            "投递事件已记录"
        );
        Ok(true)
    }

    // ---- 内部辅助 ----

    /// 校验不通过时汇总为 Validation 错误
    async fn require_valid(&self, campaign_id: i64, tenant_id: &str) -> Result<()> {
        let validation = self.validate_campaign(campaign_id, tenant_id).await?;
        if !validation.valid {
            return Err(CampaignError::Validation(validation.errors.join("; ")));
        }
        Ok(())
    }

    async fn count_eligible(&self, tenant_id: &str, list_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM subscribers
            WHERE tenant_id = $1 AND list_id = $2
              AND status = 'active'
              AND opt_in_date IS NOT NULL
              AND opt_out_date IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(list_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

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

    async fn load_list(&self, list_id: i64, tenant_id: &str) -> Result<SubscriberList> {
        sqlx::query_as::<_, SubscriberList>(
            "SELECT id, tenant_id, name, created_at FROM subscriber_lists WHERE id = $1 AND tenant_id = $2",
        )
        .bind(list_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CampaignError::NotFound {
            entity: "SubscriberList".to_string(),
            id: list_id.to_string(),
        })
    }
}

/// 从活动行计算统计
fn stats_from_campaign(campaign: &Campaign) -> CampaignStats {
    let sent = campaign.sent_count as f64;
    let rate = |count: i32| if sent > 0.0 { count as f64 / sent } else { 0.0 };

    CampaignStats {
        campaign_id: campaign.id,
        status: campaign.status.clone(),
        total_recipients: campaign.total_recipients,
        sent_count: campaign.sent_count,
        delivered_count: campaign.delivered_count,
        failed_count: campaign.failed_count,
        opened_count: campaign.opened_count,
        clicked_count: campaign.clicked_count,
        delivery_rate: rate(campaign.delivered_count),
        open_rate: rate(campaign.opened_count),
        click_rate: rate(campaign.clicked_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_campaign(status: &str, counts: (i32, i32, i32, i32, i32, i32)) -> Campaign {
        let (total, sent, delivered, failed, opened, clicked) = counts;
        Campaign {
            id: 1,
            tenant_id: "t-1".to_string(),
            name: "August newsletter".to_string(),
            template_id: 1,
            list_id: 1,
            status: status.to_string(),
            total_recipients: total,
            sent_count: sent,
            delivered_count: delivered,
            failed_count: failed,
            opened_count: opened,
            clicked_count: clicked,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_campaign_request_validation() {
        let ok = CreateCampaign {
            name: "Spring sale".to_string(),
            template_id: 1,
            list_id: 1,
        };
        assert!(ok.validate().is_ok());

        let empty = CreateCampaign {
            name: String::new(),
            template_id: 1,
            list_id: 1,
        };
        assert!(empty.validate().is_err());

        let too_long = CreateCampaign {
            name: "x".repeat(201),
            template_id: 1,
            list_id: 1,
        };
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn test_stats_rates() {
        let campaign = make_campaign("completed", (10, 8, 6, 2, 4, 1));
        let stats = stats_from_campaign(&campaign);

        assert_eq!(stats.sent_count, 8);
        assert!((stats.delivery_rate - 0.75).abs() < f64::EPSILON);
        assert!((stats.open_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.click_rate - 0.125).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_rates_with_zero_sent() {
        let campaign = make_campaign("draft", (0, 0, 0, 0, 0, 0));
        let stats = stats_from_campaign(&campaign);

        assert_eq!(stats.delivery_rate, 0.0);
        assert_eq!(stats.open_rate, 0.0);
        assert_eq!(stats.click_rate, 0.0);
    }

    #[test]
    fn test_recipient_query_defaults() {
        let query = RecipientQuery::default();
        assert!(query.status.is_none());
        assert_eq!(query.limit, 0);
        assert_eq!(query.offset, 0);
    }
}
