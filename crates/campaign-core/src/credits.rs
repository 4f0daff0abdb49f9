//! 租户额度账本
//!
//! 按 (租户, 渠道, 账期) 维护可用额度：
//! 可用额度 = max(0, 订阅上限 + 账期内充值 - 账期内用量)。
//! 账期为平台统一的 UTC 自然月；用量行在账期内首次访问时惰性创建。
//!
//! 扣减是整个系统唯一的多写者热点。check-then-act 的窗口里并发发送
//! 可能同时通过预检，因此扣减本身在一个事务内重新计算上限并执行
//! 条件自增（`UPDATE ... WHERE used + n <= bound`），以受影响行数为准，
//! 保证用量永远不会越过上限。
//!
//! 可用额度按 (租户, 渠道) 缓存，短 TTL，任何扣减/充值都会使缓存失效。

use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use campaign_shared::cache::{Cache, CacheKey};
use campaign_shared::error::{CampaignError, Result};
use campaign_shared::observability::metrics;

use crate::models::Channel;
use crate::tenant;

/// 计算某时间点所在的账期（UTC 自然月）
///
/// 返回 (period_start, period_end)，end 为下月首日（半开区间）。
pub fn period_for(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
        .expect("月份首日必然有效");
    let end = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).expect("次年一月首日必然有效")
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1).expect("下月首日必然有效")
    };
    (start, end)
}

/// 当前账期
pub fn current_period() -> (NaiveDate, NaiveDate) {
    period_for(Utc::now().date_naive())
}

/// 租户额度账本
#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
    cache: Cache,
    cache_ttl: Duration,
}

impl CreditLedger {
    pub fn new(pool: PgPool, cache: Cache, cache_ttl: Duration) -> Self {
        Self {
            pool,
            cache,
            cache_ttl,
        }
    }

    /// 查询可用额度（带缓存）
    pub async fn available_credits(&self, tenant_id: &str, channel: Channel) -> Result<i64> {
        let key = CacheKey::tenant_credits(tenant_id, channel.as_str());
        let ttl = self.cache_ttl;

        self.cache
            .get_or_set(&key, ttl, || self.compute_available(tenant_id, channel))
            .await
    }

    /// 预检：某渠道是否还有 amount 的可用额度
    ///
    /// 这是一个软检查——从检查到实际扣减之间额度可能被并发消耗，
    /// 最终以 `deduct_credits` 的条件自增为准。
    pub async fn can_use_channel(
        &self,
        tenant_id: &str,
        channel: Channel,
        amount: i64,
    ) -> Result<bool> {
        Ok(self.available_credits(tenant_id, channel).await? >= amount)
    }

    /// 扣减额度
    ///
    /// 在单个事务内重新计算上限并条件自增用量列；受影响行数为 0 说明
    /// 并发扣减已先行耗尽额度，返回 InsufficientCredits。成功后使缓存失效。
    pub async fn deduct_credits(
        &self,
        tenant_id: &str,
        channel: Channel,
        amount: i64,
    ) -> Result<()> {
        if amount <= 0 {
            return Err(CampaignError::Validation(format!(
                "扣减额度必须为正数: {amount}"
            )));
        }

        let (period_start, period_end) = current_period();
        let column = channel.usage_column();

        let mut tx = self.pool.begin().await?;

        // 账期用量行惰性创建
        sqlx::query(
            r#"
            INSERT INTO tenant_usage (tenant_id, period_start, period_end)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, period_start) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(period_start)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        // 在同一事务内取上限与充值，保证条件自增的边界是当下一致的
        let limit = Self::channel_limit_tx(&mut tx, tenant_id, channel).await?;
        let topups =
            Self::period_topups(&mut tx, tenant_id, channel, period_start, period_end).await?;
        let bound = limit + topups;

        // 条件自增：用量越过边界时一行也不会更新
        let sql = format!(
            r#"
            UPDATE tenant_usage
            SET {column} = {column} + $3, updated_at = NOW()
            WHERE tenant_id = $1 AND period_start = $2 AND {column} + $3 <= $4
            "#
        );
        let updated = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(period_start)
            .bind(amount)
            .bind(bound)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            metrics::record_credit_deduction(channel.as_str(), "insufficient");

            let available = self.compute_available(tenant_id, channel).await.unwrap_or(0);
            return Err(CampaignError::InsufficientCredits {
                channel: channel.as_str().to_string(),
                required: amount,
                available,
            });
        }

        tx.commit().await?;
        metrics::record_credit_deduction(channel.as_str(), "ok");

        self.invalidate(tenant_id, channel).await;
        Ok(())
    }

    /// 追加充值流水
    ///
    /// 充值记录只追加不修改，构成人工额度调整的审计轨迹。
    pub async fn add_credits(
        &self,
        tenant_id: &str,
        channel: Channel,
        amount: i64,
        reason: &str,
    ) -> Result<()> {
        if amount <= 0 {
            return Err(CampaignError::Validation(format!(
                "充值额度必须为正数: {amount}"
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO tenant_topups (tenant_id, channel, amount, reason, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(tenant_id)
        .bind(channel.as_str())
        .bind(amount)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        info!(
            tenant_id = %tenant_id,
            channel = %channel,
            amount,
            reason = %reason,
            "已追加充值流水"
        );

        self.invalidate(tenant_id, channel).await;
        Ok(())
    }

    /// 从数据源计算可用额度
    async fn compute_available(&self, tenant_id: &str, channel: Channel) -> Result<i64> {
        let (period_start, period_end) = current_period();

        let limit = tenant::channel_limit(&self.pool, tenant_id, channel).await?;

        let topups: (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM tenant_topups
            WHERE tenant_id = $1 AND channel = $2
              AND created_at >= $3 AND created_at < $4
            "#,
        )
        .bind(tenant_id)
        .bind(channel.as_str())
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        let column = channel.usage_column();
        let sql = format!(
            "SELECT {column} FROM tenant_usage WHERE tenant_id = $1 AND period_start = $2"
        );
        let usage: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(period_start)
            .fetch_optional(&self.pool)
            .await?;
        let used = usage.map(|(n,)| n).unwrap_or(0);

        Ok((limit + topups.0 - used).max(0))
    }

    /// 事务内查询订阅套餐的渠道上限
    async fn channel_limit_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: &str,
        channel: Channel,
    ) -> Result<i64> {
        let column = match channel {
            Channel::Email => "email_limit",
            Channel::Sms => "sms_limit",
            Channel::Whatsapp => "whatsapp_limit",
            Channel::Push => "push_limit",
        };
        let sql = format!(
            "SELECT {column} FROM tenant_subscriptions WHERE tenant_id = $1 AND status = 'active'"
        );
        let row: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(|(limit,)| limit).unwrap_or(0))
    }

    /// 事务内统计账期充值总额
    async fn period_topups(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: &str,
        channel: Channel,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM tenant_topups
            WHERE tenant_id = $1 AND channel = $2
              AND created_at >= $3 AND created_at < $4
            "#,
        )
        .bind(tenant_id)
        .bind(channel.as_str())
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.0)
    }

    /// 使缓存失效
    ///
    /// 扣减/充值已落库，缓存失效失败只会让余额读数在 TTL 内偏旧，
    /// 记录告警即可，不回滚业务操作。
    async fn invalidate(&self, tenant_id: &str, channel: Channel) {
        let key = CacheKey::tenant_credits(tenant_id, channel.as_str());
        if let Err(e) = self.cache.delete(&key).await {
            warn!(key = %key, error = %e, "额度缓存失效失败，读数将在 TTL 内偏旧");
        }
    }
}
