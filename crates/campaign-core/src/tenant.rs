//! 租户上下文
//!
//! 每个任务在执行业务逻辑前先解析租户上下文：加载租户行并校验
//! 可用性，解析失败对该任务是致命的。之后所有查询都以 tenant_id
//! 显式限定作用域。同时提供订阅套餐的渠道额度上限查询。

use sqlx::PgPool;
use tracing::warn;

use campaign_shared::error::{CampaignError, Result};

use crate::models::{Channel, Tenant};

/// 任务级租户上下文
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant: Tenant,
}

impl TenantContext {
    /// 解析租户上下文
    ///
    /// 租户不存在或已被禁用时返回错误，调用方应终止当前任务。
    pub async fn resolve(pool: &PgPool, tenant_id: &str) -> Result<Self> {
        let tenant = sqlx::query_as::<_, Tenant>(
            "SELECT id, name, email, phone, status, created_at FROM tenants WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CampaignError::NotFound {
            entity: "Tenant".to_string(),
            id: tenant_id.to_string(),
        })?;

        if !tenant.is_active() {
            warn!(tenant_id = %tenant_id, status = %tenant.status, "租户不可用，任务终止");
            return Err(CampaignError::TenantDisabled {
                tenant_id: tenant_id.to_string(),
            });
        }

        Ok(Self { tenant })
    }
}

/// 查询租户当前订阅套餐在某渠道的月度额度上限
///
/// 没有生效订阅时按 0 处理——没有套餐就没有基础额度，充值仍然有效。
pub async fn channel_limit(pool: &PgPool, tenant_id: &str, channel: Channel) -> Result<i64> {
    let column = match channel {
        Channel::Email => "email_limit",
        Channel::Sms => "sms_limit",
        Channel::Whatsapp => "whatsapp_limit",
        Channel::Push => "push_limit",
    };

    // 列名来自固定映射，可安全拼入 SQL
    let sql = format!(
        "SELECT {column} FROM tenant_subscriptions WHERE tenant_id = $1 AND status = 'active'"
    );

    let row: Option<(i64,)> = sqlx::query_as(&sql).bind(tenant_id).fetch_optional(pool).await?;

    Ok(row.map(|(limit,)| limit).unwrap_or(0))
}
