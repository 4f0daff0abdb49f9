//! 领域模型
//!
//! 活动消息管道的实体行结构与状态枚举。状态在数据库中以文本存储
//! （查询时直接绑定字面量），枚举提供解析、展示与状态迁移判定。
//! 活动与消息的状态迁移都是单向的：活动仅 paused ⇄ sending 可往返，
//! 消息状态沿 pending → sent/failed → delivered/bounced → opened →
//! clicked 单向推进。

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use campaign_shared::error::{CampaignError, Result};

// ---------------------------------------------------------------------------
// Channel — 消息渠道
// ---------------------------------------------------------------------------

/// 消息渠道
///
/// 账本识别四个渠道（用量表四列计数），但活动模板只允许三个消息
/// 渠道——push 额度服务于相邻的推送产品，没有活动发送器。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Whatsapp,
    Push,
}

impl Channel {
    /// 从存储文本解析，无法识别的渠道返回 InvalidChannel
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "whatsapp" => Ok(Self::Whatsapp),
            "push" => Ok(Self::Push),
            other => Err(CampaignError::InvalidChannel(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
            Self::Push => "push",
        }
    }

    /// 该渠道在 tenant_usage 表中的计数列名
    ///
    /// 列名来自固定映射而非拼接输入，保证 SQL 注入安全。
    pub fn usage_column(&self) -> &'static str {
        match self {
            Self::Email => "email_sent",
            Self::Sms => "sms_sent",
            Self::Whatsapp => "whatsapp_sent",
            Self::Push => "push_sent",
        }
    }

    /// 是否为活动模板可用的消息渠道
    pub fn is_messaging(&self) -> bool {
        !matches!(self, Self::Push)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CampaignStatus — 活动状态
// ---------------------------------------------------------------------------

/// 活动状态
///
/// draft → scheduled → sending → {paused ⇄ sending} → {completed | failed}。
/// completed 与 failed 为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "sending" => Ok(Self::Sending),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CampaignError::Internal(format!(
                "未知的活动状态: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// 是否可触发发送（派发管道入口的幂等检查也使用该判定）
    pub fn can_be_sent(&self) -> bool {
        matches!(self, Self::Draft | Self::Scheduled)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, Self::Sending)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Paused)
    }

    /// 除已完成外均可取消
    pub fn can_cancel(&self) -> bool {
        !matches!(self, Self::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MessageStatus — 消息状态
// ---------------------------------------------------------------------------

/// 单条消息的投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Bounced,
    Opened,
    Clicked,
    Unsubscribed,
}

impl MessageStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "bounced" => Ok(Self::Bounced),
            "opened" => Ok(Self::Opened),
            "clicked" => Ok(Self::Clicked),
            "unsubscribed" => Ok(Self::Unsubscribed),
            other => Err(CampaignError::Internal(format!(
                "未知的消息状态: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Bounced => "bounced",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    /// 状态是否允许向 next 推进（只进不退）
    ///
    /// failed 与 bounced 是终态；unsubscribed 可在任何已送达状态之后
    /// 发生（网关回调顺序不保证）。
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Sent, Delivered)
                | (Sent, Bounced)
                | (Delivered, Opened)
                | (Opened, Clicked)
                | (Sent, Unsubscribed)
                | (Delivered, Unsubscribed)
                | (Opened, Unsubscribed)
                | (Clicked, Unsubscribed)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// 实体行结构
// ---------------------------------------------------------------------------

/// 租户
///
/// 所有其他实体的作用域根。注册时创建，永不物理删除（软禁用）。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// 消息活动
///
/// 计数器在发送期间单调不减；一旦发送过便不再物理删除。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Campaign {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    pub template_id: i64,
    pub list_id: i64,
    pub status: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub failed_count: i32,
    pub opened_count: i32,
    pub clicked_count: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn current_status(&self) -> Result<CampaignStatus> {
        CampaignStatus::parse(&self.status)
    }
}

/// 消息模板
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageTemplate {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    pub channel: String,
    pub subject: Option<String>,
    pub content: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageTemplate {
    pub fn current_channel(&self) -> Result<Channel> {
        Channel::parse(&self.channel)
    }
}

/// 订阅者列表
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriberList {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// 订阅者
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscriber {
    pub id: i64,
    pub tenant_id: String,
    pub list_id: Option<i64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: String,
    pub opt_in_date: Option<DateTime<Utc>>,
    pub opt_out_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    /// 合格收件人：active、已 opt-in 且未 opt-out
    pub fn is_eligible(&self) -> bool {
        self.status == "active" && self.opt_in_date.is_some() && self.opt_out_date.is_none()
    }

    pub fn full_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first.to_string(),
            (None, Some(last)) => last.to_string(),
            (None, None) => String::new(),
        }
    }
}

/// 每收件人投递记录
///
/// 每个 (campaign, subscriber) 组合恰好一行，由派发管道批量创建，
/// 之后每次终态迁移只被发送 Worker 修改一次。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CampaignMessage {
    pub id: i64,
    pub campaign_id: i64,
    pub subscriber_id: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    /// 网关原始响应，仅作诊断用途的不透明 JSON
    pub provider_response: Option<serde_json::Value>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignMessage {
    pub fn current_status(&self) -> Result<MessageStatus> {
        MessageStatus::parse(&self.status)
    }
}

/// 租户账期用量，每 (tenant, 账期) 一行
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantUsage {
    pub id: i64,
    pub tenant_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub email_sent: i64,
    pub sms_sent: i64,
    pub whatsapp_sent: i64,
    pub push_sent: i64,
}

/// 手工充值流水，只追加不修改
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantTopUp {
    pub id: i64,
    pub tenant_id: String,
    pub channel: String,
    pub amount: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
