//! 统一错误处理模块
//!
//! 定义系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 错误分为两大类：业务失败（不重试，直接记录为终态）与基础设施故障
//! （由任务队列按退避策略重试），通过 `is_retryable` 区分。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum CampaignError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== 缓存错误 ====================
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    // ==================== 业务逻辑错误 ====================
    #[error("额度不足: 渠道={channel}, 需要 {required}, 可用 {available}")]
    InsufficientCredits {
        channel: String,
        required: i64,
        available: i64,
    },

    #[error("无效的渠道: {0}")]
    InvalidChannel(String),

    #[error("状态不允许该操作: {entity} 当前状态={actual}, 期望={expected}")]
    StatusConflict {
        entity: String,
        expected: String,
        actual: String,
    },

    #[error("租户不可用: {tenant_id}")]
    TenantDisabled { tenant_id: String },

    // ==================== 验证错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    // ==================== 外部网关错误 ====================
    #[error("网关调用失败: 渠道={channel} - {message}")]
    Provider { channel: String, message: String },

    #[error("网关调用超时: 渠道={channel}")]
    ProviderTimeout { channel: String },

    // ==================== 序列化错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, CampaignError>;

impl CampaignError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Redis(_) => "REDIS_ERROR",
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::InvalidChannel(_) => "INVALID_CHANNEL",
            Self::StatusConflict { .. } => "STATUS_CONFLICT",
            Self::TenantDisabled { .. } => "TENANT_DISABLED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Provider { .. } => "PROVIDER_ERROR",
            Self::ProviderTimeout { .. } => "PROVIDER_TIMEOUT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有基础设施层的瞬时故障才重试。业务失败（额度不足、渠道无效、
    /// 状态冲突等）重试也不会改变结果，由调用方记录为终态。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Redis(_)
                | Self::Provider { .. }
                | Self::ProviderTimeout { .. }
        )
    }
}
