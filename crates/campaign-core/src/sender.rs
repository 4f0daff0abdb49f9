//! 多渠道发送器
//!
//! 通过 `ChannelSender` trait 抽象发送行为，邮件、短信、WhatsApp 各自
//! 提供独立实现，由 `SenderRegistry` 按模板渠道选取。
//!
//! 网关的预期失败（4xx 拒绝）不抛错，返回结构化失败由调用方记录为
//! 消息终态；只有基础设施故障（网络错误、超时、5xx）才以错误向上
//! 传播，交给任务队列重试。网关调用带客户端超时，避免慢网关拖住
//! Worker。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::info;

use campaign_shared::config::{
    EmailProviderConfig, SenderConfig, SmsProviderConfig, WhatsAppProviderConfig,
};
use campaign_shared::error::{CampaignError, Result};

use crate::models::{Channel, MessageTemplate, Subscriber};
use crate::template::RenderedMessage;

/// 短信在发送校验时的硬上限（字符数）
pub const SMS_MAX_SEND_CHARS: usize = 1600;

/// WhatsApp 文本上限（字符数）
pub const WHATSAPP_MAX_CHARS: usize = 4096;

/// 单段短信的字符数
const SMS_SINGLE_PART_CHARS: usize = 160;

/// 多段短信每段的字符数（分段头占 7 字符）
const SMS_MULTI_PART_CHARS: usize = 153;

// ---------------------------------------------------------------------------
// 校验与发送结果
// ---------------------------------------------------------------------------

/// 发送前校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientValidation {
    pub valid: bool,
    pub error: Option<String>,
}

impl RecipientValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// 发送结果
///
/// success=false 表示网关明确拒绝（业务失败，不重试）；
/// 基础设施故障不会出现在这里，而是以 Err 返回。
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    /// 网关返回的消息标识，用于追踪投递状态
    pub provider_message_id: Option<String>,
    /// 网关原始响应（不透明 JSON，仅诊断用）
    pub provider_response: Option<Value>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// ChannelSender trait
// ---------------------------------------------------------------------------

/// 渠道发送器 trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// 该发送器支持的渠道
    fn channel(&self) -> Channel;

    /// 每条消息的额度成本
    ///
    /// 当前策略为所有渠道统一 1 额度（短信分段数仅用于校验提示，
    /// 不参与计费）。
    fn cost_per_message(&self) -> i64 {
        1
    }

    /// 发送前校验：联系方式齐全且合法、模板渠道匹配、长度不超限
    fn validate(
        &self,
        subscriber: &Subscriber,
        template: &MessageTemplate,
    ) -> RecipientValidation;

    /// 执行网关调用
    async fn send(
        &self,
        subscriber: &Subscriber,
        template: &MessageTemplate,
        rendered: &RenderedMessage,
    ) -> Result<SendOutcome>;
}

// ---------------------------------------------------------------------------
// 通用辅助
// ---------------------------------------------------------------------------

/// 估算短信分段数
///
/// 不超过单段长度时为 1 段，否则按多段编码的每段容量向上取整。
/// 仅用于校验提示，不参与计费。
pub fn estimated_sms_parts(content: &str) -> u32 {
    let len = content.chars().count();
    if len == 0 {
        return 0;
    }
    if len <= SMS_SINGLE_PART_CHARS {
        1
    } else {
        len.div_ceil(SMS_MULTI_PART_CHARS) as u32
    }
}

/// 手机号归一化为 E.164
///
/// 规则：去掉 [0-9+] 以外的字符；已带 `+` 前缀的直接校验；否则去掉
/// 一个前导 `0` 并补上默认国家码。默认国家码是部署配置而非常量。
/// 无法归一化（为空或长度不合法）时返回 None。
pub fn normalize_phone(raw: &str, default_country_code: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();

    let normalized = if let Some(rest) = cleaned.strip_prefix('+') {
        if rest.contains('+') {
            return None;
        }
        format!("+{rest}")
    } else {
        let digits = cleaned.strip_prefix('0').unwrap_or(&cleaned);
        if digits.contains('+') {
            return None;
        }
        format!("+{default_country_code}{digits}")
    };

    // E.164：国家码 + 号码共 8~15 位数字
    let digit_count = normalized.len() - 1;
    if !(8..=15).contains(&digit_count) {
        return None;
    }
    Some(normalized)
}

/// 邮箱格式校验
pub fn is_valid_email(address: &str) -> bool {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    let re = EMAIL_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("正则必然合法")
    });
    re.is_match(address)
}

/// 校验模板渠道与发送器是否匹配
fn check_template_channel(template: &MessageTemplate, expected: Channel) -> Option<RecipientValidation> {
    match Channel::parse(&template.channel) {
        Ok(channel) if channel == expected => None,
        _ => Some(RecipientValidation::fail(format!(
            "Template channel mismatch: expected {expected}, got {}",
            template.channel
        ))),
    }
}

/// 构建带超时的网关 HTTP 客户端
fn build_client(timeout_seconds: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .map_err(|e| CampaignError::Internal(format!("构建网关客户端失败: {e}")))
}

/// 统一处理网关响应
///
/// 2xx → 成功；5xx / 网络错误 / 超时 → 可重试错误；其余状态码 →
/// 结构化业务失败（保留原始响应供诊断）。
async fn handle_provider_response(
    channel: Channel,
    result: std::result::Result<reqwest::Response, reqwest::Error>,
) -> Result<SendOutcome> {
    let response = match result {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            return Err(CampaignError::ProviderTimeout {
                channel: channel.as_str().to_string(),
            });
        }
        Err(e) => {
            return Err(CampaignError::Provider {
                channel: channel.as_str().to_string(),
                message: e.to_string(),
            });
        }
    };

    let status = response.status();
    let body: Value = match response.text().await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text })),
        Err(e) => {
            return Err(CampaignError::Provider {
                channel: channel.as_str().to_string(),
                message: format!("读取网关响应失败: {e}"),
            });
        }
    };

    if status.is_success() {
        let message_id = body
            .get("message_id")
            .or_else(|| body.get("id"))
            .and_then(|v| v.as_str())
            .map(String::from);

        return Ok(SendOutcome {
            success: true,
            provider_message_id: message_id,
            provider_response: Some(body),
            error: None,
        });
    }

    if status.is_server_error() {
        return Err(CampaignError::Provider {
            channel: channel.as_str().to_string(),
            message: format!("gateway returned {status}"),
        });
    }

    // 4xx：网关明确拒绝，属于业务失败，不重试
    let error = body
        .get("error")
        .or_else(|| body.get("message"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| format!("gateway returned {status}"));

    Ok(SendOutcome {
        success: false,
        provider_message_id: None,
        provider_response: Some(body),
        error: Some(error),
    })
}

// ---------------------------------------------------------------------------
// 邮件发送器
// ---------------------------------------------------------------------------

pub struct EmailSender {
    client: Client,
    config: EmailProviderConfig,
}

impl EmailSender {
    pub fn new(config: &SenderConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.provider_timeout_seconds)?,
            config: config.email.clone(),
        })
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn validate(
        &self,
        subscriber: &Subscriber,
        template: &MessageTemplate,
    ) -> RecipientValidation {
        if let Some(mismatch) = check_template_channel(template, Channel::Email) {
            return mismatch;
        }
        match subscriber.email.as_deref() {
            Some(address) if is_valid_email(address) => RecipientValidation::ok(),
            Some(_) => RecipientValidation::fail("Subscriber email address is malformed"),
            None => RecipientValidation::fail("Subscriber has no email address"),
        }
    }

    async fn send(
        &self,
        subscriber: &Subscriber,
        _template: &MessageTemplate,
        rendered: &RenderedMessage,
    ) -> Result<SendOutcome> {
        let to = subscriber.email.as_deref().unwrap_or_default();

        let payload = json!({
            "from": { "address": self.config.from_address, "name": self.config.from_name },
            "to": to,
            "subject": rendered.subject.as_deref().unwrap_or_default(),
            "html": rendered.content,
            "tags": ["campaign"],
        });

        let result = self.client.post(&self.config.api_url).json(&payload).send().await;
        let outcome = handle_provider_response(Channel::Email, result).await?;

        info!(
            subscriber_id = subscriber.id,
            success = outcome.success,
            message_id = ?outcome.provider_message_id,
            "邮件网关调用完成"
        );

        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// 短信发送器
// ---------------------------------------------------------------------------

pub struct SmsSender {
    client: Client,
    config: SmsProviderConfig,
    default_country_code: String,
}

impl SmsSender {
    pub fn new(config: &SenderConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.provider_timeout_seconds)?,
            config: config.sms.clone(),
            default_country_code: config.default_country_code.clone(),
        })
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn validate(
        &self,
        subscriber: &Subscriber,
        template: &MessageTemplate,
    ) -> RecipientValidation {
        if let Some(mismatch) = check_template_channel(template, Channel::Sms) {
            return mismatch;
        }

        let phone = match subscriber.phone.as_deref() {
            Some(p) => p,
            None => return RecipientValidation::fail("Subscriber has no phone number"),
        };
        if normalize_phone(phone, &self.default_country_code).is_none() {
            return RecipientValidation::fail("Subscriber phone number is not normalizable");
        }

        if template.content.chars().count() > SMS_MAX_SEND_CHARS {
            return RecipientValidation::fail(format!(
                "SMS content exceeds {SMS_MAX_SEND_CHARS} characters"
            ));
        }

        RecipientValidation::ok()
    }

    async fn send(
        &self,
        subscriber: &Subscriber,
        _template: &MessageTemplate,
        rendered: &RenderedMessage,
    ) -> Result<SendOutcome> {
        let raw_phone = subscriber.phone.as_deref().unwrap_or_default();
        let to = normalize_phone(raw_phone, &self.default_country_code).ok_or_else(|| {
            // validate 已拦截，此处只防御直接调用
            CampaignError::Validation(format!("无法归一化的手机号: {raw_phone}"))
        })?;

        let payload = json!({
            "from": self.config.from,
            "to": to,
            "text": rendered.content,
        });

        let result = self.client.post(&self.config.api_url).json(&payload).send().await;
        let outcome = handle_provider_response(Channel::Sms, result).await?;

        info!(
            subscriber_id = subscriber.id,
            success = outcome.success,
            message_id = ?outcome.provider_message_id,
            parts = estimated_sms_parts(&rendered.content),
            "短信网关调用完成"
        );

        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// WhatsApp 发送器
// ---------------------------------------------------------------------------

pub struct WhatsAppSender {
    client: Client,
    config: WhatsAppProviderConfig,
    default_country_code: String,
}

impl WhatsAppSender {
    pub fn new(config: &SenderConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.provider_timeout_seconds)?,
            config: config.whatsapp.clone(),
            default_country_code: config.default_country_code.clone(),
        })
    }
}

#[async_trait]
impl ChannelSender for WhatsAppSender {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    fn validate(
        &self,
        subscriber: &Subscriber,
        template: &MessageTemplate,
    ) -> RecipientValidation {
        if let Some(mismatch) = check_template_channel(template, Channel::Whatsapp) {
            return mismatch;
        }

        let phone = match subscriber.phone.as_deref() {
            Some(p) => p,
            None => return RecipientValidation::fail("Subscriber has no phone number"),
        };
        if normalize_phone(phone, &self.default_country_code).is_none() {
            return RecipientValidation::fail("Subscriber phone number is not normalizable");
        }

        if template.content.chars().count() > WHATSAPP_MAX_CHARS {
            return RecipientValidation::fail(format!(
                "WhatsApp content exceeds {WHATSAPP_MAX_CHARS} characters"
            ));
        }

        RecipientValidation::ok()
    }

    async fn send(
        &self,
        subscriber: &Subscriber,
        _template: &MessageTemplate,
        rendered: &RenderedMessage,
    ) -> Result<SendOutcome> {
        let raw_phone = subscriber.phone.as_deref().unwrap_or_default();
        let to = normalize_phone(raw_phone, &self.default_country_code).ok_or_else(|| {
            CampaignError::Validation(format!("无法归一化的手机号: {raw_phone}"))
        })?;

        let payload = json!({
            "from": self.config.from_number,
            "to": to,
            "text": rendered.content,
        });

        let result = self.client.post(&self.config.api_url).json(&payload).send().await;
        let outcome = handle_provider_response(Channel::Whatsapp, result).await?;

        info!(
            subscriber_id = subscriber.id,
            success = outcome.success,
            message_id = ?outcome.provider_message_id,
            "WhatsApp 网关调用完成"
        );

        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// SenderRegistry — 按渠道选取发送器
// ---------------------------------------------------------------------------

/// 发送器注册表
///
/// 按模板渠道选取对应的发送器。注册表构建后不可变，
/// Worker 之间以 Arc 共享。
#[derive(Clone)]
pub struct SenderRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new(senders: HashMap<Channel, Arc<dyn ChannelSender>>) -> Self {
        Self { senders }
    }

    /// 按配置构建三个消息渠道的发送器
    pub fn from_config(config: &SenderConfig) -> Result<Self> {
        let mut senders: HashMap<Channel, Arc<dyn ChannelSender>> = HashMap::new();
        senders.insert(Channel::Email, Arc::new(EmailSender::new(config)?));
        senders.insert(Channel::Sms, Arc::new(SmsSender::new(config)?));
        senders.insert(Channel::Whatsapp, Arc::new(WhatsAppSender::new(config)?));
        Ok(Self { senders })
    }

    pub fn for_channel(&self, channel: Channel) -> Option<Arc<dyn ChannelSender>> {
        self.senders.get(&channel).cloned()
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
