//! 模板渲染
//!
//! 变量替换与模板校验。这里刻意不引入模板引擎——占位符替换是纯粹的
//! 子串替换，没有条件与循环。同时支持 `{{name}}` 与 `{name}` 两种
//! 占位符写法。
//!
//! 校验分两级：errors 阻断发送（内容为空、未知变量、邮件缺主题），
//! warnings 仅提示（短信长度与分段数的成本预警）。

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use regex::Regex;
use std::sync::OnceLock;

use crate::models::{Channel, MessageTemplate, Subscriber, Tenant};
use crate::sender::estimated_sms_parts;

/// 短信内容的成本预警阈值（字符数）
const SMS_CONTENT_WARN_CHARS: usize = 1000;

/// 短信分段数的成本预警阈值
const SMS_PARTS_WARN: u32 = 5;

/// 渲染结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    /// 仅邮件渠道有主题
    pub subject: Option<String>,
    pub content: String,
}

/// 模板校验结果
#[derive(Debug, Clone)]
pub struct TemplateValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// 模板渲染器
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    /// 退订链接的基础 URL，按订阅者 id 拼接
    unsubscribe_base_url: String,
}

/// 已知变量注册表：变量名 -> 用途说明
///
/// 渠道无关的静态表；校验时以此为白名单。
const AVAILABLE_VARIABLES: &[(&str, &str)] = &[
    ("first_name", "Subscriber first name"),
    ("last_name", "Subscriber last name"),
    ("full_name", "Subscriber full name"),
    ("email", "Subscriber email address"),
    ("phone", "Subscriber phone number"),
    ("tenant_name", "Tenant display name"),
    ("tenant_email", "Tenant contact email"),
    ("tenant_phone", "Tenant contact phone"),
    ("current_date", "Current date (DD/MM/YYYY)"),
    ("current_time", "Current time (HH:MM)"),
    ("unsubscribe_url", "Per-subscriber unsubscribe link"),
];

impl TemplateRenderer {
    pub fn new(unsubscribe_base_url: impl Into<String>) -> Self {
        Self {
            unsubscribe_base_url: unsubscribe_base_url.into(),
        }
    }

    /// 已知变量注册表
    pub fn available_variables() -> &'static [(&'static str, &'static str)] {
        AVAILABLE_VARIABLES
    }

    /// 渲染模板
    ///
    /// extra 中的同名变量覆盖内置变量。
    pub fn render(
        &self,
        template: &MessageTemplate,
        subscriber: &Subscriber,
        tenant: &Tenant,
        extra: &HashMap<String, String>,
    ) -> RenderedMessage {
        let mut variables = self.build_variables(subscriber, tenant);
        for (key, value) in extra {
            variables.insert(key.clone(), value.clone());
        }

        let content = substitute(&template.content, &variables);
        let subject = template
            .subject
            .as_deref()
            .map(|s| substitute(s, &variables));

        RenderedMessage { subject, content }
    }

    /// 校验模板
    pub fn validate_template(&self, template: &MessageTemplate) -> TemplateValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if template.content.trim().is_empty() {
            errors.push("Template content is empty".to_string());
        }

        let channel = match Channel::parse(&template.channel) {
            Ok(c) if c.is_messaging() => Some(c),
            Ok(c) => {
                errors.push(format!("Unsupported template channel: {c}"));
                None
            }
            Err(_) => {
                errors.push(format!("Unsupported template channel: {}", template.channel));
                None
            }
        };

        if channel == Some(Channel::Email)
            && template.subject.as_deref().unwrap_or("").trim().is_empty()
        {
            errors.push("Email templates require a subject".to_string());
        }

        // 内容与主题里出现的占位符必须都在白名单里
        let known: BTreeSet<&str> = AVAILABLE_VARIABLES.iter().map(|(name, _)| *name).collect();
        let mut found = extract_placeholders(&template.content);
        if let Some(subject) = &template.subject {
            found.extend(extract_placeholders(subject));
        }
        for name in &found {
            if !known.contains(name.as_str()) {
                errors.push(format!("Unknown template variable: {name}"));
            }
        }

        // 短信成本预警：不阻断发送，仅提示
        if channel == Some(Channel::Sms) {
            let len = template.content.chars().count();
            if len > SMS_CONTENT_WARN_CHARS {
                warnings.push(format!(
                    "SMS content is {len} characters; messages over {SMS_CONTENT_WARN_CHARS} characters are costly"
                ));
            }
            let parts = estimated_sms_parts(&template.content);
            if parts > SMS_PARTS_WARN {
                warnings.push(format!(
                    "SMS content is estimated at {parts} parts; consider shortening it"
                ));
            }
        }

        TemplateValidation {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// 构建内置变量表
    fn build_variables(&self, subscriber: &Subscriber, tenant: &Tenant) -> HashMap<String, String> {
        let now = Utc::now();
        let mut vars = HashMap::new();

        vars.insert(
            "first_name".to_string(),
            subscriber.first_name.clone().unwrap_or_default(),
        );
        vars.insert(
            "last_name".to_string(),
            subscriber.last_name.clone().unwrap_or_default(),
        );
        vars.insert("full_name".to_string(), subscriber.full_name());
        vars.insert(
            "email".to_string(),
            subscriber.email.clone().unwrap_or_default(),
        );
        vars.insert(
            "phone".to_string(),
            subscriber.phone.clone().unwrap_or_default(),
        );
        vars.insert("tenant_name".to_string(), tenant.name.clone());
        vars.insert("tenant_email".to_string(), tenant.email.clone());
        vars.insert(
            "tenant_phone".to_string(),
            tenant.phone.clone().unwrap_or_default(),
        );
        // 日期按 日/月/年 渲染
        vars.insert(
            "current_date".to_string(),
            now.format("%d/%m/%Y").to_string(),
        );
        vars.insert("current_time".to_string(), now.format("%H:%M").to_string());
        vars.insert(
            "unsubscribe_url".to_string(),
            format!("{}/{}", self.unsubscribe_base_url, subscriber.id),
        );

        vars
    }
}

/// 对文本执行变量替换
///
/// 先替换 `{{name}}` 再替换 `{name}`——双括号写法包含单括号子串，
/// 顺序颠倒会留下残缺的括号。
fn substitute(text: &str, variables: &HashMap<String, String>) -> String {
    let mut result = text.to_string();
    for (name, value) in variables {
        result = result.replace(&format!("{{{{{name}}}}}"), value);
        result = result.replace(&format!("{{{name}}}"), value);
    }
    result
}

/// 提取文本中的占位符名称（两种写法）
fn extract_placeholders(text: &str) -> BTreeSet<String> {
    static DOUBLE: OnceLock<Regex> = OnceLock::new();
    static SINGLE: OnceLock<Regex> = OnceLock::new();

    let double = DOUBLE
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z][A-Za-z0-9_]*)\s*\}\}").expect("正则必然合法"));
    let single = SINGLE
        .get_or_init(|| Regex::new(r"\{([A-Za-z][A-Za-z0-9_]*)\}").expect("正则必然合法"));

    let mut names = BTreeSet::new();
    for captures in double.captures_iter(text) {
        names.insert(captures[1].to_string());
    }

    // 先把双括号占位符抹掉，避免单括号正则匹配到它的内层
    let masked = double.replace_all(text, " ");
    for captures in single.captures_iter(&masked) {
        names.insert(captures[1].to_string());
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_subscriber() -> Subscriber {
        Subscriber {
            id: 42,
            tenant_id: "t-1".to_string(),
            list_id: Some(1),
            first_name: Some("Wei".to_string()),
            last_name: Some("Chen".to_string()),
            email: Some("wei.chen@example.com".to_string()),
            phone: Some("+8613800001111".to_string()),
            status: "active".to_string(),
            opt_in_date: Some(Utc::now()),
            opt_out_date: None,
            created_at: Utc::now(),
        }
    }

    fn make_tenant() -> Tenant {
        Tenant {
            id: "t-1".to_string(),
            name: "Acme Ltd".to_string(),
            email: "hello@acme.example.com".to_string(),
            phone: Some("+861088880000".to_string()),
            status: "active".to_string(),
            created_at: Utc::now(),
        }
    }

    fn make_template(channel: &str, subject: Option<&str>, content: &str) -> MessageTemplate {
        MessageTemplate {
            id: 1,
            tenant_id: "t-1".to_string(),
            name: "tpl".to_string(),
            channel: channel.to_string(),
            subject: subject.map(String::from),
            content: content.to_string(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_double_brace_syntax() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");
        let template = make_template("email", Some("Hi {{first_name}}"), "Hello {{full_name}}!");

        let rendered = renderer.render(&template, &make_subscriber(), &make_tenant(), &HashMap::new());
        assert_eq!(rendered.subject.as_deref(), Some("Hi Wei"));
        assert_eq!(rendered.content, "Hello Wei Chen!");
    }

    #[test]
    fn test_render_single_brace_syntax() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");
        let template = make_template("sms", None, "{first_name}, {tenant_name} has news");

        let rendered = renderer.render(&template, &make_subscriber(), &make_tenant(), &HashMap::new());
        assert_eq!(rendered.content, "Wei, Acme Ltd has news");
        assert!(rendered.subject.is_none());
    }

    #[test]
    fn test_render_extra_variables_override_builtins() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");
        let template = make_template("email", Some("s"), "Dear {{first_name}}");

        let mut extra = HashMap::new();
        extra.insert("first_name".to_string(), "VIP customer".to_string());

        let rendered = renderer.render(&template, &make_subscriber(), &make_tenant(), &extra);
        assert_eq!(rendered.content, "Dear VIP customer");
    }

    #[test]
    fn test_render_unsubscribe_url_keyed_by_subscriber() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");
        let template = make_template("email", Some("s"), "{{unsubscribe_url}}");

        let rendered = renderer.render(&template, &make_subscriber(), &make_tenant(), &HashMap::new());
        assert_eq!(rendered.content, "https://app.example.com/unsubscribe/42");
    }

    /// 覆盖全部已知变量的模板渲染后不应残留任何占位符
    #[test]
    fn test_render_all_variables_leaves_no_tokens() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");

        let mut content = String::new();
        for (name, _) in TemplateRenderer::available_variables() {
            content.push_str(&format!("{{{{{name}}}}} {{{name}}} "));
        }
        let template = make_template("email", Some("subject"), &content);

        let rendered = renderer.render(&template, &make_subscriber(), &make_tenant(), &HashMap::new());
        assert!(
            !rendered.content.contains('{') && !rendered.content.contains('}'),
            "渲染结果残留占位符: {}",
            rendered.content
        );
    }

    #[test]
    fn test_validate_empty_content() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");
        let template = make_template("email", Some("subject"), "   ");

        let result = renderer.validate_template(&template);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("content is empty")));
    }

    #[test]
    fn test_validate_email_requires_subject() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");
        let template = make_template("email", None, "body");

        let result = renderer.validate_template(&template);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("require a subject")));

        // 非邮件渠道无主题要求
        let sms = make_template("sms", None, "body");
        assert!(renderer.validate_template(&sms).valid);
    }

    #[test]
    fn test_validate_unknown_variable_listed() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");
        let template = make_template("email", Some("Hi"), "Hello {{nonexistent_var}}");

        let result = renderer.validate_template(&template);
        assert!(!result.valid);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.contains("nonexistent_var")),
            "未知变量应被列出: {:?}",
            result.errors
        );
    }

    #[test]
    fn test_validate_unknown_channel() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");
        let template = make_template("fax", None, "body");
        let result = renderer.validate_template(&template);
        assert!(!result.valid);

        // push 渠道没有活动发送器，同样不可用于模板
        let push = make_template("push", None, "body");
        assert!(!renderer.validate_template(&push).valid);
    }

    #[test]
    fn test_validate_sms_warnings_do_not_invalidate() {
        let renderer = TemplateRenderer::new("https://app.example.com/unsubscribe");
        let long_content = "a".repeat(1200);
        let template = make_template("sms", None, &long_content);

        let result = renderer.validate_template(&template);
        // 预警不影响有效性
        assert!(result.valid);
        assert!(!result.warnings.is_empty());
        assert!(result.warnings.iter().any(|w| w.contains("characters")));
        assert!(result.warnings.iter().any(|w| w.contains("parts")));
    }

    #[test]
    fn test_extract_placeholders_both_syntaxes() {
        let names = extract_placeholders("{{first_name}} and {last_name} but not {{ spaced }}");
        assert!(names.contains("first_name"));
        assert!(names.contains("last_name"));
        assert!(names.contains("spaced"));
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_extract_placeholders_ignores_plain_braces() {
        let names = extract_placeholders("JSON like {\"a\": 1} has no placeholders");
        assert!(names.is_empty());
    }

    #[test]
    fn test_available_variables_registry_is_stable() {
        let vars = TemplateRenderer::available_variables();
        assert_eq!(vars.len(), 11);
        assert!(vars.iter().any(|(name, _)| *name == "unsubscribe_url"));
        // 说明文字不应为空
        assert!(vars.iter().all(|(_, desc)| !desc.is_empty()));
    }
}
