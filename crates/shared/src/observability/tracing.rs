//! 日志初始化
//!
//! 基于 tracing-subscriber 的结构化日志，支持 env-filter 过滤
//! 与 json/pretty 两种输出格式。

use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;

/// 初始化全局日志订阅器
///
/// RUST_LOG 环境变量优先于配置中的 log_level。重复初始化时静默忽略，
/// 便于测试中多次调用。
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let result = if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    // 已初始化过（如测试场景）时忽略错误
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = ObservabilityConfig::default();
        init(&config);
        // 第二次调用不应 panic
        init(&config);
    }
}
