//! 可观测性模块
//!
//! 日志（tracing）与 Prometheus 指标的初始化入口。

pub mod metrics;
pub mod tracing;

use crate::config::ObservabilityConfig;
use anyhow::Result;

/// 初始化日志与指标
///
/// 返回的 handle 持有指标 HTTP 服务器的生命周期，调用方需持有到进程退出。
pub async fn init(
    service_name: &str,
    config: &ObservabilityConfig,
) -> Result<Option<metrics::MetricsHandle>> {
    tracing::init(config);

    if config.metrics_enabled {
        let handle = metrics::init(service_name, config).await?;
        Ok(Some(handle))
    } else {
        Ok(None)
    }
}
