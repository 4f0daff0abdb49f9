//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use chrono::Utc;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let builder = PrometheusBuilder::new();
    let handle = builder.install_recorder()?;

    // 保存到全局，供其他地方获取指标快照
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册通用指标（预定义的业务指标）
///
/// 描述会出现在 /metrics 端点的 HELP 注释中。
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "campaign_dispatches_total",
        "Total number of campaign fan-outs, labelled by result"
    );
    metrics::describe_counter!(
        "campaign_messages_sent_total",
        "Total number of campaign messages sent, labelled by channel"
    );
    metrics::describe_counter!(
        "campaign_messages_failed_total",
        "Total number of campaign messages terminally failed, labelled by channel"
    );
    metrics::describe_counter!(
        "credit_deductions_total",
        "Total number of credit deductions, labelled by channel and result"
    );
    metrics::describe_counter!(
        "credit_shortfalls_total",
        "Deductions rejected after a successful send (post-send shortfall)"
    );
    metrics::describe_histogram!(
        "provider_send_duration_seconds",
        "Provider gateway call duration in seconds"
    );
    metrics::describe_gauge!(
        "worker_last_run_timestamp",
        "Unix timestamp of the last completed worker loop iteration"
    );

    // 记录服务启动
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics server error");
        }
    });

    Ok(server_handle)
}

// ---------------------------------------------------------------------------
// 业务指标记录辅助函数
// ---------------------------------------------------------------------------

/// 记录一次活动派发
pub fn record_campaign_dispatch(result: &'static str) {
    metrics::counter!("campaign_dispatches_total", "result" => result).increment(1);
}

/// 记录一条消息发送成功
pub fn record_message_sent(channel: &str) {
    metrics::counter!("campaign_messages_sent_total", "channel" => channel.to_string())
        .increment(1);
}

/// 记录一条消息进入失败终态
pub fn record_message_failed(channel: &str) {
    metrics::counter!("campaign_messages_failed_total", "channel" => channel.to_string())
        .increment(1);
}

/// 记录一次额度扣减
pub fn record_credit_deduction(channel: &str, result: &'static str) {
    metrics::counter!(
        "credit_deductions_total",
        "channel" => channel.to_string(),
        "result" => result
    )
    .increment(1);
}

/// 记录一次发送后扣减失败（额度在发送与扣减之间被并发耗尽）
pub fn record_credit_shortfall(channel: &str) {
    metrics::counter!("credit_shortfalls_total", "channel" => channel.to_string()).increment(1);
}

/// 记录网关调用耗时
pub fn record_provider_duration(channel: &str, seconds: f64) {
    metrics::histogram!(
        "provider_send_duration_seconds",
        "channel" => channel.to_string()
    )
    .record(seconds);
}

/// 记录 Worker 健康状态，供告警判断 Worker 是否存活
pub fn set_worker_last_run(worker: &'static str) {
    metrics::gauge!("worker_last_run_timestamp", "worker" => worker)
        .set(Utc::now().timestamp() as f64);
}
