//! 队列 Worker
//!
//! 轮询 campaigns 队列，领取任务并按类型路由到管道处理器。
//! 失败处理遵循错误分类：可重试错误按任务自带的退避配置重新入队，
//! 尝试耗尽后触发该任务类型的失败钩子（发送任务把消息强制标记失败，
//! 与业务失败可区分）；不可重试错误直接进入 failed 终态。

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};

use campaign_core::dispatch::{
    DispatchPayload, DispatchPipeline, MonitorPayload, SendMessagePayload, force_fail_message,
    job_types,
};
use campaign_core::monitor::ProgressMonitor;
use campaign_shared::error::{CampaignError, Result};
use campaign_shared::observability::metrics;
use campaign_shared::queue::{Job, JobOutcome, JobQueue, queues};

/// 队列 Worker
///
/// 每个实例是一个独立的领取-执行循环；并发度由进程内启动的实例数
/// 决定，多进程部署时由队列的行锁保证互斥。
pub struct QueueWorker {
    pool: PgPool,
    queue: JobQueue,
    pipeline: DispatchPipeline,
    monitor: ProgressMonitor,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        pipeline: DispatchPipeline,
        monitor: ProgressMonitor,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            pipeline,
            monitor,
            poll_interval,
        }
    }

    /// 主循环：持续领取任务直到收到 shutdown 信号
    ///
    /// 队列非空时连续领取，空闲时按 poll_interval 休眠。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval = ?self.poll_interval, "QueueWorker 已启动");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.claim(queues::CAMPAIGNS).await {
                Ok(Some(job)) => {
                    self.execute(job).await;
                }
                Ok(None) => {
                    metrics::set_worker_last_run("queue_worker");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "领取任务失败");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!("QueueWorker 已停止");
    }

    /// 执行单个任务并做失败记账
    async fn execute(&self, job: Job) {
        let job_id = job.id;
        let job_type = job.job_type.clone();

        match self.route(&job).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(job_id).await {
                    error!(job_id, error = %e, "标记任务完成失败");
                }
            }
            Err(e) if e.is_retryable() => {
                let detail = format!("{}: {}", e.code(), e);
                match self.queue.retry_or_fail(&job, &detail).await {
                    Ok(JobOutcome::Retrying { next_run_at }) => {
                        info!(
                            job_id,
                            job_type = %job_type,
                            next_run_at = %next_run_at,
                            "任务将重试"
                        );
                    }
                    Ok(JobOutcome::Exhausted) => {
                        self.on_exhausted(&job, &e).await;
                    }
                    Err(qe) => {
                        error!(job_id, error = %qe, "任务失败记账出错");
                    }
                }
            }
            Err(e) => {
                // 不可重试：不消耗剩余尝试，直接终态并触发失败钩子
                warn!(job_id, job_type = %job_type, error = %e, "任务遇到不可重试错误");
                let detail = format!("{}: {}", e.code(), e);
                if let Err(qe) = self.queue.fail(job_id, &detail).await {
                    error!(job_id, error = %qe, "标记任务失败出错");
                }
                self.on_exhausted(&job, &e).await;
            }
        }
    }

    /// 按任务类型路由到处理器
    async fn route(&self, job: &Job) -> Result<()> {
        match job.job_type.as_str() {
            job_types::DISPATCH => {
                let payload: DispatchPayload = serde_json::from_value(job.payload.clone())?;
                self.pipeline.process_campaign(&payload).await
            }
            job_types::SEND_MESSAGE => {
                let payload: SendMessagePayload = serde_json::from_value(job.payload.clone())?;
                self.pipeline.send_campaign_message(&payload).await
            }
            job_types::MONITOR => {
                let payload: MonitorPayload = serde_json::from_value(job.payload.clone())?;
                self.monitor.check(&payload).await
            }
            other => Err(CampaignError::Internal(format!("未知任务类型: {other}"))),
        }
    }

    /// 尝试耗尽后的失败钩子
    ///
    /// 发送任务：把消息强制标记失败并带上尝试次数，使数据里能区分
    /// 「网关拒绝」与「重试耗尽」。派发任务在抛错前已把活动标记失败，
    /// 监控任务失败只记日志——下一轮监控（若有）会继续。
    async fn on_exhausted(&self, job: &Job, err: &CampaignError) {
        if job.job_type != job_types::SEND_MESSAGE {
            warn!(
                job_id = job.id,
                job_type = %job.job_type,
                error = %err,
                "任务进入失败终态"
            );
            return;
        }

        let payload: SendMessagePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                error!(job_id = job.id, error = %e, "解析发送任务载荷失败，无法标记消息");
                return;
            }
        };

        if let Err(e) = force_fail_message(
            &self.pool,
            payload.message_id,
            payload.campaign_id,
            job.attempts,
            &err.to_string(),
        )
        .await
        {
            error!(
                message_id = payload.message_id,
                error = %e,
                "强制标记消息失败时出错"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_payload_parses_from_job_payload() {
        let payload = json!({
            "message_id": 5,
            "campaign_id": 2,
            "tenant_id": "t-9"
        });
        let parsed: SendMessagePayload = serde_json::from_value(payload).unwrap();
        assert_eq!(parsed.message_id, 5);
        assert_eq!(parsed.campaign_id, 2);
        assert_eq!(parsed.tenant_id, "t-9");
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let payload = json!({"message_id": "not-a-number"});
        let parsed: std::result::Result<SendMessagePayload, _> =
            serde_json::from_value(payload);
        assert!(parsed.is_err());

        // serde 错误进入 CampaignError 后不可重试——重放也解析不出来
        let err: CampaignError = parsed.unwrap_err().into();
        assert!(!err.is_retryable());
    }
}
