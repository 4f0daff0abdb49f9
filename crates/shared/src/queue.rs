//! 持久化任务队列
//!
//! 基于 PostgreSQL 的延迟任务队列：任务带命名队列、执行时间（run_at）、
//! 尝试次数与退避配置。Worker 通过 `FOR UPDATE SKIP LOCKED` 在事务内
//! 领取任务，保证多实例部署时任务不会被重复消费；领取与状态变更是
//! 原子操作。投递语义为 at-least-once——Worker 在执行中途崩溃时任务
//! 会停留在 running 状态，由人工或清理作业重新投递，因此所有任务
//! 处理器都必须幂等。

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::Result;

/// 命名队列
pub mod queues {
    /// 活动派发、消息发送与进度监控任务
    pub const CAMPAIGNS: &str = "campaigns";
    /// 未指定队列的任务
    pub const DEFAULT: &str = "default";
}

/// 待入队的任务
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    /// 延迟执行的秒数（0 表示立即可领取）
    pub delay_seconds: i64,
    /// 最大尝试次数（含首次执行）
    pub max_attempts: i32,
    /// 每次失败后的固定退避间隔（秒）
    pub backoff_seconds: i64,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: queues::DEFAULT.to_string(),
            job_type: job_type.into(),
            payload,
            delay_seconds: 0,
            max_attempts: 1,
            backoff_seconds: 60,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_delay_seconds(mut self, delay_seconds: i64) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    /// 设置队列级重试参数
    pub fn with_retry(mut self, max_attempts: i32, backoff_seconds: i64) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_seconds = backoff_seconds;
        self
    }
}

/// 已领取的任务
#[derive(Debug, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    /// 已开始执行的次数（含本次）
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff_seconds: i64,
}

impl Job {
    /// 本次失败后是否还有剩余尝试机会
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// 失败处理的结果
#[derive(Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// 已重新入队，将在 run_at 之后再次执行
    Retrying { next_run_at: DateTime<Utc> },
    /// 尝试次数用尽，任务进入 failed 终态
    Exhausted,
}

/// 任务队列客户端
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 入队一个任务
    pub async fn enqueue(&self, job: NewJob) -> Result<i64> {
        let run_at = Utc::now() + Duration::seconds(job.delay_seconds);

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO queue_jobs
                (queue, job_type, payload, status, run_at, attempts, max_attempts, backoff_seconds, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, 0, $5, $6, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(run_at)
        .bind(job.max_attempts)
        .bind(job.backoff_seconds)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            job_id = row.0,
            queue = %job.queue,
            job_type = %job.job_type,
            delay_seconds = job.delay_seconds,
            "任务已入队"
        );

        Ok(row.0)
    }

    /// 领取一个可执行的任务
    ///
    /// 在事务内抢占最早到期的 pending 任务并标记为 running，
    /// 同时累加 attempts。已被其他实例锁定的行会被跳过而不是等待。
    pub async fn claim(&self, queue: &str) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, queue, job_type, payload, attempts, max_attempts, backoff_seconds
            FROM queue_jobs
            WHERE queue = $1
              AND status = 'pending'
              AND run_at <= NOW()
            ORDER BY run_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await?;

        let mut job = match job {
            Some(j) => j,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'running', attempts = attempts + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        job.attempts += 1;

        debug!(
            job_id = job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "领取到任务"
        );

        Ok(Some(job))
    }

    /// 标记任务执行成功
    pub async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE queue_jobs SET status = 'completed', updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 任务失败后重新入队或进入终态
    ///
    /// 还有剩余尝试机会时按固定退避重新入队；否则标记 failed 并保留
    /// 最后一次错误信息。failed 行即是该队列的死信记录。
    pub async fn retry_or_fail(&self, job: &Job, error: &str) -> Result<JobOutcome> {
        if job.has_attempts_left() {
            let next_run_at = Utc::now() + Duration::seconds(job.backoff_seconds);

            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'pending', run_at = $2, last_error = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(next_run_at)
            .bind(error)
            .execute(&self.pool)
            .await?;

            info!(
                job_id = job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                backoff_seconds = job.backoff_seconds,
                "任务失败，已按退避重新入队"
            );

            Ok(JobOutcome::Retrying { next_run_at })
        } else {
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'failed', last_error = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(error)
            .execute(&self.pool)
            .await?;

            info!(
                job_id = job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                "任务尝试次数用尽，进入 failed 终态"
            );

            Ok(JobOutcome::Exhausted)
        }
    }

    /// 直接把任务标记为 failed 终态（不可重试错误使用，跳过剩余尝试）
    pub async fn fail(&self, job_id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 统计某队列中待执行的任务数（监控用）
    pub async fn pending_count(&self, queue: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = $1 AND status = 'pending'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
