//! 活动 Worker 服务
//!
//! 从 campaigns 队列领取任务并路由到管道处理器：活动扇出、单条消息
//! 发送、进度监控。另带一个排期 Worker，把到期的 scheduled 活动触发
//! 为实际派发。

pub mod runner;
pub mod schedule_worker;
