//! 活动消息管道核心库
//!
//! 多租户消息活动的领域模型与核心管道：活动状态机、额度账本、
//! 渠道发送器、模板渲染、派发管道与进度监控。所有跨任务协调都
//! 通过持久化状态（活动/消息的状态列）完成，不依赖进程内共享内存。

pub mod credits;
pub mod dispatch;
pub mod models;
pub mod monitor;
pub mod sender;
pub mod service;
pub mod template;
pub mod tenant;
