//! 定时任务：一次性提醒、每日任务与心跳
//!
//! 任务持久化在 SQLite，重启后重新计算下一次触发；到期时经由会话 worker 执行，
//! 与聊天 / CLI 目标走同一条执行链路。

pub mod coordinator;
pub mod job;
pub mod store;
pub mod trigger;

pub use coordinator::JobScheduler;
pub use job::{JobId, JobNotification, JobStatus, ScheduledJob, HEARTBEAT_GOAL};
pub use store::JobStore;
pub use trigger::{next_daily, Trigger};
