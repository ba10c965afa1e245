//! 定时任务数据模型

use serde::{Deserialize, Serialize};

use crate::core::{SessionId, TaskReport};
use crate::scheduler::Trigger;

pub type JobId = String;

/// 心跳任务的默认目标
pub const HEARTBEAT_GOAL: &str = "Heartbeat check-in: reply with anything you want me to do.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Cancelled,
    /// 一次性任务触发之后
    Completed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(JobStatus::Active),
            "cancelled" => Some(JobStatus::Cancelled),
            "completed" => Some(JobStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub owner: SessionId,
    pub trigger: Trigger,
    pub goal: String,
    pub status: JobStatus,
    /// 下一次触发（毫秒时间戳）
    pub next_fire_at: i64,
    pub created_at: i64,
    pub last_fired_at: Option<i64>,
}

impl ScheduledJob {
    pub fn new(id: JobId, owner: SessionId, trigger: Trigger, goal: String, next_fire_at: i64) -> Self {
        Self {
            id,
            owner,
            trigger,
            goal,
            status: JobStatus::Active,
            next_fire_at,
            created_at: chrono::Utc::now().timestamp_millis(),
            last_fired_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }

    pub fn heartbeat_id(owner: &SessionId) -> JobId {
        format!("hb_{}", owner)
    }

    pub fn new_id() -> JobId {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("job_{}", &id[..8])
    }
}

/// 定时任务执行完成后发给所属会话的通知
#[derive(Debug, Clone)]
pub struct JobNotification {
    pub job_id: JobId,
    pub owner: SessionId,
    pub report: TaskReport,
}
