//! 目标、任务、步骤与面向调用方的 TaskReport

use serde::{Deserialize, Serialize};

use crate::actions::ActionCall;
use crate::core::{TaskPhase, TerminalStatus};

/// 会话标识：聊天频道 / CLI / 定时任务所属用户
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 目标来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GoalOrigin {
    Chat { channel: String },
    Cli,
    ScheduledJob { job_id: String },
}

/// 用户（或定时任务）提出的目标，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub text: String,
    pub origin: GoalOrigin,
}

impl Goal {
    pub fn new(text: impl Into<String>, origin: GoalOrigin) -> Self {
        Self {
            text: text.into(),
            origin,
        }
    }

    pub fn cli(text: impl Into<String>) -> Self {
        Self::new(text, GoalOrigin::Cli)
    }
}

/// 步骤校验结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Pending,
    Confirmed,
    Unverified,
    Failed,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepOutcome::Pending => "pending",
            StepOutcome::Confirmed => "confirmed",
            StepOutcome::Unverified => "not verified",
            StepOutcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 已执行的一步
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub index: usize,
    pub call: ActionCall,
    pub state_changing: bool,
    pub outcome: StepOutcome,
    pub evidence: String,
    /// 由恢复规划器插入
    pub recovery: bool,
    pub duration_ms: u64,
}

/// 单次执行中的任务，归状态机所有
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub goal: Goal,
    pub phase: TaskPhase,
    pub steps: Vec<Step>,
    pub retry_count: u32,
    pub from_routine: bool,
    pub fingerprint: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn new(goal: Goal) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            goal,
            phase: TaskPhase::Created,
            steps: Vec::new(),
            retry_count: 0,
            from_routine: false,
            fingerprint: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            completed_at: None,
        }
    }

    /// 迁移到下一阶段；非法迁移在 debug 构建下直接 panic，release 下记录错误并照常迁移
    pub fn advance(&mut self, next: TaskPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::error!(task_id = %self.id, from = %self.phase, to = %next, "illegal task transition");
            debug_assert!(false, "illegal task transition {} -> {}", self.phase, next);
        }
        tracing::debug!(task_id = %self.id, from = %self.phase, to = %next, "phase");
        self.phase = next;
    }
}

/// 返回给调用方（聊天回复 / 定时任务通知）的结果
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub goal: String,
    pub status: TerminalStatus,
    pub steps: Vec<Step>,
    pub retries: u32,
    pub from_routine: bool,
    pub reason: Option<String>,
    /// 改变了状态却未能确认的步骤描述
    pub unverified: Vec<String>,
}

impl TaskReport {
    pub fn from_task(task: &Task, status: TerminalStatus, reason: Option<String>) -> Self {
        let unverified = task
            .steps
            .iter()
            .filter(|s| s.state_changing && s.outcome == StepOutcome::Unverified)
            .map(|s| s.call.describe())
            .collect();
        Self {
            task_id: task.id.clone(),
            goal: task.goal.text.clone(),
            status,
            steps: task.steps.clone(),
            retries: task.retry_count,
            from_routine: task.from_routine,
            reason,
            unverified,
        }
    }

    /// 尚未开始就被取消（会话 stop 时仍在排队的目标）
    pub fn cancelled_before_start(goal: &Goal) -> Self {
        let task = Task::new(goal.clone());
        Self::from_task(
            &task,
            TerminalStatus::Cancelled,
            Some("cancelled before it started".to_string()),
        )
    }

    pub fn succeeded(&self) -> bool {
        self.status == TerminalStatus::Succeeded
    }

    /// 人类可读摘要；只要有未确认的状态变更步骤就附带 "not verified" 提示
    pub fn render(&self) -> String {
        let mut out = String::new();
        match self.status {
            TerminalStatus::Succeeded => {
                out.push_str(&format!("Done: {}", self.goal));
                if self.from_routine {
                    out.push_str(" (from routine)");
                }
                out.push('\n');
                let ran: Vec<&Step> = self
                    .steps
                    .iter()
                    .filter(|s| s.outcome != StepOutcome::Failed)
                    .collect();
                if ran.is_empty() {
                    out.push_str("Nothing to do.\n");
                }
                for (i, step) in ran.iter().enumerate() {
                    out.push_str(&format!("{}. {} [{}]\n", i + 1, step.call.describe(), step.outcome));
                }
                if self.retries > 0 {
                    out.push_str(&format!("Recovered after {} retries.\n", self.retries));
                }
            }
            TerminalStatus::Failed => {
                out.push_str(&format!("Failed: {}\n", self.goal));
                if let Some(last) = self.steps.last() {
                    out.push_str(&format!(
                        "Last action: {} [{}] {}\n",
                        last.call.describe(),
                        last.outcome,
                        last.evidence
                    ));
                }
                if let Some(reason) = &self.reason {
                    out.push_str(&format!("Reason: {}\n", reason));
                }
            }
            TerminalStatus::Cancelled => {
                out.push_str(&format!("Cancelled: {}\n", self.goal));
                if let Some(reason) = &self.reason {
                    out.push_str(&format!("Reason: {}\n", reason));
                }
            }
        }
        if !self.unverified.is_empty() {
            out.push_str(&format!(
                "Warning: {} step(s) not verified: {}\n",
                self.unverified.len(),
                self.unverified.join(", ")
            ));
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(call: ActionCall, state_changing: bool, outcome: StepOutcome) -> Step {
        Step {
            index: 0,
            call,
            state_changing,
            outcome,
            evidence: String::new(),
            recovery: false,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_task_ids_are_prefixed_and_unique() {
        let a = Task::new(Goal::cli("x"));
        let b = Task::new(Goal::cli("x"));
        assert!(a.id.starts_with("task_"));
        assert_ne!(a.id, b.id);
        assert_eq!(a.phase, TaskPhase::Created);
    }

    #[test]
    fn test_render_flags_unverified_steps() {
        let mut task = Task::new(Goal::cli("open calculator"));
        task.steps.push(step(
            ActionCall::OpenApp {
                app: "calculator".into(),
            },
            true,
            StepOutcome::Unverified,
        ));
        let report = TaskReport::from_task(&task, TerminalStatus::Succeeded, None);
        assert_eq!(report.unverified.len(), 1);
        assert!(report.render().contains("not verified"));
    }

    #[test]
    fn test_render_failure_names_last_action() {
        let mut task = Task::new(Goal::cli("press ok"));
        let mut failed = step(
            ActionCall::ClickButton {
                x: 1,
                y: 2,
                label: None,
            },
            true,
            StepOutcome::Failed,
        );
        failed.evidence = "button not found".into();
        task.steps.push(failed);
        let text = TaskReport::from_task(&task, TerminalStatus::Failed, Some("no recovery".into())).render();
        assert!(text.contains("click_button"));
        assert!(text.contains("button not found"));
        assert!(text.contains("no recovery"));
        assert!(!text.contains("not verified"));
    }

    #[test]
    fn test_goal_origin_serde() {
        let origin = GoalOrigin::ScheduledJob {
            job_id: "job_1".into(),
        };
        let v = serde_json::to_value(&origin).unwrap();
        assert_eq!(v["kind"], "scheduled_job");
    }
}
