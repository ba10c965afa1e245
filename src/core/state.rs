//! 任务阶段与合法迁移
//!
//! Created → {RoutineLookup | Planning} → Executing → {Done | Recovering → Executing} → Terminated。
//! 任何未终止阶段都可以直接进入 Terminated(Cancelled / Failed)（取消与错误边界）。

use serde::Serialize;

/// 任务终态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl TerminalStatus {
    /// 对应的终止轨迹事件名
    pub fn trace_event(self) -> &'static str {
        match self {
            TerminalStatus::Succeeded => "task_done",
            TerminalStatus::Failed => "task_failed",
            TerminalStatus::Cancelled => "task_cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Created,
    RoutineLookup,
    Planning,
    Executing,
    Recovering,
    Done,
    Terminated(TerminalStatus),
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Terminated(_))
    }

    pub fn can_transition_to(&self, next: TaskPhase) -> bool {
        use TaskPhase::*;
        match (*self, next) {
            (Terminated(_), _) => false,
            (Done, Terminated(TerminalStatus::Succeeded)) => true,
            (Done, _) => false,
            (_, Terminated(TerminalStatus::Cancelled | TerminalStatus::Failed)) => true,
            (Created, RoutineLookup | Planning) => true,
            (RoutineLookup, Executing | Planning) => true,
            (Planning, Executing | Done) => true,
            (Executing, Done | Recovering) => true,
            (Recovering, Executing) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Created => write!(f, "created"),
            TaskPhase::RoutineLookup => write!(f, "routine_lookup"),
            TaskPhase::Planning => write!(f, "planning"),
            TaskPhase::Executing => write!(f, "executing"),
            TaskPhase::Recovering => write!(f, "recovering"),
            TaskPhase::Done => write!(f, "done"),
            TaskPhase::Terminated(s) => write!(f, "terminated({})", s.trace_event()),
        }
    }
}
