//! Agent 错误类型
//!
//! 任务路径上的所有错误都在状态机边界被捕获，转为终止的 TaskReport 与一条轨迹记录，不会让会话 worker 崩溃。

use thiserror::Error;

/// 编排核心可能出现的错误（规划、动作、校验、恢复、持久化）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// 规划协作者失败或超时：任务直接失败，不执行任何动作
    #[error("Planning unavailable: {0}")]
    PlanningUnavailable(String),

    /// 动作在产出结果前抛错：该步记为 FAILED，进入恢复
    #[error("Action '{action}' failed: {reason}")]
    ActionInvocation { action: String, reason: String },

    /// 观察结果不确定：UNVERIFIED，非致命，必须告知调用方
    #[error("Verification ambiguous: {0}")]
    VerificationAmbiguous(String),

    /// 恢复预算耗尽
    #[error("Recovery exhausted after {retries} retries")]
    RecoveryExhausted { retries: u32 },

    /// 恢复规划器没有给出任何替代动作
    #[error("No recovery available: {0}")]
    NoRecovery(String),

    /// 权限策略拒绝该动作：该步记为 FAILED，进入恢复
    #[error("Permission denied for action '{0}'")]
    PermissionDenied(String),

    /// ASK 级别的动作未获审批：任务终止
    #[error("Action '{0}' requires approval")]
    ApprovalRequired(String),

    /// 任务存储不可读 / 条目损坏
    #[error("Schedule persistence error: {0}")]
    SchedulePersistence(String),

    /// 动作名未注册或参数不符合 schema
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Storage(format!("serialization: {e}"))
    }
}
