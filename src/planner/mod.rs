//! 规划协作者契约
//!
//! 编排核心不关心计划如何产生，只要求 plan / replan 返回有序的 ActionCall 列表。
//! LlmPlanner 是基于 LlmClient 的默认实现。

pub mod llm;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::actions::{ActionCall, ActionDescriptor};
use crate::trace::TraceEvent;

pub use llm::{parse_plan, LlmPlanner};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("planner backend unavailable: {0}")]
    Unavailable(String),
    #[error("planner returned an invalid plan: {0}")]
    InvalidPlan(String),
}

/// 首次规划请求
#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub goal: String,
    /// 当前任务最近的轨迹
    pub trace_tail: Vec<TraceEvent>,
    pub catalog: Vec<ActionDescriptor>,
    /// ActionCall 的 JSON Schema
    pub action_schema: String,
}

/// 恢复时的重规划请求
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRequest {
    pub goal: String,
    pub failed: ActionCall,
    pub error: String,
    /// 之前各步的一行摘要，如 `click_button({"x":1,"y":2}) [failed]`
    pub history: Vec<String>,
    pub catalog: Vec<ActionDescriptor>,
    pub max_actions: usize,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<Vec<ActionCall>, PlanError>;

    async fn replan(&self, request: &RecoveryRequest) -> Result<Vec<ActionCall>, PlanError>;
}
