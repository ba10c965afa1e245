//! 基于 LLM 的规划器
//!
//! 拼 system prompt（动作目录 + JSON Schema）与用户目标，要求模型只输出 ActionCall 的 JSON 数组；
//! parse_plan 从 ```json 代码块或裸 JSON 中提取数组并逐项校验。

use std::sync::Arc;

use async_trait::async_trait;

use crate::actions::{ActionCall, ActionDescriptor};
use crate::llm::{LlmClient, Message};
use crate::planner::{PlanError, PlanRequest, Planner, RecoveryRequest};

const PLAN_INSTRUCTIONS: &str = "You are the planning module of a desktop automation agent. \
Turn the user's goal into an ordered list of actions. \
Respond with ONLY a JSON array, each element shaped like {\"action\": \"<name>\", \"params\": {...}}. \
Use only the actions listed below. Return [] if nothing needs to be done.";

const REPLAN_INSTRUCTIONS: &str = "An action failed while executing the user's goal. \
Propose replacement actions that work around the failure. \
Respond with ONLY a JSON array of actions in the same format, at most the number requested. \
Return [] if there is no sensible alternative.";

/// 解析模型输出为动作列表；数组中任一项不合法即整体视为非法计划
pub fn parse_plan(output: &str) -> Result<Vec<ActionCall>, PlanError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        trimmed
    };

    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| PlanError::InvalidPlan(format!("{}: {}", e, json_str)))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        // 单个动作对象也接受
        obj @ serde_json::Value::Object(_) => vec![obj],
        other => {
            return Err(PlanError::InvalidPlan(format!("expected a JSON array, got {other}")))
        }
    };
    items
        .into_iter()
        .map(|item| ActionCall::from_value(item).map_err(PlanError::InvalidPlan))
        .collect()
}

fn render_catalog(catalog: &[ActionDescriptor]) -> String {
    catalog
        .iter()
        .map(|d| {
            format!(
                "- {}{}: {}",
                d.name,
                if d.state_changing { " (changes state)" } else { "" },
                d.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// LLM 规划器：持有 LLM 客户端，plan / replan 各自拼提示词后解析
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn ask(&self, messages: Vec<Message>) -> Result<Vec<ActionCall>, PlanError> {
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(PlanError::Unavailable)?;
        tracing::debug!(chars = output.len(), "planner output received");
        parse_plan(&output)
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Vec<ActionCall>, PlanError> {
        let system = format!(
            "{}\n\nAvailable actions:\n{}\n\nAction JSON schema:\n{}",
            PLAN_INSTRUCTIONS,
            render_catalog(&request.catalog),
            request.action_schema
        );
        let mut user = format!("Goal: {}", request.goal);
        if !request.trace_tail.is_empty() {
            user.push_str("\n\nRecent trace:");
            for ev in &request.trace_tail {
                user.push_str(&format!("\n- {} {}", ev.event, ev.data));
            }
        }
        self.ask(vec![Message::system(system), Message::user(user)]).await
    }

    async fn replan(&self, request: &RecoveryRequest) -> Result<Vec<ActionCall>, PlanError> {
        let system = format!(
            "{}\n\nAvailable actions:\n{}",
            REPLAN_INSTRUCTIONS,
            render_catalog(&request.catalog)
        );
        let user = format!(
            "Goal: {}\nFailed action: {}\nError: {}\nSteps so far:\n{}\nPropose at most {} actions.",
            request.goal,
            request.failed.describe(),
            request.error,
            request.history.join("\n"),
            request.max_actions
        );
        self.ask(vec![Message::system(system), Message::user(user)]).await
    }
}
