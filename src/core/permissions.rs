//! 动作权限：执行前按动作名判定 allow / deny / ask，可选 LLM 审查
//!
//! - Deny：该步直接记为 FAILED，证据为拒绝原因，之后照常进入恢复
//! - Ask：交给 Approver；没有审批者或审批未通过时任务终止
//! - 守卫（Guardrail）只审查改变状态的动作，只读动作跳过

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::actions::ActionCall;
use crate::config::{PermissionLevel, PermissionsSection};
use crate::llm::{LlmClient, Message};

/// 动作名 → 权限级别
#[derive(Debug, Clone, Default)]
pub struct PermissionPolicy {
    default: PermissionLevel,
    rules: HashMap<String, PermissionLevel>,
}

impl PermissionPolicy {
    pub fn new(default: PermissionLevel) -> Self {
        Self {
            default,
            rules: HashMap::new(),
        }
    }

    pub fn from_config(section: &PermissionsSection) -> Self {
        Self {
            default: section.default,
            rules: section.rules.clone(),
        }
    }

    pub fn with_rule(mut self, action: impl Into<String>, level: PermissionLevel) -> Self {
        self.rules.insert(action.into(), level);
        self
    }

    pub fn level_for(&self, action: &str) -> PermissionLevel {
        self.rules.get(action).copied().unwrap_or(self.default)
    }
}

/// ASK 级别动作的审批者（交互界面、聊天确认等）
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, task_id: &str, call: &ActionCall) -> bool;
}

/// 执行前的安全审查；Err 为拒绝原因
#[async_trait]
pub trait Guardrail: Send + Sync {
    async fn review(&self, goal: &str, call: &ActionCall) -> Result<(), String>;
}

const GUARDRAIL_INSTRUCTIONS: &str = "You are the safety reviewer of a desktop automation agent. \
Decide whether the action below is safe and consistent with the user's goal. \
Answer APPROVE or REJECT on the first line, followed by a short reason.";

/// 用 LLM 回答 APPROVE / REJECT 的守卫；LLM 不可用时拒绝
pub struct LlmGuardrail {
    llm: Arc<dyn LlmClient>,
}

impl LlmGuardrail {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Guardrail for LlmGuardrail {
    async fn review(&self, goal: &str, call: &ActionCall) -> Result<(), String> {
        let messages = [
            Message::system(GUARDRAIL_INSTRUCTIONS),
            Message::user(format!(
                "Goal: {goal}\nAction: {}\nParams: {}",
                call.name(),
                call.params()
            )),
        ];
        let answer = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| format!("guardrail unavailable: {e}"))?;
        parse_verdict(&answer)
    }
}

fn parse_verdict(answer: &str) -> Result<(), String> {
    let upper = answer.trim().to_uppercase();
    if upper.starts_with("APPROVE") {
        Ok(())
    } else if upper.starts_with("REJECT") {
        let reason = answer
            .trim()
            .get(6..)
            .unwrap_or("")
            .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
            .trim();
        Err(if reason.is_empty() {
            "rejected".to_string()
        } else {
            reason.to_string()
        })
    } else {
        Err(format!("unrecognised guardrail answer: {}", answer.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(&'static str);

    #[async_trait]
    impl LlmClient for Canned {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_rules_override_default() {
        let policy = PermissionPolicy::new(PermissionLevel::Deny)
            .with_rule("file_read", PermissionLevel::Allow)
            .with_rule("file_write", PermissionLevel::Ask);
        assert_eq!(policy.level_for("file_read"), PermissionLevel::Allow);
        assert_eq!(policy.level_for("file_write"), PermissionLevel::Ask);
        assert_eq!(policy.level_for("shell_command"), PermissionLevel::Deny);
        assert_eq!(PermissionPolicy::default().level_for("anything"), PermissionLevel::Allow);
    }

    #[test]
    fn test_parse_verdict() {
        assert!(parse_verdict("APPROVE\nlooks fine").is_ok());
        assert!(parse_verdict("approve").is_ok());
        assert_eq!(
            parse_verdict("REJECT: deletes user data").unwrap_err(),
            "deletes user data"
        );
        assert!(parse_verdict("maybe").unwrap_err().contains("unrecognised"));
    }

    #[tokio::test]
    async fn test_llm_guardrail() {
        let call = ActionCall::TypeText {
            text: "rm -rf /".into(),
        };
        let reject = LlmGuardrail::new(Arc::new(Canned("REJECT destructive command")));
        assert_eq!(
            reject.review("clean up", &call).await.unwrap_err(),
            "destructive command"
        );
        let approve = LlmGuardrail::new(Arc::new(Canned("APPROVE")));
        assert!(approve.review("clean up", &call).await.is_ok());
    }
}
