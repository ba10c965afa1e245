//! Mock LLM 客户端（离线运行与测试，无需 API）
//!
//! 把最后一条 User 消息原样作为 chat 动作回给用户，便于本地跑通 Plan → Act → Verify 流程。

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.lines().next().unwrap_or_default())
            .unwrap_or("(no input)");

        let plan = serde_json::json!([
            {"action": "chat", "params": {"text": format!("Echo from Mock: {last_user}")}}
        ]);
        Ok(plan.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_returns_chat_plan() {
        let out = MockLlmClient
            .complete(&[Message::system("sys"), Message::user("Goal: hi")])
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v[0]["action"], "chat");
        assert!(v[0]["params"]["text"].as_str().unwrap().contains("Goal: hi"));
    }
}
