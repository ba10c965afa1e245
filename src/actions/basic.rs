//! 基础动作：wait（等待渲染）与 chat（向用户发消息），均为只读

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::actions::{Action, ActionCall, RawOutcome, VerificationStrategy};

/// 单次等待上限，防止规划器给出离谱的等待时间
const MAX_WAIT_MILLIS: u64 = 60_000;

/// Wait 动作：休眠指定毫秒
pub struct WaitAction;

#[async_trait]
impl Action for WaitAction {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "Pause so the UI can settle. Params: {\"millis\": 1000} (max 60000)"
    }

    fn state_changing(&self) -> bool {
        false
    }

    fn verification(&self) -> VerificationStrategy {
        VerificationStrategy::None
    }

    async fn invoke(&self, call: &ActionCall) -> Result<RawOutcome, String> {
        let ActionCall::Wait { millis } = call else {
            return Err(format!("wait cannot run {}", call.name()));
        };
        let millis = (*millis).min(MAX_WAIT_MILLIS);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(RawOutcome::output(format!("waited {millis}ms")))
    }
}

/// Chat 动作：把文本交给传输层；未接传输层时仅回显到结果
#[derive(Default)]
pub struct ChatAction {
    outbox: Option<mpsc::UnboundedSender<String>>,
}

impl ChatAction {
    pub fn with_outbox(outbox: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outbox: Some(outbox),
        }
    }
}

#[async_trait]
impl Action for ChatAction {
    fn name(&self) -> &str {
        "chat"
    }

    fn description(&self) -> &str {
        "Send a text message to the user. Params: {\"text\": \"message\"}"
    }

    fn state_changing(&self) -> bool {
        false
    }

    fn verification(&self) -> VerificationStrategy {
        VerificationStrategy::None
    }

    async fn invoke(&self, call: &ActionCall) -> Result<RawOutcome, String> {
        let ActionCall::Chat { text } = call else {
            return Err(format!("chat cannot run {}", call.name()));
        };
        if let Some(tx) = &self.outbox {
            tx.send(text.clone())
                .map_err(|_| "chat transport closed".to_string())?;
        }
        Ok(RawOutcome::output(text.clone()))
    }
}
