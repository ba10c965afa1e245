//! Recovery Planner：步骤失败时给出 0..K 个替代动作
//!
//! 瞬时错误（超时、网络、限流等）先原样重试一次；其余情况交给规划器 replan。
//! 已经失败两次的同一调用（动作 + 参数完全相同）会被剔除，避免无限循环。
//! 全局重试预算由执行器负责。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::actions::{ActionCall, ActionDescriptor};
use crate::core::{AgentError, Step, StepOutcome};
use crate::planner::{Planner, RecoveryRequest};

/// 同一调用最多失败次数，达到后不再被提议
const MAX_IDENTICAL_FAILURES: usize = 2;

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "rate limit",
    "temporarily unavailable",
    "econnreset",
    "reset by peer",
];

/// 错误描述是否像是瞬时故障
pub fn is_transient(error: &str) -> bool {
    let lower = error.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// 一次恢复请求的上下文
pub struct RecoveryContext<'a> {
    pub goal: &'a str,
    pub failed: &'a Step,
    /// 本任务到目前为止的全部步骤（含 failed）
    pub history: &'a [Step],
    pub catalog: &'a [ActionDescriptor],
}

pub struct RecoveryPlanner {
    planner: Arc<dyn Planner>,
    max_replacements: usize,
    replan_timeout: Duration,
}

impl RecoveryPlanner {
    pub fn new(planner: Arc<dyn Planner>, max_replacements: usize, replan_timeout: Duration) -> Self {
        Self {
            planner,
            max_replacements,
            replan_timeout,
        }
    }

    /// 给出替代动作；空列表表示无可用恢复。只有取消会返回 Err
    pub async fn propose(
        &self,
        ctx: RecoveryContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ActionCall>, AgentError> {
        let error = ctx.failed.evidence.as_str();

        if is_transient(error) {
            let retry = self.break_loops(vec![ctx.failed.call.clone()], ctx.history);
            if !retry.is_empty() {
                tracing::info!(action = %ctx.failed.call.name(), "transient failure, retrying once");
                return Ok(retry);
            }
        }

        let request = RecoveryRequest {
            goal: ctx.goal.to_string(),
            failed: ctx.failed.call.clone(),
            error: error.to_string(),
            history: ctx
                .history
                .iter()
                .map(|s| format!("{} [{}] {}", s.call.describe(), s.outcome, s.evidence))
                .collect(),
            catalog: ctx.catalog.to_vec(),
            max_actions: self.max_replacements,
        };

        let proposed = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = tokio::time::timeout(self.replan_timeout, self.planner.replan(&request)) => match r {
                Ok(Ok(calls)) => calls,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "replan failed, no recovery");
                    return Ok(Vec::new());
                }
                Err(_) => {
                    tracing::warn!(timeout_secs = self.replan_timeout.as_secs(), "replan timed out, no recovery");
                    return Ok(Vec::new());
                }
            }
        };

        let mut replacements = self.break_loops(proposed, ctx.history);
        replacements.truncate(self.max_replacements);
        tracing::info!(count = replacements.len(), "recovery proposed");
        Ok(replacements)
    }

    /// 剔除已经失败 MAX_IDENTICAL_FAILURES 次的调用
    fn break_loops(&self, proposed: Vec<ActionCall>, history: &[Step]) -> Vec<ActionCall> {
        proposed
            .into_iter()
            .filter(|call| {
                let failures = history
                    .iter()
                    .filter(|s| s.outcome == StepOutcome::Failed && s.call == *call)
                    .count();
                if failures >= MAX_IDENTICAL_FAILURES {
                    tracing::warn!(call = %call.describe(), failures, "dropping repeated failing call");
                    false
                } else {
                    true
                }
            })
            .collect()
    }
}
