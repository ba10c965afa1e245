//! 动作注册表
//!
//! 所有动作实现 Action trait（名称 / 描述 / 是否改变状态 / 校验策略 / invoke / observe），
//! 由 ActionRegistry 按名注册与查找；执行器在调用前用注册表校验 ActionCall。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::actions::ActionCall;
use crate::core::AgentError;

/// 动作声明的校验策略，由 Verification Gate 解释
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationStrategy {
    /// 只读 / 查询类动作
    None,
    /// 执行后观察屏幕区域
    ObserveRegion {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
    /// 退出码为 0 且输出满足 success_pattern（正则）
    CommandExitCode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success_pattern: Option<String>,
    },
    /// 动作自带的观察谓词
    CustomPredicate { description: String },
}

impl VerificationStrategy {
    /// 是否需要调用 observe
    pub fn needs_observation(&self) -> bool {
        matches!(
            self,
            VerificationStrategy::ObserveRegion { .. } | VerificationStrategy::CustomPredicate { .. }
        )
    }
}

/// 动作上报的原始结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutcome {
    /// 命令类动作的退出码；非命令动作为 None
    pub exit_code: Option<i32>,
    pub output: String,
}

impl RawOutcome {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            output: output.into(),
        }
    }

    pub fn exited(code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            output: output.into(),
        }
    }
}

/// 执行后的观察结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// 观察到了预期效果
    Confirmed(String),
    /// 观察到与预期相反的状态
    Contradicted(String),
    /// 没有结论（没有观察器、截图失败等）
    Inconclusive(String),
}

/// 动作 trait：副作用完全由实现负责；编排核心只关心声明的效果与校验钩子
#[async_trait]
pub trait Action: Send + Sync {
    /// 动作名（与 ActionCall::name 一致）
    fn name(&self) -> &str;

    /// 动作描述（供规划器理解功能）
    fn description(&self) -> &str;

    /// 是否改变外部状态
    fn state_changing(&self) -> bool;

    fn verification(&self) -> VerificationStrategy;

    /// 执行动作；Err 表示动作在产生结果前就失败了
    async fn invoke(&self, call: &ActionCall) -> Result<RawOutcome, String>;

    /// 执行后的观察；默认没有观察能力
    async fn observe(&self, _call: &ActionCall, _outcome: &RawOutcome) -> Observation {
        Observation::Inconclusive("no observer configured".to_string())
    }
}

/// 规划请求中的动作目录条目
#[derive(Debug, Clone, Serialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    pub state_changing: bool,
    pub verification: VerificationStrategy,
}

/// 动作注册表：按名称存储 Arc<dyn Action>
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: impl Action + 'static) {
        self.register_arc(Arc::new(action));
    }

    pub fn register_arc(&mut self, action: Arc<dyn Action>) {
        let name = action.name().to_string();
        if self.actions.insert(name.clone(), action).is_some() {
            tracing::warn!(action = %name, "action re-registered, previous implementation replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// 调用前校验：动作必须已注册
    pub fn resolve(&self, call: &ActionCall) -> Result<Arc<dyn Action>, AgentError> {
        self.get(call.name()).ok_or_else(|| {
            AgentError::InvalidAction(format!("action '{}' is not registered", call.name()))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按名称排序的动作目录，用于规划请求
    pub fn catalog(&self) -> Vec<ActionDescriptor> {
        let mut catalog: Vec<ActionDescriptor> = self
            .actions
            .values()
            .map(|a| ActionDescriptor {
                name: a.name().to_string(),
                description: a.description().to_string(),
                state_changing: a.state_changing(),
                verification: a.verification(),
            })
            .collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
