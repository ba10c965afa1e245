//! Task State Machine：Plan → Act → Verify → Recover
//!
//! 一个目标进入 run，出来的一定是终止的 TaskReport：规划失败、动作失败、恢复耗尽、取消
//! 都在这里转为报告与一条终止轨迹，不会把错误抛给会话 worker。
//! 每次动作调用输出一行 JSON 审计日志（event=action_audit）。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::actions::{action_call_schema_json, Action, ActionCall, ActionRegistry};
use crate::config::{AppConfig, PermissionLevel};
use crate::core::recovery::RecoveryContext;
use crate::core::{
    AgentError, Approver, Goal, Guardrail, PermissionPolicy, RecoveryPlanner, Step, StepOutcome,
    Task, TaskPhase, TaskReport, TerminalStatus, VerificationGate,
};
use crate::memory::{
    covers_all_params, materialize, templatize, Fingerprinter, LexicalFingerprinter, MuscleMemory,
};
use crate::planner::{PlanRequest, Planner};
use crate::trace::{TraceEvent, TraceLog, TraceWriter};

/// 执行器参数
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub retry_budget: u32,
    pub step_timeout: Duration,
    pub planning_timeout: Duration,
    pub trace_tail: usize,
    pub observe_timeout: Duration,
    pub max_replacements: usize,
    pub replan_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl ExecutorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            retry_budget: cfg.executor.retry_budget,
            step_timeout: Duration::from_secs(cfg.executor.step_timeout_secs),
            planning_timeout: Duration::from_secs(cfg.executor.planning_timeout_secs),
            trace_tail: cfg.executor.trace_tail,
            observe_timeout: Duration::from_secs(cfg.verification.observe_timeout_secs),
            max_replacements: cfg.recovery.max_replacements,
            replan_timeout: Duration::from_secs(cfg.recovery.replan_timeout_secs),
        }
    }
}

/// 轨迹写入失败只记日志，不影响任务
struct Recorder {
    writer: Option<TraceWriter>,
}

impl Recorder {
    fn open(traces: &TraceLog, task_id: &str) -> Self {
        match traces.open(task_id) {
            Ok(writer) => Self {
                writer: Some(writer),
            },
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "trace unavailable, running untraced");
                Self { writer: None }
            }
        }
    }

    fn emit(&mut self, event: &str, data: serde_json::Value) {
        if let Some(w) = self.writer.as_mut() {
            if let Err(e) = w.append(event, data) {
                tracing::warn!(task_id = %w.task_id(), event, error = %e, "trace append failed");
            }
        }
    }

    fn tail(&self, n: usize) -> Vec<TraceEvent> {
        self.writer.as_ref().map(|w| w.tail(n)).unwrap_or_default()
    }

    fn seal(self, event: &str, data: serde_json::Value) {
        if let Some(w) = self.writer {
            let task_id = w.task_id().to_string();
            if let Err(e) = w.seal(event, data) {
                tracing::warn!(task_id = %task_id, error = %e, "trace seal failed");
            }
        }
    }
}

/// 待执行队列中的一项
struct Queued {
    call: ActionCall,
    recovery: bool,
}

pub struct TaskStateMachine {
    registry: ActionRegistry,
    planner: Arc<dyn Planner>,
    memory: Arc<dyn MuscleMemory>,
    fingerprinter: Arc<dyn Fingerprinter>,
    traces: TraceLog,
    gate: VerificationGate,
    recovery: RecoveryPlanner,
    permissions: PermissionPolicy,
    approver: Option<Arc<dyn Approver>>,
    guardrail: Option<Arc<dyn Guardrail>>,
    settings: ExecutorSettings,
}

impl TaskStateMachine {
    pub fn new(
        registry: ActionRegistry,
        planner: Arc<dyn Planner>,
        memory: Arc<dyn MuscleMemory>,
        traces: TraceLog,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            gate: VerificationGate::new(settings.observe_timeout),
            recovery: RecoveryPlanner::new(
                planner.clone(),
                settings.max_replacements,
                settings.replan_timeout,
            ),
            registry,
            planner,
            memory,
            fingerprinter: Arc::new(LexicalFingerprinter),
            traces,
            permissions: PermissionPolicy::default(),
            approver: None,
            guardrail: None,
            settings,
        }
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionPolicy) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrail = Some(guardrail);
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn traces(&self) -> &TraceLog {
        &self.traces
    }

    /// 执行一个目标直到终止
    pub async fn run(&self, goal: Goal, cancel: CancellationToken) -> TaskReport {
        let mut task = Task::new(goal);
        let mut rec = Recorder::open(&self.traces, &task.id);
        rec.emit(
            "task_created",
            serde_json::json!({ "goal": task.goal.text, "origin": task.goal.origin }),
        );
        tracing::info!(task_id = %task.id, goal = %task.goal.text, "task started");

        let result = self.drive(&mut task, &mut rec, &cancel).await;
        self.finish(task, rec, result)
    }

    async fn drive(
        &self,
        task: &mut Task,
        rec: &mut Recorder,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let fp = self.fingerprinter.fingerprint(&task.goal.text);
        let mut queue: VecDeque<Queued> = VecDeque::new();

        if fp.is_cacheable() {
            task.advance(TaskPhase::RoutineLookup);
            task.fingerprint = Some(fp.key.clone());
            if let Some(calls) = self.lookup_routine(&fp.key, &fp.params, rec) {
                task.from_routine = true;
                queue.extend(calls.into_iter().map(|call| Queued {
                    call,
                    recovery: false,
                }));
            }
        }

        if !task.from_routine {
            task.advance(TaskPhase::Planning);
            let plan = self.plan(task, rec, cancel).await?;
            if plan.is_empty() {
                rec.emit("plan_empty", serde_json::json!({}));
                task.advance(TaskPhase::Done);
                return Ok(());
            }
            queue.extend(plan.into_iter().map(|call| Queued {
                call,
                recovery: false,
            }));
        }

        task.advance(TaskPhase::Executing);
        let mut invalidated = false;
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let Some(next) = queue.pop_front() else {
                task.advance(TaskPhase::Done);
                return Ok(());
            };
            let step = self.execute_step(task, next, rec, cancel).await?;

            if task.from_routine
                && !invalidated
                && step.state_changing
                && matches!(step.outcome, StepOutcome::Failed | StepOutcome::Unverified)
            {
                invalidated = true;
                self.invalidate_routine(task, rec);
            }

            match step.outcome {
                StepOutcome::Confirmed | StepOutcome::Pending => {}
                StepOutcome::Unverified => {
                    tracing::warn!(task_id = %task.id, action = %step.call.name(), "step not verified");
                }
                StepOutcome::Failed => {
                    task.advance(TaskPhase::Recovering);
                    if task.retry_count >= self.settings.retry_budget {
                        return Err(AgentError::RecoveryExhausted {
                            retries: task.retry_count,
                        });
                    }
                    let catalog = self.registry.catalog();
                    let replacements = self
                        .recovery
                        .propose(
                            RecoveryContext {
                                goal: &task.goal.text,
                                failed: &step,
                                history: &task.steps,
                                catalog: &catalog,
                            },
                            cancel,
                        )
                        .await?;
                    if replacements.is_empty() {
                        rec.emit("recovery_none", serde_json::json!({ "failed": step.call }));
                        return Err(AgentError::NoRecovery(format!(
                            "no alternative for {}",
                            step.call.describe()
                        )));
                    }
                    task.retry_count += 1;
                    rec.emit(
                        "recovery",
                        serde_json::json!({
                            "retry": task.retry_count,
                            "failed": step.call,
                            "replacements": replacements,
                        }),
                    );
                    for call in replacements.into_iter().rev() {
                        queue.push_front(Queued {
                            call,
                            recovery: true,
                        });
                    }
                    task.advance(TaskPhase::Executing);
                }
            }
        }
    }

    fn lookup_routine(
        &self,
        key: &str,
        params: &[String],
        rec: &mut Recorder,
    ) -> Option<Vec<ActionCall>> {
        let routine = match self.memory.lookup(key) {
            Ok(Some(r)) => r,
            Ok(None) => {
                rec.emit("routine_miss", serde_json::json!({ "fingerprint": key }));
                return None;
            }
            Err(e) => {
                tracing::warn!(fingerprint = %key, error = %e, "routine lookup failed, planning instead");
                return None;
            }
        };
        if !covers_all_params(&routine.steps, params.len()) {
            rec.emit(
                "routine_miss",
                serde_json::json!({ "fingerprint": key, "reason": "routine does not use every goal parameter" }),
            );
            return None;
        }
        match materialize(&routine.steps, params) {
            Ok(calls) => {
                rec.emit(
                    "routine_hit",
                    serde_json::json!({
                        "fingerprint": key,
                        "success_count": routine.success_count,
                        "steps": calls.len(),
                    }),
                );
                Some(calls)
            }
            Err(e) => {
                rec.emit(
                    "routine_miss",
                    serde_json::json!({ "fingerprint": key, "reason": e }),
                );
                None
            }
        }
    }

    fn invalidate_routine(&self, task: &Task, rec: &mut Recorder) {
        let Some(key) = task.fingerprint.as_deref() else {
            return;
        };
        match self.memory.invalidate(key) {
            Ok(removed) => rec.emit(
                "routine_invalidated",
                serde_json::json!({ "fingerprint": key, "removed": removed }),
            ),
            Err(e) => tracing::warn!(fingerprint = %key, error = %e, "routine invalidation failed"),
        }
    }

    async fn plan(
        &self,
        task: &Task,
        rec: &mut Recorder,
        cancel: &CancellationToken,
    ) -> Result<Vec<ActionCall>, AgentError> {
        rec.emit("planning", serde_json::json!({}));
        let request = PlanRequest {
            goal: task.goal.text.clone(),
            trace_tail: rec.tail(self.settings.trace_tail),
            catalog: self.registry.catalog(),
            action_schema: action_call_schema_json(),
        };
        let plan = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = tokio::time::timeout(self.settings.planning_timeout, self.planner.plan(&request)) => match r {
                Ok(Ok(plan)) => plan,
                Ok(Err(e)) => return Err(AgentError::PlanningUnavailable(e.to_string())),
                Err(_) => {
                    return Err(AgentError::PlanningUnavailable(format!(
                        "planner timed out after {}s",
                        self.settings.planning_timeout.as_secs()
                    )))
                }
            }
        };
        rec.emit(
            "plan",
            serde_json::json!({ "steps": plan.iter().map(ActionCall::describe).collect::<Vec<_>>() }),
        );
        Ok(plan)
    }

    /// 校验、调用、判定一步，并记入 task.steps
    async fn execute_step(
        &self,
        task: &mut Task,
        queued: Queued,
        rec: &mut Recorder,
        cancel: &CancellationToken,
    ) -> Result<Step, AgentError> {
        let index = task.steps.len();
        let call = queued.call;
        rec.emit(
            "step_started",
            serde_json::json!({
                "index": index,
                "action": call.name(),
                "params": call.params(),
                "recovery": queued.recovery,
            }),
        );
        let start = Instant::now();

        let (state_changing, verdict) = match self.registry.resolve(&call) {
            Err(e) => (
                false,
                crate::core::Verdict {
                    outcome: StepOutcome::Failed,
                    evidence: e.to_string(),
                },
            ),
            Ok(action) => match self.authorize(task, &call, action.as_ref(), rec, cancel).await? {
                Some(refusal) => (
                    action.state_changing(),
                    crate::core::Verdict {
                        outcome: StepOutcome::Failed,
                        evidence: refusal,
                    },
                ),
                None => {
                    let raw = tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        r = tokio::time::timeout(self.settings.step_timeout, action.invoke(&call)) => match r {
                            Ok(raw) => raw,
                            Err(_) => Err(format!(
                                "action timed out after {}s",
                                self.settings.step_timeout.as_secs()
                            )),
                        }
                    };
                    let outcome = match &raw {
                        Ok(_) => "ok",
                        Err(_) => "error",
                    };
                    let audit = serde_json::json!({
                        "event": "action_audit",
                        "task_id": task.id,
                        "action": call.name(),
                        "ok": raw.is_ok(),
                        "outcome": outcome,
                        "duration_ms": start.elapsed().as_millis() as u64,
                        "params_preview": params_preview(&call),
                    });
                    tracing::info!(audit = %audit.to_string(), "action");

                    let raw = raw.map_err(|reason| {
                        AgentError::ActionInvocation {
                            action: call.name().to_string(),
                            reason,
                        }
                        .to_string()
                    });
                    let verdict = self.gate.verify(action.as_ref(), &call, &raw, cancel).await?;
                    (action.state_changing(), verdict)
                }
            },
        };

        let step = Step {
            index,
            call,
            state_changing,
            outcome: verdict.outcome,
            evidence: verdict.evidence,
            recovery: queued.recovery,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        rec.emit(
            "step_finished",
            serde_json::json!({
                "index": index,
                "action": step.call.name(),
                "outcome": step.outcome,
                "evidence": step.evidence,
                "duration_ms": step.duration_ms,
            }),
        );
        task.steps.push(step.clone());
        Ok(step)
    }

    /// 调用前的权限与守卫检查；Some 为拒绝原因（该步失败），审批未通过则直接返回错误
    async fn authorize(
        &self,
        task: &Task,
        call: &ActionCall,
        action: &dyn Action,
        rec: &mut Recorder,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AgentError> {
        match self.permissions.level_for(call.name()) {
            PermissionLevel::Allow => {}
            PermissionLevel::Deny => {
                rec.emit("permission_denied", serde_json::json!({ "action": call.name() }));
                return Ok(Some(AgentError::PermissionDenied(call.name().to_string()).to_string()));
            }
            PermissionLevel::Ask => {
                let approved = match &self.approver {
                    Some(approver) => tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        ok = approver.approve(&task.id, call) => ok,
                    },
                    None => false,
                };
                rec.emit(
                    "approval",
                    serde_json::json!({ "action": call.name(), "approved": approved }),
                );
                if !approved {
                    return Err(AgentError::ApprovalRequired(call.name().to_string()));
                }
            }
        }

        if !action.state_changing() {
            return Ok(None);
        }
        let Some(guardrail) = &self.guardrail else {
            return Ok(None);
        };
        let review = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = guardrail.review(&task.goal.text, call) => r,
        };
        match review {
            Ok(()) => Ok(None),
            Err(reason) => {
                rec.emit(
                    "guardrail_rejected",
                    serde_json::json!({ "action": call.name(), "reason": reason }),
                );
                Ok(Some(format!("Rejected by guardrail: {reason}")))
            }
        }
    }

    fn finish(&self, mut task: Task, rec: Recorder, result: Result<(), AgentError>) -> TaskReport {
        let (status, reason) = match result {
            Ok(()) => (TerminalStatus::Succeeded, None),
            Err(AgentError::Cancelled) => (
                TerminalStatus::Cancelled,
                Some(AgentError::Cancelled.to_string()),
            ),
            Err(e) => (TerminalStatus::Failed, Some(e.to_string())),
        };
        task.advance(TaskPhase::Terminated(status));
        task.completed_at = Some(chrono::Utc::now().timestamp_millis());

        if status == TerminalStatus::Succeeded {
            self.remember(&task);
        }

        let report = TaskReport::from_task(&task, status, reason);
        rec.seal(
            status.trace_event(),
            serde_json::json!({
                "status": status,
                "retries": task.retry_count,
                "from_routine": task.from_routine,
                "reason": report.reason,
                "unverified": report.unverified,
            }),
        );
        tracing::info!(
            task_id = %task.id,
            status = ?status,
            retries = task.retry_count,
            from_routine = task.from_routine,
            "task finished"
        );
        report
    }

    /// 成功任务写入肌肉记忆：整个任务中每个改变状态的步骤都必须是 Confirmed（包括后来被恢复替换的失败步骤）
    fn remember(&self, task: &Task) {
        let Some(key) = task.fingerprint.as_deref() else {
            return;
        };
        if task
            .steps
            .iter()
            .any(|s| s.state_changing && s.outcome != StepOutcome::Confirmed)
        {
            tracing::info!(task_id = %task.id, "state change not confirmed, routine not cached");
            return;
        }
        let kept: Vec<&Step> = task
            .steps
            .iter()
            .filter(|s| s.outcome != StepOutcome::Failed)
            .collect();
        if kept.is_empty() {
            return;
        }
        let params = self.fingerprinter.fingerprint(&task.goal.text).params;
        let calls: Vec<ActionCall> = kept.iter().map(|s| s.call.clone()).collect();
        let templates = templatize(&calls, &params);
        if !covers_all_params(&templates, params.len()) {
            tracing::info!(task_id = %task.id, params = params.len(), "goal parameters not used by the actions, routine not cached");
            return;
        }
        if let Err(e) = self.memory.upsert(key, &task.goal.text, &templates) {
            tracing::warn!(task_id = %task.id, fingerprint = %key, error = %e, "routine upsert failed");
        }
    }
}

fn params_preview(call: &ActionCall) -> String {
    let s = call.params().to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
