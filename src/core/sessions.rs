//! 会话 worker：每个会话一个 tokio 任务，按 FIFO 顺序逐个执行目标
//!
//! 不同会话并发执行；同一会话同一时间只有一个任务在跑，新目标排队。
//! stop(session) 取消进行中的任务，并让已排队的目标以 Cancelled 结束。
//! 每个提交另带一个取消令牌（调度器的单个任务取消），只影响该目标本身。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::{Goal, SessionId, SessionSupervisor, TaskReport, TaskStateMachine};

/// 目标提交入口（调度器通过它把到期任务交给会话）
///
/// cancel 被取消时：目标尚未开始则以 Cancelled 结束，正在执行则中止。
pub trait TaskSubmitter: Send + Sync {
    fn submit(
        &self,
        session: &SessionId,
        goal: Goal,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<TaskReport>;
}

struct Submission {
    goal: Goal,
    generation: u64,
    cancel: CancellationToken,
    reply: oneshot::Sender<TaskReport>,
}

#[derive(Default)]
struct SessionState {
    /// stop 时递增；代数落后的排队目标不再执行
    generation: u64,
    current: Option<CancellationToken>,
}

struct SessionHandle {
    queue: mpsc::UnboundedSender<Submission>,
    state: Arc<Mutex<SessionState>>,
}

pub struct SessionManager {
    executor: Arc<TaskStateMachine>,
    supervisor: Arc<SessionSupervisor>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionManager {
    pub fn new(executor: Arc<TaskStateMachine>, supervisor: Arc<SessionSupervisor>) -> Self {
        Self {
            executor,
            supervisor,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn executor(&self) -> &Arc<TaskStateMachine> {
        &self.executor
    }

    /// 取消会话中进行中的任务并丢弃排队目标；返回是否有任务被取消
    pub fn stop(&self, session: &SessionId) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = sessions.get(session) else {
            return false;
        };
        let mut state = handle.state.lock().unwrap_or_else(|e| e.into_inner());
        state.generation += 1;
        match state.current.take() {
            Some(token) => {
                token.cancel();
                tracing::info!(session = %session, "in-flight task cancelled");
                true
            }
            None => false,
        }
    }

    /// 当前是否有任务在执行
    pub fn is_busy(&self, session: &SessionId) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(session).is_some_and(|h| {
            h.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .current
                .is_some()
        })
    }

    fn spawn_worker(&self, session: &SessionId) -> SessionHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Submission>();
        let state = Arc::new(Mutex::new(SessionState::default()));
        let executor = self.executor.clone();
        let supervisor = self.supervisor.clone();
        let worker_state = state.clone();
        let session_id = session.clone();

        tokio::spawn(async move {
            tracing::debug!(session = %session_id, "session worker started");
            while let Some(sub) = rx.recv().await {
                let token = {
                    let mut st = worker_state.lock().unwrap_or_else(|e| e.into_inner());
                    if sub.generation != st.generation
                        || supervisor.is_shutdown()
                        || sub.cancel.is_cancelled()
                    {
                        None
                    } else {
                        let token = supervisor.child_token();
                        st.current = Some(token.clone());
                        Some(token)
                    }
                };
                let report = match token {
                    Some(token) => {
                        let run = executor.run(sub.goal, token.clone());
                        tokio::pin!(run);
                        let report = tokio::select! {
                            report = &mut run => report,
                            _ = sub.cancel.cancelled() => {
                                token.cancel();
                                (&mut run).await
                            }
                        };
                        worker_state
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .current = None;
                        report
                    }
                    None => TaskReport::cancelled_before_start(&sub.goal),
                };
                if sub.reply.send(report).is_err() {
                    tracing::debug!(session = %session_id, "report receiver dropped");
                }
            }
            tracing::debug!(session = %session_id, "session worker stopped");
        });

        SessionHandle { queue: tx, state }
    }
}

impl TaskSubmitter for SessionManager {
    fn submit(
        &self,
        session: &SessionId,
        goal: Goal,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<TaskReport> {
        let (reply, rx) = oneshot::channel();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let handle = sessions
            .entry(session.clone())
            .or_insert_with(|| self.spawn_worker(session));
        let generation = handle
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .generation;
        let submission = Submission {
            goal,
            generation,
            cancel,
            reply,
        };
        if let Err(mpsc::error::SendError(sub)) = handle.queue.send(submission) {
            tracing::warn!(session = %session, "session worker gone, goal dropped");
            let _ = sub.reply.send(TaskReport::cancelled_before_start(&sub.goal));
        }
        rx
    }
}
