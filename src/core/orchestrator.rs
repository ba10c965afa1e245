//! Agent 编排器：运行时装配与主控循环
//!
//! 负责：加载配置、创建 LLM / 规划器 / 动作注册表 / 肌肉记忆 / 轨迹 / 会话 worker / 调度器，
//! 建立命令与事件两条通道，并在后台任务中消费命令（Submit / Stop / Schedule / Heartbeat / Jobs / Cancel / Quit）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::actions::{
    ActionRegistry, ChatAction, FileReadAction, FileWriteAction, ShellAction, WaitAction,
};
use crate::config::{load_config, AppConfig};
use crate::core::{
    ExecutorSettings, Goal, LlmGuardrail, PermissionPolicy, SessionId, SessionManager,
    SessionSupervisor, TaskReport, TaskStateMachine, TaskSubmitter,
};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::SqliteRoutineStore;
use crate::planner::{LlmPlanner, Planner};
use crate::scheduler::{JobNotification, JobScheduler, JobStore, Trigger};
use crate::trace::TraceLog;

/// 从传输层（CLI / 聊天）发往编排器的命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 提交一个目标，在会话中排队执行
    Submit { session: SessionId, goal: Goal },
    /// 取消会话中进行中的任务，并丢弃排队的目标
    Stop { session: SessionId },
    /// 创建定时任务
    Schedule {
        session: SessionId,
        trigger: Trigger,
        goal: String,
    },
    /// 开启（Some）或关闭（None）会话的心跳
    Heartbeat {
        session: SessionId,
        every_minutes: Option<u32>,
    },
    ListJobs { session: SessionId },
    CancelJob { session: SessionId, job_id: String },
    /// 关闭运行时
    Quit,
}

/// 编排器发往传输层的事件
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// 命令的即时回复（已排程、任务列表等）
    Reply { session: SessionId, text: String },
    /// 会话中的任务结束
    TaskFinished { session: SessionId, report: TaskReport },
    /// 定时任务触发的执行结束
    JobFinished(JobNotification),
    /// chat 动作发出的消息
    Chat(String),
}

/// create_agent 的返回：命令发送端与事件接收端
pub struct AgentHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
}

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub(crate) fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai = std::env::var("OPENAI_API_KEY").is_ok();

    match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        "deepseek" if has_deepseek || has_openai => {
            tracing::info!("Using DeepSeek LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::deepseek(Some(&cfg.llm.model)))
        }
        _ if has_openai => {
            tracing::info!("Using OpenAI LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            ))
        }
        _ => {
            tracing::warn!("No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

/// 内置动作：shell / 文件读写 / wait / chat（桌面与浏览器动作由外部注册）
pub fn default_registry(cfg: &AppConfig, chat_outbox: mpsc::UnboundedSender<String>) -> ActionRegistry {
    let workspace = cfg.actions.workspace_root.clone().unwrap_or_else(|| {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("workspace")
    });
    if let Err(e) = std::fs::create_dir_all(&workspace) {
        tracing::warn!(path = %workspace.display(), error = %e, "cannot create workspace");
    }

    let mut registry = ActionRegistry::new();
    registry.register(
        ShellAction::new(cfg.actions.shell_allowed_commands.clone()).with_default_cwd(&workspace),
    );
    registry.register(FileReadAction::new(&workspace));
    registry.register(FileWriteAction::new(&workspace));
    registry.register(WaitAction);
    registry.register(ChatAction::with_outbox(chat_outbox));
    registry
}

/// 创建 Agent 运行时：加载配置后按默认动作与 LLM 规划器装配
pub async fn create_agent(config_path: Option<PathBuf>) -> anyhow::Result<AgentHandle> {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let (chat_tx, chat_rx) = mpsc::unbounded_channel();
    let registry = default_registry(&cfg, chat_tx);
    let planner: Arc<dyn Planner> = Arc::new(LlmPlanner::new(create_llm_from_config(&cfg)));
    create_agent_with(cfg, registry, planner, Some(chat_rx)).await
}

/// 用给定的动作注册表与规划器装配运行时（外部动作、测试用的脚本化规划器）
pub async fn create_agent_with(
    cfg: AppConfig,
    registry: ActionRegistry,
    planner: Arc<dyn Planner>,
    chat_rx: Option<mpsc::UnboundedReceiver<String>>,
) -> anyhow::Result<AgentHandle> {
    let memory = Arc::new(
        SqliteRoutineStore::open(cfg.app.database_path()).context("Failed to open routine store")?,
    );
    let traces = TraceLog::new(cfg.app.trace_dir()).context("Failed to open trace directory")?;
    let mut machine = TaskStateMachine::new(
        registry,
        planner,
        memory,
        traces,
        ExecutorSettings::from_config(&cfg),
    )
    .with_permissions(PermissionPolicy::from_config(&cfg.permissions));
    if cfg.permissions.guardrail {
        machine = machine.with_guardrail(Arc::new(LlmGuardrail::new(create_llm_from_config(&cfg))));
    }
    let executor = Arc::new(machine);

    let supervisor = Arc::new(SessionSupervisor::new());
    let sessions = Arc::new(SessionManager::new(executor, supervisor.clone()));

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<JobNotification>();
    let job_store = JobStore::open(cfg.app.database_path()).context("Failed to open job store")?;
    let scheduler = Arc::new(
        JobScheduler::new(job_store, sessions.clone(), notify_tx, &cfg.scheduler)
            .context("Failed to create scheduler")?,
    );
    scheduler
        .restore(chrono::Utc::now())
        .await
        .context("Failed to restore scheduled jobs")?;
    tokio::spawn(scheduler.clone().run(supervisor.cancel_token()));

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<AgentEvent>();
    let mut chat_rx = chat_rx;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    if matches!(cmd, Command::Quit) {
                        supervisor.shutdown();
                        break;
                    }
                    handle_command(cmd, &sessions, &scheduler, &event_tx).await;
                }
                Some(n) = notify_rx.recv() => {
                    let _ = event_tx.send(AgentEvent::JobFinished(n));
                }
                Some(text) = recv_chat(&mut chat_rx) => {
                    let _ = event_tx.send(AgentEvent::Chat(text));
                }
                else => break,
            }
        }
        tracing::info!("orchestrator loop stopped");
    });

    Ok(AgentHandle {
        commands: cmd_tx,
        events: event_rx,
    })
}

async fn recv_chat(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

async fn handle_command(
    cmd: Command,
    sessions: &Arc<SessionManager>,
    scheduler: &Arc<JobScheduler>,
    events: &mpsc::UnboundedSender<AgentEvent>,
) {
    let reply = |session: SessionId, text: String| {
        let _ = events.send(AgentEvent::Reply { session, text });
    };

    match cmd {
        Command::Submit { session, goal } => {
            let report = sessions.submit(&session, goal, CancellationToken::new());
            let events = events.clone();
            tokio::spawn(async move {
                if let Ok(report) = report.await {
                    let _ = events.send(AgentEvent::TaskFinished { session, report });
                }
            });
        }
        Command::Stop { session } => {
            let text = if sessions.stop(&session) {
                "Stopped the running task.".to_string()
            } else {
                "Nothing running.".to_string()
            };
            reply(session, text);
        }
        Command::Schedule {
            session,
            trigger,
            goal,
        } => {
            let described = trigger.describe(scheduler.offset());
            let text = match scheduler.schedule(session.clone(), trigger, goal).await {
                Ok(id) => format!("Scheduled {}. Job id: {}", described, id),
                Err(e) => format!("Could not schedule: {}", e),
            };
            reply(session, text);
        }
        Command::Heartbeat {
            session,
            every_minutes,
        } => {
            let text = match scheduler.set_heartbeat(&session, every_minutes).await {
                Ok(Some(_)) => format!("Heartbeat enabled every {} min.", every_minutes.unwrap_or(0)),
                Ok(None) => "Heartbeat disabled.".to_string(),
                Err(e) => format!("Could not set heartbeat: {}", e),
            };
            reply(session, text);
        }
        Command::ListJobs { session } => {
            let jobs = scheduler.list(&session).await;
            let text = if jobs.is_empty() {
                "No active jobs.".to_string()
            } else {
                let lines: Vec<String> = jobs
                    .iter()
                    .map(|j| {
                        format!(
                            "- {} [{}] next: {} : {}",
                            j.id,
                            j.trigger.describe(scheduler.offset()),
                            scheduler.format_next_fire(j),
                            j.goal
                        )
                    })
                    .collect();
                format!("Jobs:\n{}", lines.join("\n"))
            };
            reply(session, text);
        }
        Command::CancelJob { session, job_id } => {
            let text = match scheduler.owner_of(&job_id).await {
                None => "Job not found.".to_string(),
                Some(owner) if owner != session => "Not your job.".to_string(),
                Some(_) => match scheduler.cancel(&job_id).await {
                    Ok(true) => format!("Cancelled {}", job_id),
                    Ok(false) => "Job not found.".to_string(),
                    Err(e) => format!("Could not cancel: {}", e),
                },
            };
            reply(session, text);
        }
        Command::Quit => {}
    }
}
