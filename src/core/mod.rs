//! 核心编排层：错误、任务状态机、校验、恢复、会话 worker、运行时装配

pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod permissions;
pub mod recovery;
pub mod session_supervisor;
pub mod sessions;
pub mod state;
pub mod task;
pub mod verification;

pub use error::AgentError;
pub use executor::{ExecutorSettings, TaskStateMachine};
pub use orchestrator::{
    create_agent, create_agent_with, default_registry, AgentEvent, AgentHandle, Command,
};
pub use permissions::{Approver, Guardrail, LlmGuardrail, PermissionPolicy};
pub use recovery::{is_transient, RecoveryContext, RecoveryPlanner};
pub use session_supervisor::SessionSupervisor;
pub use sessions::{SessionManager, TaskSubmitter};
pub use state::{TaskPhase, TerminalStatus};
pub use task::{Goal, GoalOrigin, SessionId, Step, StepOutcome, Task, TaskReport};
pub use verification::{Verdict, VerificationGate};
