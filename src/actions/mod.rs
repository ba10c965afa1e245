//! 动作层：ActionCall 变体、注册表、Schema 与内置动作（shell / 文件 / wait / chat）
//!
//! 桌面与浏览器动作由外部实现注册进 ActionRegistry，这里只提供不依赖 GUI 的内置动作。

pub mod basic;
pub mod call;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod shell;

pub use basic::{ChatAction, WaitAction};
pub use call::ActionCall;
pub use filesystem::{FileReadAction, FileWriteAction, SafeFs};
pub use registry::{
    Action, ActionDescriptor, ActionRegistry, Observation, RawOutcome, VerificationStrategy,
};
pub use schema::action_call_schema_json;
pub use shell::ShellAction;
