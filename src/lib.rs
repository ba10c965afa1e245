//! Orbit - 自主任务执行 Agent 的编排核心
//!
//! 模块划分：
//! - **actions**: ActionCall 变体、动作注册表、内置动作（shell / 文件 / wait / chat）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务状态机（Plan → Act → Verify → Recover）、校验、恢复、会话 worker、运行时装配
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 目标指纹与肌肉记忆（已验证例程缓存）
//! - **observability**: tracing 初始化
//! - **planner**: 规划协作者契约与 LLM 规划器
//! - **scheduler**: 定时任务（一次性 / 每日 / 心跳）
//! - **trace**: 每个任务一份只追加的运行轨迹

pub mod actions;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod planner;
pub mod scheduler;
pub mod trace;
