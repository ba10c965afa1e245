//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ORBIT__*` 覆盖（双下划线表示嵌套，如 `ORBIT__EXECUTOR__RETRY_BUDGET=5`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub verification: VerificationSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub actions: ActionsSection,
    #[serde(default)]
    pub permissions: PermissionsSection,
}

/// [app] 段：数据目录（SQLite、轨迹日志）
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 数据根目录，未设置时用 ./data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl AppSection {
    /// 肌肉记忆与定时任务共用的 SQLite 文件
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("orbit.db")
    }

    /// 每个任务一份 JSONL 轨迹
    pub fn trace_dir(&self) -> PathBuf {
        self.data_dir.join("traces")
    }
}

/// [llm] 段：规划后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；无 OPENAI_API_KEY 时一律回落到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [executor] 段：任务状态机的预算与超时
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// 单个任务内恢复次数上限（全局计数，而非每步）
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// 单次动作调用超时（秒）
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// 规划请求超时（秒）
    #[serde(default = "default_planning_timeout_secs")]
    pub planning_timeout_secs: u64,
    /// 规划时附带的轨迹条数
    #[serde(default = "default_trace_tail")]
    pub trace_tail: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            step_timeout_secs: default_step_timeout_secs(),
            planning_timeout_secs: default_planning_timeout_secs(),
            trace_tail: default_trace_tail(),
        }
    }
}

fn default_retry_budget() -> u32 {
    3
}

fn default_step_timeout_secs() -> u64 {
    60
}

fn default_planning_timeout_secs() -> u64 {
    90
}

fn default_trace_tail() -> usize {
    20
}

/// [verification] 段
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationSection {
    /// 观察（截图区域 / 自定义谓词）超时（秒）；超时视为未验证
    #[serde(default = "default_observe_timeout_secs")]
    pub observe_timeout_secs: u64,
}

impl Default for VerificationSection {
    fn default() -> Self {
        Self {
            observe_timeout_secs: default_observe_timeout_secs(),
        }
    }
}

fn default_observe_timeout_secs() -> u64 {
    15
}

/// [recovery] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    /// 每次恢复最多给出的替代动作数（K）
    #[serde(default = "default_max_replacements")]
    pub max_replacements: usize,
    /// 规划器 replan 超时（秒）
    #[serde(default = "default_replan_timeout_secs")]
    pub replan_timeout_secs: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_replacements: default_max_replacements(),
            replan_timeout_secs: default_replan_timeout_secs(),
        }
    }
}

fn default_max_replacements() -> usize {
    3
}

fn default_replan_timeout_secs() -> u64 {
    60
}

/// DAILY 任务停机后的补发策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DailyCatchUp {
    /// 错过的时段立即补发一次，之后回到正常时刻
    FireOnce,
    /// 不补发，等待下一个时段
    #[default]
    Skip,
}

/// [scheduler] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// DAILY 时刻按此 UTC 偏移（分钟）解释
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub daily_catch_up: DailyCatchUp,
    /// 协调循环最长空闲等待（秒），即使没有任务到期也会醒来一次
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            daily_catch_up: DailyCatchUp::default(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

fn default_max_idle_secs() -> u64 {
    60
}

/// [actions] 段：内置动作的沙箱根目录与 Shell 白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ActionsSection {
    /// 文件动作根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    #[serde(default = "default_allowed_commands")]
    pub shell_allowed_commands: Vec<String>,
}

impl Default for ActionsSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            shell_allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "echo".into(),
        "cat".into(),
        "grep".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "mkdir".into(),
        "open".into(),
        "xdg-open".into(),
    ]
}

/// 动作执行前的权限级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    #[default]
    Allow,
    Deny,
    /// 需要审批者同意；没有审批者即视为拒绝
    Ask,
}

/// [permissions] 段：按动作名配置 allow / deny / ask
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PermissionsSection {
    /// 未在 rules 中出现的动作使用此级别
    #[serde(default)]
    pub default: PermissionLevel,
    #[serde(default)]
    pub rules: HashMap<String, PermissionLevel>,
    /// 改变状态的动作执行前再让 LLM 审查一次（APPROVE / REJECT）
    #[serde(default)]
    pub guardrail: bool,
}

/// 从 config 目录加载配置，环境变量 ORBIT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ORBIT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ORBIT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
