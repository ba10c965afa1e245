//! Shell 动作：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、mkdir）；禁止 rm -rf、wget、chmod 777 等子串；
//! 执行通过 sh -c / cmd /C，退出码原样上报给 Verification Gate（非零退出不是调用错误）。

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::actions::{Action, ActionCall, RawOutcome, VerificationStrategy};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 输出截断长度，避免把超长输出写进轨迹
const MAX_OUTPUT_CHARS: usize = 4000;

/// Shell 动作：仅允许白名单内命令
pub struct ShellAction {
    allowed_commands: HashSet<String>,
    default_cwd: Option<PathBuf>,
}

impl ShellAction {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            default_cwd: None,
        }
    }

    /// 未指定 cwd 时在此目录下执行
    pub fn with_default_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.default_cwd = Some(cwd.into());
        self
    }

    fn command_name<'a>(&self, raw: &'a str) -> &'a str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = self.command_name(&raw_lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{}' not in allowlist", name))
    }
}

#[async_trait]
impl Action for ShellAction {
    fn name(&self) -> &str {
        "shell_command"
    }

    fn description(&self) -> &str {
        "Run an allow-listed shell command. Params: {\"command\": \"...\", \"cwd\": optional}. Verified by exit code."
    }

    fn state_changing(&self) -> bool {
        true
    }

    fn verification(&self) -> VerificationStrategy {
        VerificationStrategy::CommandExitCode {
            success_pattern: None,
        }
    }

    async fn invoke(&self, call: &ActionCall) -> Result<RawOutcome, String> {
        let ActionCall::ShellCommand { command, cwd } = call else {
            return Err(format!("shell_command cannot run {}", call.name()));
        };
        let command = command.trim();
        self.is_allowed(command)?;

        tracing::info!(command = %command, "shell action invoke");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        if let Some(dir) = cwd.as_ref().map(PathBuf::from).or_else(|| self.default_cwd.clone()) {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let mut text = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        };
        if text.chars().count() > MAX_OUTPUT_CHARS {
            text = format!("{}...", text.chars().take(MAX_OUTPUT_CHARS).collect::<String>());
        }
        // 被信号终止时没有退出码，按 -1 上报
        Ok(RawOutcome::exited(output.status.code().unwrap_or(-1), text))
    }
}
