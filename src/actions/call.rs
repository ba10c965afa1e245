//! 动作调用：按动作种类打标签的变体，每个标签对应固定参数结构
//!
//! JSON 形如 `{"action": "open_app", "params": {"app": "calculator"}}`。
//! 规划器输出必须能反序列化为 ActionCall，否则视为非法计划，执行器在调用前即可校验参数。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum ActionCall {
    /// 打开桌面应用
    OpenApp { app: String },
    /// 点击屏幕坐标处的按钮；label 用于观察校验
    ClickButton {
        x: i32,
        y: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// 在当前焦点处输入文本
    TypeText { text: String },
    /// 按下组合键，如 ["ctrl", "s"]
    PressKeys { keys: Vec<String> },
    /// 截图；save_path 供后续视觉步骤引用
    Screenshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_path: Option<String>,
    },
    /// 浏览器导航到 URL（自动启动浏览器）
    BrowserNavigate { url: String },
    /// 执行白名单 shell 命令
    ShellCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    FileRead { path: String },
    FileWrite { path: String, content: String },
    /// 等待 UI 渲染
    Wait { millis: u64 },
    /// 向用户发送一条消息
    Chat { text: String },
}

impl ActionCall {
    /// 动作名（与注册表的键、JSON 中的 "action" 字段一致）
    pub fn name(&self) -> &'static str {
        match self {
            ActionCall::OpenApp { .. } => "open_app",
            ActionCall::ClickButton { .. } => "click_button",
            ActionCall::TypeText { .. } => "type_text",
            ActionCall::PressKeys { .. } => "press_keys",
            ActionCall::Screenshot { .. } => "screenshot",
            ActionCall::BrowserNavigate { .. } => "browser_navigate",
            ActionCall::ShellCommand { .. } => "shell_command",
            ActionCall::FileRead { .. } => "file_read",
            ActionCall::FileWrite { .. } => "file_write",
            ActionCall::Wait { .. } => "wait",
            ActionCall::Chat { .. } => "chat",
        }
    }

    /// 参数部分（不含动作名），用于轨迹与提示词
    pub fn params(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("params").cloned())
            .unwrap_or(serde_json::Value::Null)
    }

    /// 单行描述，如 `open_app({"app":"calculator"})`
    pub fn describe(&self) -> String {
        format!("{}({})", self.name(), self.params())
    }

    /// 从宽松 JSON 解析：除标准的 action/params 形式外，也接受 {"action": "...", ...扁平参数}
    pub fn from_value(value: serde_json::Value) -> Result<Self, String> {
        match serde_json::from_value::<ActionCall>(value.clone()) {
            Ok(call) => Ok(call),
            Err(first) => {
                let obj = value
                    .as_object()
                    .ok_or_else(|| format!("action must be an object: {value}"))?;
                if obj.contains_key("params") {
                    return Err(first.to_string());
                }
                let action = obj
                    .get("action")
                    .cloned()
                    .ok_or_else(|| format!("missing \"action\": {value}"))?;
                let params: serde_json::Map<String, serde_json::Value> = obj
                    .iter()
                    .filter(|(k, _)| k.as_str() != "action")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let normalized = serde_json::json!({ "action": action, "params": params });
                serde_json::from_value(normalized).map_err(|e| e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_json_shape() {
        let call = ActionCall::OpenApp {
            app: "calculator".into(),
        };
        let v = serde_json::to_value(&call).unwrap();
        assert_eq!(v["action"], "open_app");
        assert_eq!(v["params"]["app"], "calculator");
        assert_eq!(call.name(), "open_app");
    }

    #[test]
    fn test_rejects_unknown_action_and_bad_params() {
        let unknown = serde_json::json!({"action": "format_disk", "params": {}});
        assert!(ActionCall::from_value(unknown).is_err());
        let bad = serde_json::json!({"action": "click_button", "params": {"x": "left"}});
        assert!(ActionCall::from_value(bad).is_err());
    }

    #[test]
    fn test_accepts_flat_params() {
        let flat = serde_json::json!({"action": "click_button", "x": 10, "y": 20});
        let call = ActionCall::from_value(flat).unwrap();
        assert_eq!(
            call,
            ActionCall::ClickButton {
                x: 10,
                y: 20,
                label: None
            }
        );
    }

    #[test]
    fn test_describe() {
        let call = ActionCall::Wait { millis: 500 };
        assert_eq!(call.describe(), r#"wait({"millis":500})"#);
    }
}
