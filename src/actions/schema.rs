//! 动作调用 JSON Schema 生成（schemars 自动生成）
//!
//! 用于将「合法 ActionCall」的 JSON 结构注入规划提示词，减少 LLM 输出格式错误。

use schemars::schema_for;

use crate::actions::ActionCall;

/// 返回 ActionCall 的 JSON Schema 字符串，可拼入 system prompt
pub fn action_call_schema_json() -> String {
    let schema = schema_for!(ActionCall);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lists_action_tags() {
        let schema = action_call_schema_json();
        assert!(schema.contains("open_app"));
        assert!(schema.contains("click_button"));
        assert!(schema.contains("params"));
    }
}
