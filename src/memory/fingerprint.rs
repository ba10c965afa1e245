//! 目标指纹：把目标文本归一化为与语序无关的意图键，并抽出字面参数
//!
//! 「查询 Paris 的天气」与「查询 London 的天气」只差一个字面参数，应得到同一个键；
//! 参数在回放时代入 Routine 模板的 `{{0}}`、`{{1}}` 占位符。

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actions::ActionCall;

/// 不参与意图键的功能词
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "in", "on", "at", "for", "to", "of", "and", "or", "please", "me", "my",
    "i", "you", "your", "can", "could", "would", "will", "with", "from", "by", "is", "are", "it",
    "this", "that", "now", "then", "some", "just", "pls", "kindly",
];

/// 目标指纹：意图键 + 按出现顺序的字面参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub key: String,
    pub params: Vec<String>,
}

impl Fingerprint {
    /// 没有任何意图词的目标（空串、纯参数）不进入肌肉记忆
    pub fn is_cacheable(&self) -> bool {
        !self.key.is_empty() && !self.key.starts_with('#')
    }
}

/// 指纹函数：必须确定性且对同义语序不敏感
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, goal: &str) -> Fingerprint;
}

/// 基于词法的默认实现
///
/// 字面参数：引号内片段、含数字的词（数字 / 时间 / 日期）、URL 与路径、句中大写开头的词（连续大写词合并，如 "New York"）。
/// 其余词小写、去停用词、排序去重后组成意图键，末尾附加参数个数。
#[derive(Debug, Default, Clone)]
pub struct LexicalFingerprinter;

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""[^"]+"|“[^”]+”|'[^'\s][^']*'|\S+"#).expect("static regex")
    })
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // {{i}} 文本占位；{{#i}} 数值占位（整个叶子）
    RE.get_or_init(|| Regex::new(r"\{\{(#?)(\d+)\}\}").expect("static regex"))
}

fn trim_punct(token: &str) -> &str {
    token.trim_matches(|c: char| ",.!?;:()[]{}\"'“”".contains(c))
}

fn is_literal(token: &str) -> bool {
    token.contains("://")
        || token.starts_with("www.")
        || token.contains('/')
        || token.contains('\\')
        || token.chars().any(|c| c.is_ascii_digit())
        || looks_like_file(token)
}

fn looks_like_file(token: &str) -> bool {
    match token.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

impl Fingerprinter for LexicalFingerprinter {
    fn fingerprint(&self, goal: &str) -> Fingerprint {
        let mut intent: BTreeSet<String> = BTreeSet::new();
        let mut params: Vec<String> = Vec::new();
        // 上一个词是否为句中大写参数，用于合并 "New York"
        let mut extending_proper = false;
        let mut sentence_start = true;

        for m in token_regex().find_iter(goal) {
            let raw = m.as_str();
            let quoted = (raw.starts_with('"') && raw.ends_with('"') && raw.len() > 1)
                || (raw.starts_with('“') && raw.ends_with('”'))
                || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() > 1);
            if quoted {
                let inner = raw
                    .trim_start_matches(['"', '“', '\''])
                    .trim_end_matches(['"', '”', '\''])
                    .trim();
                if !inner.is_empty() {
                    params.push(inner.to_string());
                }
                extending_proper = false;
                sentence_start = false;
                continue;
            }

            let ends_sentence = raw.ends_with(['.', '!', '?']) && !is_literal(trim_punct(raw));
            let token = trim_punct(raw);
            if token.is_empty() {
                continue;
            }

            if is_literal(token) {
                params.push(token.to_string());
                extending_proper = false;
            } else if !sentence_start && token.chars().next().is_some_and(char::is_uppercase) {
                match (extending_proper, params.last_mut()) {
                    (true, Some(last)) => {
                        last.push(' ');
                        last.push_str(token);
                    }
                    _ => params.push(token.to_string()),
                }
                extending_proper = !raw.ends_with([',', ';', ':']);
            } else {
                let word = token.to_lowercase();
                if !STOP_WORDS.contains(&word.as_str()) {
                    intent.insert(word);
                }
                extending_proper = false;
            }
            sentence_start = ends_sentence;
        }

        let mut key = intent.into_iter().collect::<Vec<_>>().join(" ");
        if !params.is_empty() {
            if !key.is_empty() {
                key.push(' ');
            }
            key.push_str(&format!("#{}", params.len()));
        }
        Fingerprint { key, params }
    }
}

/// 例程中的一步：ActionCall 的 JSON 形式，参数位置可能是 `{{i}}` / `{{#i}}` 占位符
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepTemplate(pub Value);

impl From<ActionCall> for StepTemplate {
    fn from(call: ActionCall) -> Self {
        StepTemplate(serde_json::to_value(call).unwrap_or_default())
    }
}

fn text_slot(i: usize) -> String {
    format!("{{{{{i}}}}}")
}

fn numeric_slot(i: usize) -> String {
    format!("{{{{#{i}}}}}")
}

/// 整个字符串恰好是数值占位时返回其下标
fn numeric_slot_index(s: &str) -> Option<usize> {
    s.strip_prefix("{{#")?.strip_suffix("}}")?.parse().ok()
}

fn template_text(s: &str, params: &[String], order: &[usize]) -> String {
    let mut out = s.to_string();
    for &i in order {
        let param = &params[i];
        if param.chars().count() < 2 {
            if out == *param {
                out = text_slot(i);
            }
            continue;
        }
        out = out.replace(param.as_str(), &text_slot(i));
        let lower = param.to_lowercase();
        if lower != *param {
            out = out.replace(lower.as_str(), &text_slot(i));
        }
    }
    out
}

fn template_leaves(value: &mut Value, params: &[String], order: &[usize]) {
    match value {
        Value::String(s) => *s = template_text(s, params, order),
        Value::Number(n) => {
            let text = n.to_string();
            if let Some(i) = params.iter().position(|p| *p == text) {
                *value = Value::String(numeric_slot(i));
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|v| template_leaves(v, params, order)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|v| template_leaves(v, params, order)),
        _ => {}
    }
}

/// 把执行过的动作转为模板：参数值中出现的目标字面参数替换为占位符
///
/// 字符串叶子里的参数替换为 `{{i}}`；数值叶子与某个参数字面相等时整体替换为 `{{#i}}`，
/// 回放时再解析回数字。长度为 1 的参数只在整个字符串恰好等于它时替换，避免误伤 "step_3.png" 之类的值。
pub fn templatize(calls: &[ActionCall], params: &[String]) -> Vec<StepTemplate> {
    let mut order: Vec<usize> = (0..params.len()).collect();
    // 长参数优先，避免 "New" 先于 "New York" 被替换
    order.sort_by_key(|&i| std::cmp::Reverse(params[i].len()));

    calls
        .iter()
        .map(|call| {
            let mut value = serde_json::to_value(call).unwrap_or_default();
            if let Some(p) = value.get_mut("params") {
                template_leaves(p, params, &order);
            }
            StepTemplate(value)
        })
        .collect()
}

fn parse_number(raw: &str) -> Option<Value> {
    if let Ok(n) = raw.parse::<i64>() {
        return Some(Value::from(n));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

fn bind_text(s: &str, params: &[String]) -> Result<String, String> {
    let mut missing = None;
    let bound = placeholder_regex().replace_all(s, |caps: &regex::Captures| {
        let idx: usize = caps[2].parse().unwrap_or(usize::MAX);
        match params.get(idx) {
            Some(v) => v.clone(),
            None => {
                missing = Some(idx);
                String::new()
            }
        }
    });
    match missing {
        Some(idx) => Err(format!("template slot {idx} has no parameter")),
        None => Ok(bound.into_owned()),
    }
}

fn bind_leaves(value: &mut Value, params: &[String]) -> Result<(), String> {
    match value {
        Value::String(s) => {
            if let Some(idx) = numeric_slot_index(s) {
                let raw = params
                    .get(idx)
                    .ok_or_else(|| format!("template slot {idx} has no parameter"))?;
                *value = parse_number(raw)
                    .ok_or_else(|| format!("parameter {raw:?} is not a number"))?;
                return Ok(());
            }
            *s = bind_text(s, params)?;
            Ok(())
        }
        Value::Array(items) => items.iter_mut().try_for_each(|v| bind_leaves(v, params)),
        Value::Object(map) => map.values_mut().try_for_each(|v| bind_leaves(v, params)),
        _ => Ok(()),
    }
}

/// 用新目标的字面参数实例化模板；占位符越界或数值参数无法解析时报错（视为未命中）
pub fn materialize(templates: &[StepTemplate], params: &[String]) -> Result<Vec<ActionCall>, String> {
    templates
        .iter()
        .map(|template| {
            let mut value = template.0.clone();
            if let Some(p) = value.get_mut("params") {
                bind_leaves(p, params)?;
            }
            ActionCall::from_value(value)
        })
        .collect()
}

fn collect_slots(value: &Value, slots: &mut BTreeSet<usize>) {
    match value {
        Value::String(s) => {
            for caps in placeholder_regex().captures_iter(s) {
                if let Ok(i) = caps[2].parse() {
                    slots.insert(i);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_slots(v, slots)),
        Value::Object(map) => map.values().for_each(|v| collect_slots(v, slots)),
        _ => {}
    }
}

/// 模板是否引用了全部 n 个参数；有参数没被用到的序列回放时会沿用旧值，不能缓存
pub fn covers_all_params(templates: &[StepTemplate], n: usize) -> bool {
    let mut slots = BTreeSet::new();
    for template in templates {
        if let Some(p) = template.0.get("params") {
            collect_slots(p, &mut slots);
        }
    }
    (0..n).all(|i| slots.contains(&i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(goal: &str) -> Fingerprint {
        LexicalFingerprinter.fingerprint(goal)
    }

    #[test]
    fn test_deterministic_and_order_insensitive() {
        assert_eq!(fp("open calculator"), fp("open calculator"));
        assert_eq!(fp("open calculator").key, fp("calculator open").key);
        assert_eq!(fp("please open the calculator").key, "calculator open");
        assert!(fp("open calculator").params.is_empty());
    }

    #[test]
    fn test_literal_parameters_share_key() {
        let paris = fp("check weather in Paris");
        let london = fp("check weather in London");
        assert_eq!(paris.key, london.key);
        assert_eq!(paris.params, vec!["Paris".to_string()]);
        assert_eq!(london.params, vec!["London".to_string()]);

        let ny = fp("check weather in New York");
        assert_eq!(ny.key, paris.key);
        assert_eq!(ny.params, vec!["New York".to_string()]);
    }

    #[test]
    fn test_quotes_numbers_and_urls_are_params() {
        let f = fp(r#"search "rust async" on https://duckduckgo.com at 09:30"#);
        assert_eq!(
            f.params,
            vec![
                "rust async".to_string(),
                "https://duckduckgo.com".to_string(),
                "09:30".to_string()
            ]
        );
        assert_eq!(f.key, "search #3");
    }

    #[test]
    fn test_empty_goal_not_cacheable() {
        assert!(!fp("   ").is_cacheable());
        assert!(!fp("\"only a quote\"").is_cacheable());
        assert!(fp("open calculator").is_cacheable());
    }

    #[test]
    fn test_templatize_and_materialize() {
        let params = vec!["Paris".to_string()];
        let calls = vec![
            ActionCall::BrowserNavigate {
                url: "https://duckduckgo.com/?q=weather+Paris".into(),
            },
            ActionCall::Wait { millis: 1000 },
        ];
        let templates = templatize(&calls, &params);
        assert_eq!(
            templates[0].0["params"]["url"],
            "https://duckduckgo.com/?q=weather+{{0}}"
        );
        assert_eq!(templates[1], StepTemplate::from(ActionCall::Wait { millis: 1000 }));

        let bound = materialize(&templates, &["London".to_string()]).unwrap();
        assert_eq!(
            bound[0],
            ActionCall::BrowserNavigate {
                url: "https://duckduckgo.com/?q=weather+London".into()
            }
        );
        assert_eq!(bound[1], ActionCall::Wait { millis: 1000 });
        assert!(materialize(&templates, &[]).is_err());
    }

    #[test]
    fn test_numeric_literals_become_slots() {
        let goal = fp("press button 42");
        assert_eq!(goal.params, vec!["42".to_string()]);
        let calls = vec![ActionCall::ClickButton {
            x: 42,
            y: 10,
            label: None,
        }];
        let templates = templatize(&calls, &goal.params);
        assert_eq!(templates[0].0["params"]["x"], "{{#0}}");
        assert_eq!(templates[0].0["params"]["y"], 10);
        assert!(covers_all_params(&templates, 1));

        let other = fp("press button 77");
        assert_eq!(other.key, goal.key);
        assert_eq!(
            materialize(&templates, &other.params).unwrap(),
            vec![ActionCall::ClickButton {
                x: 77,
                y: 10,
                label: None
            }]
        );
        assert!(materialize(&templates, &["seventy".to_string()]).is_err());
    }

    #[test]
    fn test_unused_parameter_is_not_covered() {
        let params = vec!["5".to_string()];
        let templates = templatize(&[ActionCall::Wait { millis: 5000 }], &params);
        assert!(!covers_all_params(&templates, 1));
        assert!(covers_all_params(&templates, 0));
    }

    #[test]
    fn test_action_tag_never_templated() {
        let params = vec!["chat".to_string()];
        let calls = vec![ActionCall::Chat {
            text: "hello".into(),
        }];
        let templates = templatize(&calls, &params);
        assert_eq!(templates[0].0["action"], "chat");
        assert_eq!(materialize(&templates, &params).unwrap(), calls);
    }
}
