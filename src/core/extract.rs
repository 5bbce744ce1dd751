//! 从 LLM 回复中尽力提取一个 JSON 对象
//!
//! 依次尝试：去掉 Markdown 代码围栏后整体解析；扫描第一个括号配平的 `{...}` 块。
//! 结果只有「拿到对象」或「没有」两种。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

static FENCE_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn fence_re() -> Option<&'static Regex> {
    FENCE_RE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*\n?(.*?)```").ok())
        .as_ref()
}

/// 去掉首个代码围栏，没有围栏时原样返回（trim 后）
pub fn strip_code_fence(text: &str) -> &str {
    fence_re()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or_else(|| text.trim())
}

/// 提取 JSON 对象；数组、标量与无法解析的文本都返回 None
pub fn extract_json_object(text: &str) -> Option<Value> {
    let body = strip_code_fence(text);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(body) {
        return Some(value);
    }
    // 围栏内外都可能藏着对象
    first_balanced_object(body).or_else(|| first_balanced_object(text))
}

fn first_balanced_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open) {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&text[open..=close]) {
                return Some(value);
            }
        }
        start = open + 1;
    }
    None
}

/// 从 `open` 处的 `{` 开始找配平的 `}`，跳过字符串字面量中的括号
fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
