//! 内置 handler
//!
//! 内容生成保持简单：每个 handler 只从输入文档 / 上游 content 派生一个产物。
//! 所有内置 handler 在收到 `correction_from_llm` 时直接采用纠错结果。

mod api_designer;
mod bootstrap;
mod schema_designer;
mod spec_parser;
mod task_planner;

pub use api_designer::ApiDesigner;
pub use bootstrap::Bootstrap;
pub use schema_designer::SchemaDesigner;
pub use spec_parser::SpecParser;
pub use task_planner::TaskPlanner;

use serde_json::Value;

use crate::agents::HandlerRegistry;

/// 默认流水线顺序
pub const DEFAULT_PIPELINE: &[&str] = &[
    "bootstrap",
    "spec-parser",
    "task-planner",
    "schema-designer",
    "api-designer",
];

pub fn register_builtin(registry: &mut HandlerRegistry) {
    registry.register(Bootstrap);
    registry.register(SpecParser);
    registry.register(TaskPlanner);
    registry.register(SchemaDesigner);
    registry.register(ApiDesigner);
}

/// spec 中的实体名列表（`entities: [{name, fields}]` 或 `entities: ["name"]`）
pub(crate) fn entity_names(spec: &Value) -> Vec<String> {
    spec.get("entities")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|e| e.get("name").and_then(Value::as_str).or_else(|| e.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// 实体名规范化为 SQL / URL 标识：小写，非字母数字替换为 `_`
pub(crate) fn slug(name: &str) -> String {
    let s: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if s.is_empty() {
        "item".to_string()
    } else {
        s
    }
}
