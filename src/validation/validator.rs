//! 输出校验器
//!
//! 按 agent 查找专用 schema，未注册时回退到通用 schema。所有 schema 在启动时编译一次，
//! 编译失败是致命配置错误；`validate` 是纯函数。

use std::collections::HashMap;
use std::path::Path;

use schemars::{schema_for, JsonSchema};
use serde_json::{json, Value};

use crate::validation::schema::{CompiledSchema, SchemaError, ValidationError};

/// 专用 schema 文件名后缀：`<agent>-output.schema.json`
pub const AGENT_SCHEMA_SUFFIX: &str = "-output.schema.json";

/// 通用 schema：status / content / metadata.{agent, runId, timestamp}
pub fn generic_schema() -> Value {
    json!({
        "type": "object",
        "required": ["status", "content", "metadata"],
        "properties": {
            "status": {"type": "string", "enum": ["ok", "error"]},
            "content": {"type": ["object", "array", "string", "number", "boolean"]},
            "path": {"type": ["string", "null"]},
            "metadata": {
                "type": "object",
                "required": ["agent", "runId", "timestamp"],
                "properties": {
                    "agent": {"type": "string", "minLength": 1},
                    "runId": {"type": "string", "minLength": 1},
                    "timestamp": {"type": "string", "minLength": 1},
                    "model": {"type": ["string", "null"]}
                }
            }
        }
    })
}

/// 纠错提示中描述的输出信封格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct OutputEnvelope {
    /// ok 或 error
    status: String,
    /// agent 产出的内容；纠错时只需返回这一部分
    content: Value,
    /// 持久化产物的路径
    path: Option<String>,
    metadata: EnvelopeMetadata,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
#[serde(rename_all = "camelCase")]
struct EnvelopeMetadata {
    agent: String,
    run_id: String,
    /// RFC 3339 时间戳
    timestamp: String,
    model: Option<String>,
}

/// 输出信封的 JSON Schema 字符串，可拼入纠错 prompt
pub fn envelope_schema_json() -> String {
    let schema = schema_for!(OutputEnvelope);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 输出校验器：通用 schema + 按 agent 注册的专用 schema
#[derive(Debug, Clone)]
pub struct OutputValidator {
    generic: CompiledSchema,
    per_agent: HashMap<String, CompiledSchema>,
    /// 原始 schema 文本，纠错时提供给 LLM
    sources: HashMap<String, Value>,
}

impl OutputValidator {
    pub fn new() -> Result<Self, SchemaError> {
        Ok(Self {
            generic: CompiledSchema::compile(&generic_schema())?,
            per_agent: HashMap::new(),
            sources: HashMap::new(),
        })
    }

    /// 加载目录下全部 `<agent>-output.schema.json`；目录不存在时只有通用 schema
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let mut validator = Self::new()?;
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Ok(validator);
        }
        let entries = std::fs::read_dir(dir).map_err(|source| SchemaError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(AGENT_SCHEMA_SUFFIX))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        for path in files {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let agent_id = name.trim_end_matches(AGENT_SCHEMA_SUFFIX).to_string();
            let raw = std::fs::read_to_string(&path).map_err(|source| SchemaError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let schema: Value = serde_json::from_str(&raw).map_err(|source| SchemaError::Json {
                path: path.display().to_string(),
                source,
            })?;
            validator.register(&agent_id, schema)?;
            tracing::info!(agent = %agent_id, path = %path.display(), "agent schema loaded");
        }
        Ok(validator)
    }

    pub fn register(&mut self, agent_id: &str, schema: Value) -> Result<(), SchemaError> {
        let compiled = CompiledSchema::compile(&schema)?;
        self.per_agent.insert(agent_id.to_string(), compiled);
        self.sources.insert(agent_id.to_string(), schema);
        Ok(())
    }

    pub fn has_agent_schema(&self, agent_id: &str) -> bool {
        self.per_agent.contains_key(agent_id)
    }

    /// 该 agent 生效的 schema 原文
    pub fn schema_source(&self, agent_id: &str) -> Value {
        self.sources
            .get(agent_id)
            .cloned()
            .unwrap_or_else(generic_schema)
    }

    pub fn validate(&self, agent_id: &str, wrapped: &Value) -> Result<(), Vec<ValidationError>> {
        self.per_agent
            .get(agent_id)
            .unwrap_or(&self.generic)
            .validate(wrapped)
    }
}
