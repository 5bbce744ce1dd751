//! Handler 契约：选项、输出、上下文与错误

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::llm::{LlmClient, LlmError, ModelSelector};
use crate::persistence::{ArtifactStore, MemoryArtifactStore, StoreError};

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// Handler 执行错误；在 handler 边界被收敛为该 handler 的结果，不中断流水线
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("cannot read input {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("artifact store failed: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

/// 调用选项（每次调用由 Dispatcher 构造并在调用前校验）
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    pub run_id: String,
    /// worker 任务 id；流水线内为 None
    pub task_id: Option<String>,
    /// 本地重试序号，首次为 0
    pub retry_attempt: u32,
    /// 流水线输入文档
    pub input_path: Option<PathBuf>,
    /// 上游 handler 的 content；上游失败时为 None
    pub upstream: Option<Value>,
    pub llm_enabled: bool,
    /// 存在时 handler 必须原样采用
    pub correction_from_llm: Option<Value>,
    /// handler 自定义参数
    pub params: Map<String, Value>,
}

impl HandlerOptions {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_path = Some(path.into());
        self
    }

    pub fn with_upstream(mut self, upstream: Option<Value>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_llm(mut self, enabled: bool) -> Self {
        self.llm_enabled = enabled;
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// 第 n 次本地重试的选项（其余字段不变）
    pub fn for_retry(&self, attempt: u32) -> Self {
        Self {
            retry_attempt: attempt,
            ..self.clone()
        }
    }

    /// 携带 LLM 纠错结果的选项
    pub fn with_correction(&self, correction: Value) -> Self {
        Self {
            correction_from_llm: Some(correction),
            ..self.clone()
        }
    }

    pub fn param_bool(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn check(&self) -> Result<(), HandlerError> {
        if self.run_id.trim().is_empty() {
            return Err(HandlerError::InvalidOptions("run_id is empty".into()));
        }
        if let Some(path) = &self.input_path {
            if path.as_os_str().is_empty() {
                return Err(HandlerError::InvalidOptions("input path is empty".into()));
            }
        }
        Ok(())
    }
}

/// Handler 的原始输出；status 保持字符串，交由校验器判断是否合法
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub status: String,
    pub path: Option<String>,
    pub content: Value,
    pub model: Option<String>,
}

impl HandlerOutput {
    pub fn new(status: impl Into<String>, content: Value) -> Self {
        Self {
            status: status.into(),
            path: None,
            content,
            model: None,
        }
    }

    pub fn ok(content: Value) -> Self {
        Self::new(STATUS_OK, content)
    }

    pub fn error(content: Value) -> Self {
        Self::new(STATUS_ERROR, content)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Dispatcher 注入给 handler 的能力
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<dyn ArtifactStore>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub models: ModelSelector,
}

impl HandlerContext {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            llm: None,
            models: ModelSelector::default(),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_models(mut self, models: ModelSelector) -> Self {
        self.models = models;
        self
    }

    /// 选项允许且注入了客户端时返回 LLM
    pub fn llm_for(&self, options: &HandlerOptions) -> Option<&Arc<dyn LlmClient>> {
        if options.llm_enabled {
            self.llm.as_ref()
        } else {
            None
        }
    }
}

impl Default for HandlerContext {
    fn default() -> Self {
        Self::new(Arc::new(MemoryArtifactStore::new()))
    }
}

/// 任务处理器
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// 需要其 content 作为输入的上游 agent
    fn upstream(&self) -> Option<&str> {
        None
    }

    async fn execute(
        &self,
        options: &HandlerOptions,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError>;
}

/// 采用 LLM 纠错结果：若纠错值本身是完整信封则取其 content / path，否则整体作为 content
pub fn accept_correction(correction: &Value) -> HandlerOutput {
    let envelope = correction
        .as_object()
        .filter(|obj| obj.contains_key("status") && obj.contains_key("content"));
    match envelope {
        Some(obj) => {
            let content = obj.get("content").cloned().unwrap_or(Value::Null);
            let mut out = HandlerOutput::ok(content);
            out.path = obj.get("path").and_then(Value::as_str).map(str::to_string);
            out
        }
        None => HandlerOutput::ok(correction.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accept_plain_correction() {
        let c = json!({"tasks": [{"taskId": 1}]});
        let out = accept_correction(&c);
        assert_eq!(out.status, STATUS_OK);
        assert_eq!(out.content, c);
        assert!(out.path.is_none());
    }

    #[test]
    fn test_accept_envelope_correction() {
        let c = json!({"status": "ok", "content": {"a": 1}, "path": "x.json"});
        let out = accept_correction(&c);
        assert_eq!(out.content, json!({"a": 1}));
        assert_eq!(out.path.as_deref(), Some("x.json"));
    }

    #[test]
    fn test_options_check() {
        assert!(HandlerOptions::new("run_1").check().is_ok());
        assert!(HandlerOptions::new("  ").check().is_err());
        assert!(HandlerOptions::new("run_1").with_input("").check().is_err());
    }

    #[test]
    fn test_retry_and_correction_options_keep_fields() {
        let base = HandlerOptions::new("run_1").with_input("in.json").with_llm(true);
        let retry = base.for_retry(2);
        assert_eq!(retry.retry_attempt, 2);
        assert_eq!(retry.input_path, base.input_path);
        let corrected = retry.with_correction(json!({"x": 1}));
        assert_eq!(corrected.correction_from_llm, Some(json!({"x": 1})));
        assert_eq!(corrected.retry_attempt, 2);
        assert!(corrected.llm_enabled);
    }

    #[test]
    fn test_llm_for_respects_flag() {
        let ctx = HandlerContext::default().with_llm(Arc::new(crate::llm::MockLlmClient::new()));
        assert!(ctx.llm_for(&HandlerOptions::new("r")).is_none());
        assert!(ctx.llm_for(&HandlerOptions::new("r").with_llm(true)).is_some());
    }
}
