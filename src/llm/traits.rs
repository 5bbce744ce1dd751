//! LLM 客户端抽象
//!
//! 所有后端（OpenRouter 兼容 HTTP / Mock）实现 LlmClient：`complete(model, messages, options)` 返回首条补全文本。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 单条对话消息，序列化即为 API 的 `{role, content}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// 单次调用选项；未设置的字段取客户端配置中的默认值
#[derive(Clone, Debug, Default)]
pub struct CompletionOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// 调用方 agent，用于每 agent token 上限与日志
    pub agent_id: Option<String>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
}

impl CompletionOptions {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay_ms: u64) -> Self {
        self.max_retries = Some(max_retries);
        self.base_delay_ms = Some(base_delay_ms);
        self
    }
}

/// 错误分类：瞬时错误可重试，永久错误不应盲目重试
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Unknown,
}

/// LLM 调用错误
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("OPENROUTER_API_KEY not set in environment")]
    MissingCredential,

    #[error("LLM client configuration error: {0}")]
    Config(String),

    #[error("Circuit open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },

    #[error("Global token budget exhausted ({used}/{budget})")]
    BudgetExhausted { used: u64, budget: u64 },

    #[error("Global token budget check failed: {0}")]
    BudgetCheckFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("API error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LlmError::Timeout(_) | LlmError::Connection(_) => ErrorClass::Transient,
            LlmError::Http { status, .. } => match status {
                429 | 503 => ErrorClass::Transient,
                400 | 401 | 403 => ErrorClass::Permanent,
                _ => ErrorClass::Unknown,
            },
            LlmError::MissingCredential | LlmError::Config(_) => ErrorClass::Permanent,
            _ => ErrorClass::Unknown,
        }
    }

    /// 不进入重试、也不计入熔断的本地拒绝（配置、熔断打开、预算）
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            LlmError::MissingCredential
                | LlmError::Config(_)
                | LlmError::CircuitOpen { .. }
                | LlmError::BudgetExhausted { .. }
                | LlmError::BudgetCheckFailed(_)
        )
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成，返回首条补全文本
    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_status() {
        let err = |status| LlmError::Http {
            status,
            body: String::new(),
        };
        assert_eq!(err(429).class(), ErrorClass::Transient);
        assert_eq!(err(503).class(), ErrorClass::Transient);
        assert_eq!(err(400).class(), ErrorClass::Permanent);
        assert_eq!(err(401).class(), ErrorClass::Permanent);
        assert_eq!(err(403).class(), ErrorClass::Permanent);
        assert_eq!(err(500).class(), ErrorClass::Unknown);
    }

    #[test]
    fn test_classify_transport() {
        assert_eq!(LlmError::Timeout("x".into()).class(), ErrorClass::Transient);
        assert_eq!(
            LlmError::Connection("refused".into()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_fail_fast() {
        assert!(LlmError::MissingCredential.is_fail_fast());
        assert!(LlmError::CircuitOpen { retry_in_ms: 10 }.is_fail_fast());
        assert!(LlmError::BudgetExhausted { used: 1, budget: 1 }.is_fail_fast());
        assert!(!LlmError::Timeout("t".into()).is_fail_fast());
    }

    #[test]
    fn test_message_wire_format() {
        let v = serde_json::to_value(Message::system("hi")).unwrap();
        assert_eq!(v, serde_json::json!({"role": "system", "content": "hi"}));
    }
}
