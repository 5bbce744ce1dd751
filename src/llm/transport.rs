//! Chat-completion 传输层
//!
//! `ChatTransport` 只负责把请求体发出去并带回状态码与原始响应体；
//! 熔断、重试、预算与指标都在 `OpenRouterClient` 中处理，测试可替换为计数的假传输。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{LlmError, Message};

/// POST 请求体：`{model, messages, temperature, max_tokens}`
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// 原始 HTTP 响应
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connect: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for LlmError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(msg) => LlmError::Timeout(msg),
            TransportError::Connect(msg) | TransportError::Other(msg) => {
                LlmError::Connection(msg)
            }
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest 实现：Bearer 鉴权，每次请求带独立超时
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    referer: Option<String>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            referer: None,
        })
    }

    pub fn with_referer(mut self, referer: Option<String>) -> Self {
        self.referer = referer.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, api_key: &str, request: &ChatRequest) -> reqwest::RequestBuilder {
        let builder = self.client.post(&self.url).bearer_auth(api_key).json(request);
        match &self.referer {
            Some(referer) => builder.header("HTTP-Referer", referer),
            None => builder,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<TransportResponse, TransportError> {
        let res = self
            .request(api_key, request)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = res.status().as_u16();
        let body = res.text().await.map_err(classify_reqwest)?;
        Ok(TransportResponse { status, body })
    }
}

fn classify_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// 2xx 响应体中关心的部分
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoiceMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatUsage {
    pub total_tokens: Option<u64>,
}

impl ChatResponse {
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.as_deref())
    }

    pub fn total_tokens(&self) -> Option<u64> {
        self.usage.as_ref().and_then(|u| u.total_tokens)
    }
}
