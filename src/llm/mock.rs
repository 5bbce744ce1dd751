//! Mock LLM 客户端与脚本化传输层（用于测试，无需 API）
//!
//! - `MockLlmClient`：按顺序返回预置回复，耗尽后返回兜底回复或错误，并记录调用次数与请求消息。
//! - `ScriptedTransport`：替换 HTTP 传输，按顺序返回预置状态码/响应体或连接错误，便于验证熔断与重试。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::transport::{ChatRequest, ChatTransport, TransportError, TransportResponse};
use crate::llm::{CompletionOptions, LlmClient, LlmError, Message};

/// Mock 客户端：脚本化回复
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<(String, Vec<Message>)>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次都返回同一段文本
    pub fn always(text: impl Into<String>) -> Self {
        Self {
            fallback: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        lock(&self.replies).push_back(Ok(text.into()));
        self
    }

    pub fn fail(self, err: LlmError) -> Self {
        lock(&self.replies).push_back(Err(err));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 最近一次请求的 (model, messages)
    pub fn last_request(&self) -> Option<(String, Vec<Message>)> {
        lock(&self.requests).last().cloned()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push((model.to_string(), messages.to_vec()));
        if let Some(next) = lock(&self.replies).pop_front() {
            return next;
        }
        self.fallback
            .clone()
            .ok_or_else(|| LlmError::InvalidResponse("mock has no scripted reply".into()))
    }
}

/// 脚本化传输层
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, String>>>,
    fallback: Option<Result<TransportResponse, String>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<ChatRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, status: u16, body: &str) -> Self {
        lock(&self.script).push_back(Ok(TransportResponse {
            status,
            body: body.to_string(),
        }));
        self
    }

    pub fn fail_connect(self, msg: &str) -> Self {
        lock(&self.script).push_back(Err(msg.to_string()));
        self
    }

    /// 脚本耗尽后一律返回连接错误
    pub fn fail_always(mut self, msg: &str) -> Self {
        self.fallback = Some(Err(msg.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        lock(&self.last_request).clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(
        &self,
        _api_key: &str,
        request: &ChatRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_request) = Some(request.clone());
        let next = lock(&self.script).pop_front().or_else(|| self.fallback.clone());
        match next {
            Some(Ok(res)) => Ok(res),
            Some(Err(msg)) => Err(TransportError::Connect(msg)),
            None => Err(TransportError::Other("transport script exhausted".into())),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
