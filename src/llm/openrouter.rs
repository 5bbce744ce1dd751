//! OpenRouter 兼容 API 客户端
//!
//! 每次 `complete`：熔断检查 → token 预算检查 → 计算单次 token 上限 → 带退避的重试 → 网络调用。
//! 网络失败与非 2xx 计入熔断与指标；2xx 复位熔断并记录延迟与 token 用量。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::{AppConfig, LlmSection};
use crate::llm::retry::{retry_with_backoff_until, RetryConfig, Sleeper, TokioSleeper};
use crate::llm::transport::{ChatRequest, ChatResponse, ChatTransport, HttpTransport};
use crate::llm::{CompletionOptions, LlmClient, LlmError, Message, ResilienceState};

/// 错误信息中保留的响应体长度（字符）
const ERROR_BODY_CHARS: usize = 200;

/// 弹性 LLM 客户端：持有传输层、共享的熔断/指标状态与退避计时器
pub struct OpenRouterClient {
    settings: LlmSection,
    transport: Arc<dyn ChatTransport>,
    state: Arc<ResilienceState>,
    sleeper: Arc<dyn Sleeper>,
}

impl OpenRouterClient {
    /// 按配置创建 reqwest 传输层；缺少凭证不在这里报错，而是在首次调用时
    pub fn from_config(cfg: &AppConfig, state: Arc<ResilienceState>) -> Result<Self, LlmError> {
        let transport = HttpTransport::new(
            cfg.llm.api_url.clone(),
            Duration::from_secs(cfg.llm.request_timeout_secs),
        )?
        .with_referer(cfg.llm.referer.clone());
        Ok(Self::with_transport(cfg.llm.clone(), Arc::new(transport), state))
    }

    pub fn with_transport(
        settings: LlmSection,
        transport: Arc<dyn ChatTransport>,
        state: Arc<ResilienceState>,
    ) -> Self {
        Self {
            settings,
            transport,
            state,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> &Arc<ResilienceState> {
        &self.state
    }

    /// `min(请求值, agent 上限, 全局上限)`
    pub fn resolve_max_tokens(&self, options: &CompletionOptions) -> u32 {
        let requested = options.max_tokens.unwrap_or(self.settings.default_max_tokens);
        requested
            .min(self.settings.agent_token_limit(options.agent_id.as_deref()))
            .min(self.settings.max_tokens_ceiling)
    }

    fn check_circuit(&self) -> Result<(), LlmError> {
        match self.state.remaining_open() {
            Some(remaining) => Err(LlmError::CircuitOpen {
                retry_in_ms: remaining.as_millis() as u64,
            }),
            None => Ok(()),
        }
    }

    /// 无法确认余量时拒绝调用，宁可少调也不超预算
    fn check_budget(&self) -> Result<(), LlmError> {
        let budget = self.settings.token_budget;
        if budget == 0 {
            return Ok(());
        }
        let snapshot = self
            .state
            .metrics()
            .snapshot()
            .map_err(|e| LlmError::BudgetCheckFailed(e.to_string()))?;
        if snapshot.total_tokens >= budget {
            return Err(LlmError::BudgetExhausted {
                used: snapshot.total_tokens,
                budget,
            });
        }
        Ok(())
    }

    async fn attempt(
        &self,
        api_key: &str,
        request: &ChatRequest,
        agent: &str,
        attempt: u32,
    ) -> Result<String, LlmError> {
        self.check_circuit()?;
        self.check_budget()?;

        let start = Instant::now();
        let sent = self.transport.send(api_key, request).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let response = match sent {
            Ok(res) => res,
            Err(e) => {
                self.state.record_failure(latency_ms);
                tracing::info!(
                    model = %request.model, agent, attempt, ok = false, latency_ms,
                    error = %e, "llm_call"
                );
                return Err(e.into());
            }
        };

        if !response.is_success() {
            self.state.record_failure(latency_ms);
            tracing::info!(
                model = %request.model, agent, attempt, ok = false, latency_ms,
                status = response.status, "llm_call"
            );
            return Err(LlmError::Http {
                status: response.status,
                body: response.body.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }

        let parsed = serde_json::from_str::<ChatResponse>(&response.body);
        let tokens = parsed.as_ref().ok().and_then(ChatResponse::total_tokens);
        self.state.record_success(latency_ms, tokens);
        tracing::info!(
            model = %request.model, agent, attempt, ok = true, latency_ms,
            tokens = tokens.unwrap_or(0), "llm_call"
        );

        let parsed = parsed.map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parsed
            .first_content()
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices[0].message.content".into()))
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(LlmError::MissingCredential)?;

        let request = ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature: options.temperature.unwrap_or(self.settings.temperature),
            max_tokens: self.resolve_max_tokens(options),
        };
        let retry = RetryConfig {
            max_attempts: options.max_retries.unwrap_or(self.settings.max_retries),
            base_delay_ms: options.base_delay_ms.unwrap_or(self.settings.base_delay_ms),
            retry_permanent: self.settings.retry_permanent_errors,
        };
        let agent = options.agent_id.as_deref().unwrap_or("-");

        // 本次失败打开了熔断时，返回真实的远端错误而不是下一轮的 CircuitOpen
        retry_with_backoff_until(
            &retry,
            self.sleeper.as_ref(),
            || self.state.remaining_open().is_some(),
            |attempt| self.attempt(api_key, &request, agent, attempt),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedTransport;
    use crate::llm::retry::RecordingSleeper;
    use crate::llm::CircuitBreaker;
    use crate::observability::MetricsRecorder;

    fn settings() -> LlmSection {
        LlmSection {
            api_key: Some("sk-test".into()),
            max_retries: 1,
            base_delay_ms: 10,
            ..LlmSection::default()
        }
    }

    fn state(threshold: u32, cooldown_ms: u64) -> Arc<ResilienceState> {
        Arc::new(ResilienceState::new(
            CircuitBreaker::new(threshold, Duration::from_millis(cooldown_ms)),
            MetricsRecorder::new(50),
        ))
    }

    fn client(
        settings: LlmSection,
        transport: Arc<ScriptedTransport>,
        state: Arc<ResilienceState>,
    ) -> OpenRouterClient {
        OpenRouterClient::with_transport(settings, transport, state)
            .with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    fn ok_body(content: &str, tokens: u64) -> String {
        serde_json::json!({
            "choices": [{"message": {"content": content}}],
            "usage": {"total_tokens": tokens}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_missing_credential_is_fatal() {
        let transport = Arc::new(ScriptedTransport::new());
        let c = client(
            LlmSection {
                api_key: None,
                ..settings()
            },
            transport.clone(),
            state(3, 1000),
        );
        let err = c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingCredential));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_success_returns_content_and_records_tokens() {
        let transport = Arc::new(ScriptedTransport::new().reply(200, &ok_body("hello", 42)));
        let st = state(3, 1000);
        let c = client(settings(), transport.clone(), st.clone());
        let text = c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "hello");
        let snap = st.metrics().snapshot().unwrap();
        assert_eq!(snap.llm_calls, 1);
        assert_eq!(snap.total_tokens, 42);
    }

    #[tokio::test]
    async fn test_http_error_includes_status_and_truncated_body() {
        let long_body = "x".repeat(500);
        let transport = Arc::new(ScriptedTransport::new().reply(500, &long_body));
        let c = client(settings(), transport, state(3, 1000));
        let err = c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        match err {
            LlmError::Http { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body.chars().count(), 200);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_circuit_opens_at_threshold_and_blocks_network() {
        let transport = Arc::new(ScriptedTransport::new().fail_always("connection refused"));
        let st = state(3, 60_000);
        let c = client(settings(), transport.clone(), st.clone());
        let opts = CompletionOptions::default();

        for expected_calls in 1..=3 {
            let err = c.complete("m", &[Message::user("hi")], &opts).await.unwrap_err();
            assert!(matches!(err, LlmError::Connection(_)));
            assert_eq!(transport.calls(), expected_calls);
        }
        assert_eq!(st.circuit().consecutive_failures(), 3);
        assert!(st.remaining_open().is_some());

        let before = st.metrics().snapshot().unwrap();
        let err = c.complete("m", &[Message::user("hi")], &opts).await.unwrap_err();
        assert!(matches!(err, LlmError::CircuitOpen { .. }));
        assert_eq!(transport.calls(), 3);
        assert_eq!(st.metrics().snapshot().unwrap().llm_calls, before.llm_calls);
    }

    #[tokio::test]
    async fn test_failure_that_opens_circuit_keeps_remote_cause() {
        let transport = Arc::new(ScriptedTransport::new().reply(502, "bad gateway"));
        let st = state(1, 60_000);
        let sleeper = Arc::new(RecordingSleeper::new());
        let c = OpenRouterClient::with_transport(
            LlmSection {
                max_retries: 3,
                ..settings()
            },
            transport.clone(),
            st.clone(),
        )
        .with_sleeper(sleeper.clone());
        let err = c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 502, .. }), "{err:?}");
        assert_eq!(transport.calls(), 1);
        assert!(sleeper.delays().is_empty());
        assert!(st.remaining_open().is_some());
    }

    #[tokio::test]
    async fn test_circuit_not_open_below_threshold() {
        let transport = Arc::new(ScriptedTransport::new().fail_always("refused"));
        let st = state(3, 60_000);
        let c = client(settings(), transport, st.clone());
        for _ in 0..2 {
            let _ = c
                .complete("m", &[Message::user("hi")], &CompletionOptions::default())
                .await;
        }
        assert!(st.remaining_open().is_none());
    }

    #[tokio::test]
    async fn test_success_after_cooldown_closes_circuit() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .fail_connect("refused")
                .reply(200, &ok_body("back", 1)),
        );
        let st = state(1, 20);
        let c = client(settings(), transport.clone(), st.clone());
        let opts = CompletionOptions::default();
        assert!(c.complete("m", &[Message::user("a")], &opts).await.is_err());
        assert!(st.remaining_open().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        let text = c.complete("m", &[Message::user("b")], &opts).await.unwrap();
        assert_eq!(text, "back");
        assert!(st.remaining_open().is_none());
        assert_eq!(st.circuit().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_budget_exhausted_fails_without_network() {
        let transport = Arc::new(ScriptedTransport::new().reply(200, &ok_body("x", 1)));
        let st = state(3, 1000);
        st.metrics().record_call(5, true, Some(200));
        let c = client(
            LlmSection {
                token_budget: 100,
                ..settings()
            },
            transport.clone(),
            st.clone(),
        );
        let err = c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LlmError::BudgetExhausted {
                used: 200,
                budget: 100
            }
        ));
        assert_eq!(transport.calls(), 0);
        // 预算拒绝不计入熔断
        assert_eq!(st.circuit().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_metrics_fail_budget_check() {
        let transport = Arc::new(ScriptedTransport::new().reply(200, &ok_body("x", 1)));
        let st = state(3, 1000);
        st.metrics().poison();
        let c = client(
            LlmSection {
                token_budget: 100,
                ..settings()
            },
            transport.clone(),
            st.clone(),
        );
        let err = c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::BudgetCheckFailed(_)));
        assert_eq!(transport.calls(), 0);
        assert_eq!(st.circuit().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_metrics_ignored_without_budget() {
        let transport = Arc::new(ScriptedTransport::new().reply(200, &ok_body("x", 1)));
        let st = state(3, 1000);
        st.metrics().poison();
        let c = client(settings(), transport.clone(), st);
        assert!(c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .is_ok());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_budget_not_reached_allows_call() {
        let transport = Arc::new(ScriptedTransport::new().reply(200, &ok_body("ok", 10)));
        let st = state(3, 1000);
        st.metrics().record_call(5, true, Some(50));
        let c = client(
            LlmSection {
                token_budget: 100,
                ..settings()
            },
            transport.clone(),
            st,
        );
        assert!(c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .is_ok());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(503, "busy")
                .reply(429, "slow down")
                .reply(200, &ok_body("finally", 3)),
        );
        let st = state(5, 1000);
        let sleeper = Arc::new(RecordingSleeper::new());
        let c = OpenRouterClient::with_transport(
            LlmSection {
                max_retries: 3,
                base_delay_ms: 100,
                ..settings()
            },
            transport.clone(),
            st.clone(),
        )
        .with_sleeper(sleeper.clone());
        let text = c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "finally");
        assert_eq!(transport.calls(), 3);
        assert_eq!(sleeper.delays().len(), 2);
        let snap = st.metrics().snapshot().unwrap();
        assert_eq!(snap.llm_calls, 3);
        assert_eq!(snap.llm_errors, 2);
    }

    #[tokio::test]
    async fn test_max_tokens_resolution() {
        let mut s = settings();
        s.max_tokens_ceiling = 1000;
        s.per_agent_token_limits.insert("small".into(), 300);
        let c = client(s, Arc::new(ScriptedTransport::new()), state(3, 1000));
        assert_eq!(c.resolve_max_tokens(&CompletionOptions::default()), 800);
        assert_eq!(
            c.resolve_max_tokens(&CompletionOptions::for_agent("small").with_max_tokens(900)),
            300
        );
        assert_eq!(
            c.resolve_max_tokens(&CompletionOptions::default().with_max_tokens(5000)),
            1000
        );
    }

    #[tokio::test]
    async fn test_request_carries_resolved_fields() {
        let transport = Arc::new(ScriptedTransport::new().reply(200, &ok_body("x", 1)));
        let c = client(settings(), transport.clone(), state(3, 1000));
        c.complete(
            "model-a",
            &[Message::user("hi")],
            &CompletionOptions::default()
                .with_max_tokens(100)
                .with_temperature(0.7),
        )
        .await
        .unwrap();
        let req = transport.last_request().unwrap();
        assert_eq!(req.model, "model-a");
        assert_eq!(req.max_tokens, 100);
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_missing_choices_is_error() {
        let transport = Arc::new(ScriptedTransport::new().reply(200, r#"{"choices":[]}"#));
        let c = client(settings(), transport, state(3, 1000));
        let err = c
            .complete("m", &[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }
}
