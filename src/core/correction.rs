//! 纠错循环
//!
//! 单个 handler 的状态机：首次调用 → 最多 `local_retries` 次本地重试（仅递增 retry_attempt）
//! → 仍不合法且启用 LLM 时请求一次纠错并带着纠错结果再调用一次 → 否则终态 error。
//! 每个 handler 最多被调用 `1 + local_retries + 1` 次，`local_retries` 不超过 [`MAX_LOCAL_RETRIES`]。

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use crate::agents::{HandlerContext, HandlerError, HandlerOptions, HandlerOutput, TaskHandler};
use crate::config::PipelineSection;
use crate::core::extract::extract_json_object;
use crate::core::state::HandlerResult;
use crate::llm::{CompletionOptions, LlmClient, Message, ModelSelector};
use crate::validation::{envelope_schema_json, OutputValidator, ValidationError};

/// 本地重试次数上限；配置更大的值会被截断
pub const MAX_LOCAL_RETRIES: u32 = 2;

const CORRECTION_SYSTEM_PROMPT: &str =
    "You are a strict JSON-only formatter. Output exactly one JSON object and nothing else.";

#[derive(Debug, Clone)]
pub struct CorrectionSettings {
    pub enable_llm: bool,
    pub local_retries: u32,
    /// 纠错请求的 max_tokens
    pub max_tokens: u32,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            enable_llm: false,
            local_retries: 2,
            max_tokens: 1500,
        }
    }
}

impl From<&PipelineSection> for CorrectionSettings {
    fn from(p: &PipelineSection) -> Self {
        Self {
            enable_llm: p.enable_llm,
            local_retries: p.local_retries,
            max_tokens: p.correction_max_tokens,
        }
    }
}

/// 最后一次不成功调用的情况
enum Failure {
    Invalid {
        output: HandlerOutput,
        errors: Vec<ValidationError>,
    },
    Execution(HandlerError),
}

pub struct CorrectionLoop {
    validator: Arc<OutputValidator>,
    llm: Option<Arc<dyn LlmClient>>,
    models: ModelSelector,
    settings: CorrectionSettings,
}

impl CorrectionLoop {
    pub fn new(validator: Arc<OutputValidator>, mut settings: CorrectionSettings) -> Self {
        if settings.local_retries > MAX_LOCAL_RETRIES {
            tracing::warn!(
                configured = settings.local_retries,
                max = MAX_LOCAL_RETRIES,
                "local_retries capped"
            );
            settings.local_retries = MAX_LOCAL_RETRIES;
        }
        Self {
            validator,
            llm: None,
            models: ModelSelector::default(),
            settings,
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

    pub fn settings(&self) -> &CorrectionSettings {
        &self.settings
    }

    /// 校验用的信封：status / content / path / metadata
    fn wrap(agent_id: &str, run_id: &str, output: &HandlerOutput) -> Value {
        json!({
            "status": output.status,
            "content": output.content,
            "path": output.path,
            "metadata": {
                "agent": agent_id,
                "runId": run_id,
                "timestamp": Utc::now().to_rfc3339(),
                "model": output.model,
            }
        })
    }

    fn check(&self, agent_id: &str, run_id: &str, output: &HandlerOutput) -> Result<(), Vec<ValidationError>> {
        self.validator
            .validate(agent_id, &Self::wrap(agent_id, run_id, output))
    }

    pub async fn run_with_correction(
        &self,
        handler: &dyn TaskHandler,
        options: &HandlerOptions,
        ctx: &HandlerContext,
    ) -> HandlerResult {
        let agent_id = handler.id();
        let run_id = options.run_id.as_str();
        let mut attempts = 0u32;
        let mut failure = None;

        for retry in 0..=self.settings.local_retries {
            attempts += 1;
            let opts = options.for_retry(retry);
            match handler.execute(&opts, ctx).await {
                Ok(output) => match self.check(agent_id, run_id, &output) {
                    Ok(()) => {
                        tracing::info!(agent = agent_id, attempt = attempts, status = %output.status, "handler output accepted");
                        return HandlerResult::from_output(agent_id, run_id, output, attempts, false);
                    }
                    Err(errors) => {
                        tracing::warn!(agent = agent_id, attempt = attempts, errors = errors.len(), "handler output invalid");
                        failure = Some(Failure::Invalid { output, errors });
                    }
                },
                Err(e) => {
                    tracing::warn!(agent = agent_id, attempt = attempts, error = %e, "handler execution failed");
                    failure = Some(Failure::Execution(e));
                }
            }
        }

        let (output, mut errors) = match failure {
            Some(Failure::Invalid { output, errors }) => (output, errors),
            Some(Failure::Execution(e)) => {
                return HandlerResult::execution_failed(agent_id, run_id, &e.to_string(), attempts)
            }
            None => return HandlerResult::execution_failed(agent_id, run_id, "handler was not invoked", attempts),
        };

        if let Some(correction) = self.request_correction(agent_id, run_id, &output, &errors).await {
            attempts += 1;
            let opts = options.with_correction(correction);
            match handler.execute(&opts, ctx).await {
                Ok(corrected) => match self.check(agent_id, run_id, &corrected) {
                    Ok(()) => {
                        tracing::info!(agent = agent_id, attempt = attempts, "LLM correction accepted");
                        return HandlerResult::from_output(agent_id, run_id, corrected, attempts, true);
                    }
                    Err(new_errors) => {
                        tracing::warn!(agent = agent_id, errors = new_errors.len(), "corrected output still invalid");
                        errors = new_errors;
                    }
                },
                Err(e) => {
                    tracing::warn!(agent = agent_id, error = %e, "handler rejected LLM correction");
                }
            }
        }

        tracing::error!(agent = agent_id, attempts, "validation failed after all recovery paths");
        HandlerResult::validation_failed(agent_id, run_id, &errors, attempts)
    }

    fn correction_messages(
        &self,
        agent_id: &str,
        run_id: &str,
        output: &HandlerOutput,
        errors: &[ValidationError],
    ) -> Vec<Message> {
        let errors_json = serde_json::to_string(errors).unwrap_or_default();
        let previous = serde_json::to_string(&output.content).unwrap_or_default();
        let mut user = format!(
            "Agent: {agent_id}\nRunId: {run_id}\nValidationErrors: {errors_json}\n\
             PreviousOutput: {previous}\nExpectedEnvelope: {}\n",
            envelope_schema_json()
        );
        if self.validator.has_agent_schema(agent_id) {
            user.push_str(&format!("AgentSchema: {}\n", self.validator.schema_source(agent_id)));
        }
        user.push_str("Return the corrected content as a single JSON object.");
        vec![Message::system(CORRECTION_SYSTEM_PROMPT), Message::user(user)]
    }

    /// 请求 LLM 纠错；关闭、无客户端、调用失败或回复中没有对象时返回 None
    async fn request_correction(
        &self,
        agent_id: &str,
        run_id: &str,
        output: &HandlerOutput,
        errors: &[ValidationError],
    ) -> Option<Value> {
        if !self.settings.enable_llm {
            return None;
        }
        let Some(llm) = &self.llm else {
            tracing::debug!(agent = agent_id, "LLM correction enabled but no client configured");
            return None;
        };
        let model = self.models.select(agent_id, "fix");
        let messages = self.correction_messages(agent_id, run_id, output, errors);
        let opts = CompletionOptions::for_agent(agent_id).with_max_tokens(self.settings.max_tokens);

        let text = match llm.complete(&model, &messages, &opts).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(agent = agent_id, model = %model, error = %e, "correction request failed");
                return None;
            }
        };
        let parsed = extract_json_object(&text);
        if parsed.is_none() {
            tracing::warn!(agent = agent_id, model = %model, "correction reply has no JSON object");
        }
        parsed
    }
}
