use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::{accept_correction, HandlerContext, HandlerError, HandlerOptions, HandlerOutput, TaskHandler};
use crate::core::extract::extract_json_object;
use crate::llm::{CompletionOptions, Message};

const DEFAULT_BRIEF: &str = "a small task tracking web application";

/// 读取 JSON 输入文档并规范化为 {title, features, entities}
pub struct SpecParser;

impl SpecParser {
    fn normalize(raw: Value) -> Result<Value, HandlerError> {
        let Value::Object(mut obj) = raw else {
            return Err(HandlerError::InvalidInput(
                "spec document must be a JSON object".into(),
            ));
        };
        obj.entry("title").or_insert_with(|| json!("untitled"));
        for key in ["features", "entities"] {
            match obj.get(key) {
                Some(Value::Array(_)) => {}
                Some(Value::Null) | None => {
                    obj.insert(key.to_string(), json!([]));
                }
                Some(_) => {
                    return Err(HandlerError::InvalidInput(format!("`{key}` must be an array")))
                }
            }
        }
        Ok(Value::Object(obj))
    }

    async fn draft_with_llm(
        &self,
        options: &HandlerOptions,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let Some(llm) = ctx.llm_for(options) else {
            return Err(HandlerError::InvalidInput(
                "no input document and LLM assistance is disabled".into(),
            ));
        };
        let brief = options.param_str("brief").unwrap_or(DEFAULT_BRIEF);
        let model = ctx.models.select(self.id(), "parse");
        let messages = [
            Message::system("Reply with one JSON object only."),
            Message::user(format!(
                "Write a minimal product spec for {brief} as JSON with keys \
                 title (string), features (array of strings) and entities \
                 (array of {{name, fields: [{{name, type}}]}})."
            )),
        ];
        let opts = CompletionOptions::for_agent(self.id()).with_max_tokens(1000);
        let text = llm.complete(&model, &messages, &opts).await?;
        let raw = extract_json_object(&text).ok_or_else(|| {
            HandlerError::InvalidInput("LLM reply contained no JSON object".into())
        })?;
        Ok(HandlerOutput::ok(Self::normalize(raw)?).with_model(model))
    }
}

#[async_trait]
impl TaskHandler for SpecParser {
    fn id(&self) -> &str {
        "spec-parser"
    }

    fn description(&self) -> &str {
        "parses the input spec document"
    }

    async fn execute(
        &self,
        options: &HandlerOptions,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        if let Some(correction) = &options.correction_from_llm {
            return Ok(accept_correction(correction));
        }
        let Some(path) = &options.input_path else {
            return self.draft_with_llm(options, ctx).await;
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| HandlerError::Input {
                path: path.clone(),
                source,
            })?;
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|e| HandlerError::InvalidInput(format!("{}: {e}", path.display())))?;
        let content = Self::normalize(parsed)?;
        Ok(HandlerOutput::ok(content).with_path(path.display().to_string()))
    }
}
