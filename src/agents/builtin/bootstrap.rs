use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::agents::{accept_correction, HandlerContext, HandlerError, HandlerOptions, HandlerOutput, TaskHandler};

/// 记录运行开始
pub struct Bootstrap;

#[async_trait]
impl TaskHandler for Bootstrap {
    fn id(&self) -> &str {
        "bootstrap"
    }

    fn description(&self) -> &str {
        "records the start of a run"
    }

    async fn execute(
        &self,
        options: &HandlerOptions,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        if let Some(correction) = &options.correction_from_llm {
            return Ok(accept_correction(correction));
        }
        let content = json!({
            "runId": options.run_id,
            "startedAt": Utc::now().to_rfc3339(),
            "status": "started",
            "input": options.input_path.as_ref().map(|p| p.display().to_string()),
        });
        let bytes = serde_json::to_vec_pretty(&content)
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        let path = ctx.store.save(&options.run_id, "bootstrap.json", &bytes)?;
        Ok(HandlerOutput::ok(content).with_path(path))
    }
}
