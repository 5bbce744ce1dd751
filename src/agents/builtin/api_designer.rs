use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::builtin::{entity_names, slug};
use crate::agents::{accept_correction, HandlerContext, HandlerError, HandlerOptions, HandlerOutput, TaskHandler};
use crate::llm::{CompletionOptions, Message};

/// 为每个实体生成 REST 端点；参数 `generate_code=true` 且启用 LLM 时附带生成的路由代码
pub struct ApiDesigner;

impl ApiDesigner {
    fn endpoints(spec: Option<&Value>) -> Vec<Value> {
        let names = spec.map(entity_names).unwrap_or_default();
        let mut endpoints = vec![json!({"method": "GET", "path": "/health", "description": "liveness probe"})];
        for name in names {
            let base = format!("/{}s", slug(&name));
            let item = format!("{base}/{{id}}");
            endpoints.push(json!({"method": "GET", "path": base, "description": format!("list {name}")}));
            endpoints.push(json!({"method": "POST", "path": base, "description": format!("create {name}")}));
            endpoints.push(json!({"method": "GET", "path": item, "description": format!("fetch {name}")}));
            endpoints.push(json!({"method": "PUT", "path": item, "description": format!("update {name}")}));
            endpoints.push(json!({"method": "DELETE", "path": item, "description": format!("delete {name}")}));
        }
        endpoints
    }
}

#[async_trait]
impl TaskHandler for ApiDesigner {
    fn id(&self) -> &str {
        "api-designer"
    }

    fn description(&self) -> &str {
        "lists REST endpoints for spec entities"
    }

    fn upstream(&self) -> Option<&str> {
        Some("spec-parser")
    }

    async fn execute(
        &self,
        options: &HandlerOptions,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        if let Some(correction) = &options.correction_from_llm {
            return Ok(accept_correction(correction));
        }
        let endpoints = Self::endpoints(options.upstream.as_ref());
        let mut content = json!({ "endpoints": endpoints });
        let mut model_used = None;

        if options.param_bool("generate_code") {
            if let Some(llm) = ctx.llm_for(options) {
                let model = ctx.models.select(self.id(), "api_code");
                let messages = [Message::user(format!(
                    "Generate HTTP route handlers for these endpoints: {}",
                    content["endpoints"]
                ))];
                let opts = CompletionOptions::for_agent(self.id()).with_max_tokens(2000);
                match llm.complete(&model, &messages, &opts).await {
                    Ok(code) => {
                        content["generatedCode"] = Value::String(code);
                        model_used = Some(model);
                    }
                    Err(e) => tracing::warn!(agent = self.id(), error = %e, "code generation failed"),
                }
            }
        }

        let bytes = serde_json::to_vec_pretty(&content)
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        let path = ctx.store.save(&options.run_id, "api.json", &bytes)?;
        let mut out = HandlerOutput::ok(content).with_path(path);
        out.model = model_used;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoints_per_entity() {
        let spec = json!({"entities": ["user", {"name": "Blog Post"}]});
        let out = ApiDesigner
            .execute(
                &HandlerOptions::new("r").with_upstream(Some(spec)),
                &HandlerContext::default(),
            )
            .await
            .unwrap();
        let endpoints = out.content["endpoints"].as_array().unwrap();
        assert_eq!(endpoints.len(), 11);
        assert!(endpoints.iter().any(|e| e["path"] == "/blog_posts/{id}" && e["method"] == "DELETE"));
        assert!(out.content.get("generatedCode").is_none());
    }

    #[tokio::test]
    async fn test_no_upstream_only_health() {
        let out = ApiDesigner
            .execute(&HandlerOptions::new("r"), &HandlerContext::default())
            .await
            .unwrap();
        assert_eq!(out.content["endpoints"].as_array().unwrap().len(), 1);
    }
}
