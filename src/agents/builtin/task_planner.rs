use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::builtin::{entity_names, slug};
use crate::agents::{accept_correction, HandlerContext, HandlerError, HandlerOptions, HandlerOutput, TaskHandler};

/// 从解析后的 spec 生成任务列表
pub struct TaskPlanner;

impl TaskPlanner {
    fn plan(spec: Option<&Value>) -> Vec<Value> {
        let mut titles = vec!["setup_project".to_string()];
        if let Some(spec) = spec {
            titles.extend(entity_names(spec).iter().map(|e| format!("model_{}", slug(e))));
            if let Some(features) = spec.get("features").and_then(Value::as_array) {
                titles.extend(
                    features
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|f| format!("implement_{}", slug(f))),
                );
            }
        }
        titles.push("write_tests".to_string());

        titles
            .into_iter()
            .enumerate()
            .map(|(idx, title)| {
                let deps: Vec<usize> = if idx == 0 { vec![] } else { vec![1] };
                json!({"taskId": idx + 1, "title": title, "dependencies": deps})
            })
            .collect()
    }
}

#[async_trait]
impl TaskHandler for TaskPlanner {
    fn id(&self) -> &str {
        "task-planner"
    }

    fn description(&self) -> &str {
        "plans tasks from the parsed spec"
    }

    fn upstream(&self) -> Option<&str> {
        Some("spec-parser")
    }

    async fn execute(
        &self,
        options: &HandlerOptions,
        _ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        if let Some(correction) = &options.correction_from_llm {
            return Ok(accept_correction(correction));
        }
        let tasks = Self::plan(options.upstream.as_ref());
        Ok(HandlerOutput::ok(json!({ "tasks": tasks })))
    }
}
