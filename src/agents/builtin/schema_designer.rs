use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::builtin::slug;
use crate::agents::{accept_correction, HandlerContext, HandlerError, HandlerOptions, HandlerOutput, TaskHandler};
use crate::llm::{CompletionOptions, Message};

const FALLBACK_TABLE: &str = "records";

/// 从 spec 实体生成 SQL DDL；参数 `enhance=true` 且启用 LLM 时请求模型补充约束与索引
pub struct SchemaDesigner;

fn sql_type(declared: Option<&str>) -> &'static str {
    match declared.map(str::to_ascii_lowercase).as_deref() {
        Some("int" | "integer") => "INTEGER",
        Some("number" | "float" | "decimal") => "REAL",
        Some("bool" | "boolean") => "BOOLEAN",
        Some("date" | "datetime" | "timestamp") => "TIMESTAMP",
        _ => "TEXT",
    }
}

impl SchemaDesigner {
    /// 返回 (DDL, 表名列表)
    fn ddl(spec: Option<&Value>) -> (String, Vec<String>) {
        let entities: Vec<&Value> = spec
            .and_then(|s| s.get("entities"))
            .and_then(Value::as_array)
            .map(|items| items.iter().collect())
            .unwrap_or_default();

        let mut statements = Vec::new();
        let mut tables = Vec::new();
        for entity in entities {
            let Some(name) = entity.get("name").and_then(Value::as_str).or_else(|| entity.as_str())
            else {
                continue;
            };
            let table = slug(name);
            let mut columns = vec!["id INTEGER PRIMARY KEY".to_string()];
            if let Some(fields) = entity.get("fields").and_then(Value::as_array) {
                for field in fields {
                    let Some(field_name) = field.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let column = slug(field_name);
                    if column == "id" {
                        continue;
                    }
                    let ty = sql_type(field.get("type").and_then(Value::as_str));
                    columns.push(format!("{column} {ty}"));
                }
            }
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {table} ({});",
                columns.join(", ")
            ));
            tables.push(table);
        }
        if statements.is_empty() {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {FALLBACK_TABLE} (id INTEGER PRIMARY KEY, payload TEXT);"
            ));
            tables.push(FALLBACK_TABLE.to_string());
        }
        (statements.join("\n"), tables)
    }
}

#[async_trait]
impl TaskHandler for SchemaDesigner {
    fn id(&self) -> &str {
        "schema-designer"
    }

    fn description(&self) -> &str {
        "derives SQL tables from spec entities"
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
        let (mut sql, tables) = Self::ddl(options.upstream.as_ref());
        let mut model_used = None;

        if options.param_bool("enhance") {
            if let Some(llm) = ctx.llm_for(options) {
                let model = ctx.models.select(self.id(), "sql");
                let messages = [Message::user(format!(
                    "Enhance this SQL schema with proper constraints and indexes. \
                     Reply with SQL only.\n{sql}"
                ))];
                let opts = CompletionOptions::for_agent(self.id()).with_max_tokens(1000);
                match llm.complete(&model, &messages, &opts).await {
                    Ok(enhanced) if !enhanced.trim().is_empty() => {
                        sql = enhanced;
                        model_used = Some(model);
                    }
                    Ok(_) => tracing::warn!(agent = self.id(), "empty enhancement, keeping basic schema"),
                    Err(e) => {
                        tracing::warn!(agent = self.id(), error = %e, "enhancement failed, keeping basic schema")
                    }
                }
            }
        }

        let path = ctx.store.save(&options.run_id, "schema.sql", sql.as_bytes())?;
        let mut out = HandlerOutput::ok(json!({ "sql": sql, "tables": tables })).with_path(path);
        out.model = model_used;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use std::sync::Arc;

    fn spec() -> Value {
        json!({"entities": [{"name": "Order", "fields": [
            {"name": "id", "type": "int"},
            {"name": "total", "type": "number"},
            {"name": "placed at", "type": "datetime"}
        ]}]})
    }

    #[tokio::test]
    async fn test_ddl_from_entities() {
        let out = SchemaDesigner
            .execute(
                &HandlerOptions::new("r").with_upstream(Some(spec())),
                &HandlerContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            out.content["sql"],
            "CREATE TABLE IF NOT EXISTS order (id INTEGER PRIMARY KEY, total REAL, placed_at TIMESTAMP);"
        );
        assert_eq!(out.content["tables"], json!(["order"]));
        assert_eq!(out.path.as_deref(), Some("memory://r/schema.sql"));
    }

    #[tokio::test]
    async fn test_fallback_table_without_entities() {
        let out = SchemaDesigner
            .execute(&HandlerOptions::new("r"), &HandlerContext::default())
            .await
            .unwrap();
        assert_eq!(out.content["tables"], json!([FALLBACK_TABLE]));
    }

    #[tokio::test]
    async fn test_enhancement_failure_keeps_basic_schema() {
        let mock = Arc::new(MockLlmClient::new().fail(LlmError::Connection("down".into())));
        let ctx = HandlerContext::default().with_llm(mock.clone());
        let mut params = serde_json::Map::new();
        params.insert("enhance".into(), json!(true));
        let options = HandlerOptions::new("r")
            .with_upstream(Some(spec()))
            .with_llm(true)
            .with_params(params);
        let out = SchemaDesigner.execute(&options, &ctx).await.unwrap();
        assert!(out.content["sql"].as_str().unwrap().starts_with("CREATE TABLE"));
        assert!(out.model.is_none());
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_enhancement_replaces_sql() {
        let mock = Arc::new(MockLlmClient::always("CREATE TABLE order (id INTEGER PRIMARY KEY NOT NULL);"));
        let ctx = HandlerContext::default().with_llm(mock);
        let mut params = serde_json::Map::new();
        params.insert("enhance".into(), json!(true));
        let options = HandlerOptions::new("r").with_llm(true).with_params(params);
        let out = SchemaDesigner.execute(&options, &ctx).await.unwrap();
        assert!(out.content["sql"].as_str().unwrap().contains("NOT NULL"));
        assert!(out.model.is_some());
    }
}
