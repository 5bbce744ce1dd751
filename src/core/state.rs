//! 运行数据模型：Run 与 HandlerResult
//!
//! Run 在运行期间只由 Dispatcher 持有并追加结果；持久化层只做序列化 / 反序列化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::{HandlerOutput, STATUS_OK};
use crate::validation::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerStatus {
    Ok,
    Error,
    Missing,
    NoExecute,
}

impl HandlerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerStatus::Ok => "ok",
            HandlerStatus::Error => "error",
            HandlerStatus::Missing => "missing",
            HandlerStatus::NoExecute => "no-execute",
        }
    }
}

impl std::fmt::Display for HandlerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub agent_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub model_used: Option<String>,
}

/// 单个 handler 的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResult {
    pub agent_id: String,
    pub status: HandlerStatus,
    pub content: Value,
    #[serde(default)]
    pub path: Option<String>,
    pub metadata: ResultMetadata,
    /// handler 实际被调用的次数（含纠错调用）
    #[serde(default)]
    pub attempts: u32,
    /// 是否采用了 LLM 纠错
    #[serde(default)]
    pub corrected: bool,
}

impl HandlerResult {
    fn base(agent_id: &str, run_id: &str, status: HandlerStatus, content: Value) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status,
            content,
            path: None,
            metadata: ResultMetadata {
                agent_id: agent_id.to_string(),
                run_id: run_id.to_string(),
                timestamp: Utc::now(),
                model_used: None,
            },
            attempts: 0,
            corrected: false,
        }
    }

    /// 由已通过校验的 handler 输出构造
    pub fn from_output(
        agent_id: &str,
        run_id: &str,
        output: HandlerOutput,
        attempts: u32,
        corrected: bool,
    ) -> Self {
        let status = if output.status == STATUS_OK {
            HandlerStatus::Ok
        } else {
            HandlerStatus::Error
        };
        let mut result = Self::base(agent_id, run_id, status, output.content);
        result.path = output.path;
        result.metadata.model_used = output.model;
        result.attempts = attempts;
        result.corrected = corrected;
        result
    }

    pub fn validation_failed(
        agent_id: &str,
        run_id: &str,
        errors: &[ValidationError],
        attempts: u32,
    ) -> Self {
        let content = json!({"note": "validation_failed", "errors": errors});
        let mut result = Self::base(agent_id, run_id, HandlerStatus::Error, content);
        result.attempts = attempts;
        result
    }

    pub fn execution_failed(agent_id: &str, run_id: &str, error: &str, attempts: u32) -> Self {
        let content = json!({"note": "execution_failed", "error": error});
        let mut result = Self::base(agent_id, run_id, HandlerStatus::Error, content);
        result.attempts = attempts;
        result
    }

    /// 找不到 handler（Missing）或没有入口（NoExecute）
    pub fn unavailable(agent_id: &str, run_id: &str, status: HandlerStatus) -> Self {
        let content = json!({"note": status.as_str()});
        Self::base(agent_id, run_id, status, content)
    }

    /// 首次调用之后的重调用次数
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn is_ok(&self) -> bool {
        self.status == HandlerStatus::Ok
    }
}

/// 一次流水线执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// 最近一次状态变化的时间
    pub timestamp: DateTime<Utc>,
    pub results: Vec<HandlerResult>,
}

impl Run {
    pub fn start(run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            timestamp: now,
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, result: HandlerResult) {
        self.timestamp = Utc::now();
        self.results.push(result);
    }

    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.timestamp = now;
    }

    pub fn result(&self, agent_id: &str) -> Option<&HandlerResult> {
        self.results.iter().find(|r| r.agent_id == agent_id)
    }

    pub fn count_with(&self, status: HandlerStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}
