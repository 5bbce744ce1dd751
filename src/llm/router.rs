//! 模型选择
//!
//! 优先使用配置中 agent → model 的固定映射；否则按任务提示词归类：
//! - 解析 / 分析：分析型模型
//! - 代码 / API / SQL：代码模型
//! - 组件 / UI：前端模型
//! - 其他：免费模型列表第一个

use std::collections::HashMap;

use crate::config::LlmSection;

pub const ANALYSIS_MODEL: &str = "google/gemini-2.0-flash-exp:free";
pub const CODE_MODEL: &str = "kwaipilot/kat-coder-pro:free";
pub const FRONTEND_MODEL: &str = "qwen/qwen3-coder:free";
pub const FALLBACK_MODEL: &str = "x-ai/grok-4.1-fast:free";

/// 任务类型（用于路由决策）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Analysis,
    Code,
    Frontend,
    Default,
}

/// 任务类型检测器
pub struct TaskClassifier;

impl TaskClassifier {
    pub fn classify(hint: &str) -> TaskType {
        let hint = hint.to_lowercase();
        if ["parse", "analyze", "analysis"].iter().any(|k| hint.contains(k)) {
            return TaskType::Analysis;
        }
        if ["code", "api", "sql"].iter().any(|k| hint.contains(k)) {
            return TaskType::Code;
        }
        if ["component", "ui"].iter().any(|k| hint.contains(k)) {
            return TaskType::Frontend;
        }
        TaskType::Default
    }
}

/// 模型选择器
#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    agent_models: HashMap<String, String>,
    free_models: Vec<String>,
}

impl ModelSelector {
    pub fn new(agent_models: HashMap<String, String>, free_models: Vec<String>) -> Self {
        Self {
            agent_models,
            free_models,
        }
    }

    pub fn from_settings(settings: &LlmSection) -> Self {
        Self::new(settings.agent_models.clone(), settings.free_models.clone())
    }

    pub fn select(&self, agent_id: &str, task_hint: &str) -> String {
        if let Some(model) = self.agent_models.get(agent_id) {
            return model.clone();
        }
        match TaskClassifier::classify(task_hint) {
            TaskType::Analysis => ANALYSIS_MODEL.to_string(),
            TaskType::Code => CODE_MODEL.to_string(),
            TaskType::Frontend => FRONTEND_MODEL.to_string(),
            TaskType::Default => self
                .free_models
                .first()
                .cloned()
                .unwrap_or_else(|| FALLBACK_MODEL.to_string()),
        }
    }
}
