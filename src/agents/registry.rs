//! Handler 注册表
//!
//! 按 id 存储 `Arc<dyn TaskHandler>`。`declare` 只登记 id 不提供实现，用于标记已知但没有入口的 agent，
//! 解析时得到 `NoExecute`；完全未登记的 id 得到 `Missing`。

use std::collections::HashMap;
use std::sync::Arc;

use crate::agents::TaskHandler;

/// 按 id 解析 handler 的结果
#[derive(Clone)]
pub enum Resolution {
    Found(Arc<dyn TaskHandler>),
    NoExecute,
    Missing,
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Option<Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl TaskHandler + 'static) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn TaskHandler>) {
        let id = handler.id().to_string();
        self.handlers.insert(id, Some(handler));
    }

    pub fn declare(&mut self, id: impl Into<String>) {
        self.handlers.entry(id.into()).or_insert(None);
    }

    pub fn resolve(&self, id: &str) -> Resolution {
        match self.handlers.get(id) {
            Some(Some(handler)) => Resolution::Found(handler.clone()),
            Some(None) => Resolution::NoExecute,
            None => Resolution::Missing,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(id).cloned().flatten()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// (id, description) 列表，已排序
    pub fn descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .handlers
            .iter()
            .filter_map(|(id, h)| h.as_ref().map(|h| (id.clone(), h.description().to_string())))
            .collect();
        out.sort();
        out
    }
}
