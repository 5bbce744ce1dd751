//! LLM 调用指标
//!
//! 进程级累加器：调用次数、错误次数、延迟样本（环形缓冲）、token 总量与样本。
//! 每次网络尝试（成功或失败）后由 LLM 客户端写入；token 预算检查与报表读取快照。

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metrics recorder unavailable: {0}")]
    Unavailable(String),
}

/// 指标快照（同时也是 state/metrics.json 的格式）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub llm_calls: u64,
    pub llm_errors: u64,
    pub avg_latency_ms: u64,
    pub avg_tokens: u64,
    pub total_tokens: u64,
    pub latency_samples: Vec<u64>,
    pub token_samples: Vec<u64>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    calls: u64,
    errors: u64,
    latency_sum_ms: u64,
    latency_count: u64,
    latency_samples: VecDeque<u64>,
    total_tokens: u64,
    token_sample_count: u64,
    token_samples: VecDeque<u64>,
    last_updated: Option<DateTime<Utc>>,
}

/// 指标记录器：内部 Mutex 串行化所有更新，避免并发下丢失计数
#[derive(Debug)]
pub struct MetricsRecorder {
    window: usize,
    inner: Mutex<MetricsInner>,
}

impl MetricsRecorder {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    /// 记录一次 LLM 调用尝试
    pub fn record_call(&self, latency_ms: u64, ok: bool, tokens: Option<u64>) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.calls += 1;
        if !ok {
            inner.errors += 1;
        }
        inner.latency_sum_ms += latency_ms;
        inner.latency_count += 1;
        push_bounded(&mut inner.latency_samples, latency_ms, self.window);
        if let Some(t) = tokens {
            inner.total_tokens += t;
            inner.token_sample_count += 1;
            push_bounded(&mut inner.token_samples, t, self.window);
        }
        inner.last_updated = Some(Utc::now());
    }

    /// 读取快照；锁中毒视为不可用（预算检查据此拒绝调用）
    pub fn snapshot(&self) -> Result<MetricsSnapshot, MetricsError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| MetricsError::Unavailable(e.to_string()))?;
        Ok(MetricsSnapshot {
            llm_calls: inner.calls,
            llm_errors: inner.errors,
            avg_latency_ms: average(inner.latency_sum_ms, inner.latency_count),
            avg_tokens: average(inner.total_tokens, inner.token_sample_count),
            total_tokens: inner.total_tokens,
            latency_samples: inner.latency_samples.iter().copied().collect(),
            token_samples: inner.token_samples.iter().copied().collect(),
            last_updated: inner.last_updated,
        })
    }

    /// 清零（测试与长驻进程按需重置）
    pub fn reset(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *inner = MetricsInner::default();
    }

    /// 持锁 panic，使内部锁中毒
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.inner.lock();
            panic!("metrics lock poisoned on purpose");
        }));
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(50)
    }
}

fn push_bounded(buf: &mut VecDeque<u64>, value: u64, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

fn average(sum: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        (sum as f64 / count as f64).round() as u64
    }
}
