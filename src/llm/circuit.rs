//! 熔断器与共享弹性状态
//!
//! 连续失败达到阈值后打开 `cooldown`，期间所有新调用直接失败、不发网络请求；
//! 任一成功调用立即复位。冷却结束后放行下一次调用，若再失败则立即重新打开。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::observability::MetricsRecorder;

/// 熔断器状态
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            open_until: None,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// 打开期间返回剩余冷却时间
    pub fn remaining_open(&self, now: Instant) -> Option<Duration> {
        self.open_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    /// 记录失败；本次是否使熔断打开
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.threshold {
            self.open_until = Some(now + self.cooldown);
            return true;
        }
        false
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.remaining_open(now).is_some()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(30_000))
    }
}

/// 进程级弹性状态：熔断器 + 指标；所有 LLM 客户端实例共享同一个 Arc
#[derive(Debug)]
pub struct ResilienceState {
    circuit: Mutex<CircuitBreaker>,
    metrics: MetricsRecorder,
}

impl ResilienceState {
    pub fn new(circuit: CircuitBreaker, metrics: MetricsRecorder) -> Self {
        Self {
            circuit: Mutex::new(circuit),
            metrics,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Arc<Self> {
        Arc::new(Self::new(
            CircuitBreaker::new(
                cfg.circuit.threshold,
                Duration::from_millis(cfg.circuit.cooldown_ms),
            ),
            MetricsRecorder::new(cfg.metrics.sample_window),
        ))
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// 熔断器快照（只读）
    pub fn circuit(&self) -> CircuitBreaker {
        self.lock_circuit().clone()
    }

    pub fn remaining_open(&self) -> Option<Duration> {
        self.lock_circuit().remaining_open(Instant::now())
    }

    /// 成功：复位熔断并记录延迟与 token
    pub fn record_success(&self, latency_ms: u64, tokens: Option<u64>) {
        self.lock_circuit().record_success();
        self.metrics.record_call(latency_ms, true, tokens);
    }

    /// 失败：累加熔断计数并记录错误
    pub fn record_failure(&self, latency_ms: u64) {
        {
            let mut circuit = self.lock_circuit();
            if circuit.record_failure(Instant::now()) {
                tracing::warn!(
                    failures = circuit.consecutive_failures(),
                    cooldown_ms = circuit.cooldown.as_millis() as u64,
                    "circuit opened"
                );
            }
        }
        self.metrics.record_call(latency_ms, false, None);
    }

    /// 熔断状态只由成功调用或进程重启复位；此方法用于测试
    pub fn reset(&self) {
        self.lock_circuit().record_success();
        self.metrics.reset();
    }

    fn lock_circuit(&self) -> MutexGuard<'_, CircuitBreaker> {
        match self.circuit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ResilienceState {
    fn default() -> Self {
        Self::new(CircuitBreaker::default(), MetricsRecorder::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_exactly_at_threshold() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60));
        let now = Instant::now();
        assert!(!cb.record_failure(now));
        assert!(!cb.is_open(now));
        assert!(!cb.record_failure(now));
        assert!(!cb.is_open(now));
        assert!(cb.record_failure(now));
        assert!(cb.is_open(now));
        assert_eq!(cb.consecutive_failures(), 3);
    }

    #[test]
    fn test_success_resets() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(60));
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        assert!(cb.is_open(now));
        cb.record_success();
        assert!(!cb.is_open(now));
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_cooldown_elapses() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(100));
        let now = Instant::now();
        cb.record_failure(now);
        assert!(cb.is_open(now + Duration::from_millis(50)));
        assert!(!cb.is_open(now + Duration::from_millis(150)));
    }

    #[test]
    fn test_failure_after_cooldown_reopens_immediately() {
        let mut cb = CircuitBreaker::new(2, Duration::from_millis(100));
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        let later = now + Duration::from_millis(200);
        assert!(!cb.is_open(later));
        assert!(cb.record_failure(later));
        assert!(cb.is_open(later));
    }

    #[test]
    fn test_state_records_metrics() {
        let state = ResilienceState::default();
        state.record_failure(10);
        state.record_success(20, Some(7));
        let snap = state.metrics().snapshot().unwrap();
        assert_eq!(snap.llm_calls, 2);
        assert_eq!(snap.llm_errors, 1);
        assert_eq!(snap.total_tokens, 7);
        assert_eq!(state.circuit().consecutive_failures(), 0);
    }
}
