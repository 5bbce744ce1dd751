//! 指数退避重试
//!
//! 第 n 次失败后等待 `base × 2^(n-1)` 毫秒，±10% 抖动；最后一次失败原样返回给调用方。
//! 熔断打开、预算耗尽、缺少凭证属于本地拒绝，不重试。
//! 调用方可传入 `halt`：失败后若它返回 true（如熔断刚被本次失败打开），不再等待，直接返回本次的真实错误。

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::llm::{ErrorClass, LlmError};

/// 抖动比例（±10%）
pub const JITTER_RATIO: f64 = 0.1;

/// 重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// false 时对 `ErrorClass::Permanent` 立即放弃
    pub retry_permanent: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            retry_permanent: true,
        }
    }
}

/// 退避等待的注入点：生产用 tokio 计时器，测试记录延迟序列而不真正等待
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// 只记录请求的等待时长，立即返回
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(d) => d.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        match self.delays.lock() {
            Ok(mut d) => d.push(delay),
            Err(poisoned) => poisoned.into_inner().push(delay),
        }
    }
}

/// 第 `attempt` 次失败后的等待时长（attempt 从 1 开始）
pub fn backoff_delay(base_delay_ms: u64, attempt: u32) -> Duration {
    let exp = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
    let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
    Duration::from_millis((exp as f64 * factor).round() as u64)
}

/// 执行 `op` 直至成功或达到上限；`op` 收到当前尝试序号（从 1 开始）
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    sleeper: &dyn Sleeper,
    op: F,
) -> Result<T, LlmError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    retry_with_backoff_until(config, sleeper, || false, op).await
}

/// 同 [`retry_with_backoff`]，每次失败后先询问 `halt`，为 true 时放弃剩余尝试
pub async fn retry_with_backoff_until<T, H, F, Fut>(
    config: &RetryConfig,
    sleeper: &dyn Sleeper,
    halt: H,
    mut op: F,
) -> Result<T, LlmError>
where
    H: Fn() -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let give_up = attempt >= max_attempts
                    || err.is_fail_fast()
                    || (!config.retry_permanent && err.class() == ErrorClass::Permanent);
                if give_up {
                    return Err(err);
                }
                if halt() {
                    tracing::warn!(attempt, error = %err, "LLM retries halted");
                    return Err(err);
                }
                let delay = backoff_delay(config.base_delay_ms, attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "LLM call failed, backing off"
                );
                sleeper.sleep(delay).await;
            }
        }
    }
}
