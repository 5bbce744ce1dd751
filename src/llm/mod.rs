//! LLM 层：客户端抽象、弹性调用（熔断 / 退避重试 / token 预算）、模型选择与 Mock

pub mod circuit;
pub mod mock;
pub mod openrouter;
pub mod retry;
pub mod router;
pub mod traits;
pub mod transport;

pub use circuit::{CircuitBreaker, ResilienceState};
pub use mock::{MockLlmClient, ScriptedTransport};
pub use openrouter::OpenRouterClient;
pub use retry::{retry_with_backoff, retry_with_backoff_until, RecordingSleeper, RetryConfig, Sleeper, TokioSleeper};
pub use router::{ModelSelector, TaskClassifier, TaskType};
pub use traits::{CompletionOptions, ErrorClass, LlmClient, LlmError, Message, Role};
pub use transport::{ChatRequest, ChatTransport, HttpTransport, TransportResponse};
