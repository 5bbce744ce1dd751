//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONVEYOR__*` 覆盖（双下划线表示嵌套，如 `CONVEYOR__CIRCUIT__THRESHOLD=5`），
//! 最后叠加兼容旧部署的扁平变量（`OPENROUTER_API_KEY`、`ENABLE_LLM` 等）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

pub use config::ConfigError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub circuit: CircuitSection,
    pub pipeline: PipelineSection,
    pub metrics: MetricsSection,
    pub worker: WorkerSection,
}

/// [llm] 段：端点、凭证、重试与 token 上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 未配置时在首次调用时报配置错误（不重试）
    pub api_key: Option<String>,
    pub api_url: String,
    /// 可选的 HTTP-Referer 头，未配置时不发送
    pub referer: Option<String>,
    /// 单次网络请求超时（秒）
    pub request_timeout_secs: u64,
    pub temperature: f32,
    /// 调用方未指定 max_tokens 时的请求值
    pub default_max_tokens: u32,
    /// 全局单次调用上限
    pub max_tokens_ceiling: u32,
    /// 进程级 token 总预算，0 表示不限
    pub token_budget: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// false 时遇到永久性错误（400/401/403）立即放弃重试
    pub retry_permanent_errors: bool,
    pub free_models: Vec<String>,
    /// agent → model
    pub agent_models: HashMap<String, String>,
    /// agent → 单次 token 上限，键 `default` 为兜底
    pub per_agent_token_limits: HashMap<String, u32>,
}

pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

fn default_free_models() -> Vec<String> {
    vec![
        "x-ai/grok-4.1-fast:free".into(),
        "google/gemini-2.0-flash-exp:free".into(),
        "kwaipilot/kat-coder-pro:free".into(),
        "qwen/qwen3-coder:free".into(),
    ]
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            referer: None,
            request_timeout_secs: 60,
            temperature: 0.2,
            default_max_tokens: 800,
            max_tokens_ceiling: 4000,
            token_budget: 0,
            max_retries: 3,
            base_delay_ms: 1000,
            retry_permanent_errors: true,
            free_models: default_free_models(),
            agent_models: HashMap::new(),
            per_agent_token_limits: HashMap::from([("default".to_string(), 1500)]),
        }
    }
}

impl LlmSection {
    /// 某 agent 的单次 token 上限；未单独配置时取 `default` 键，再无则 1500
    pub fn agent_token_limit(&self, agent_id: Option<&str>) -> u32 {
        agent_id
            .and_then(|id| self.per_agent_token_limits.get(id))
            .or_else(|| self.per_agent_token_limits.get("default"))
            .copied()
            .unwrap_or(1500)
    }
}

/// [circuit] 段：熔断阈值与冷却时间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    pub threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown_ms: 30_000,
        }
    }
}

/// [pipeline] 段：agent 顺序、状态目录、纠错开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub agents: Vec<String>,
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    /// 存放 `<agent>-output.schema.json` 的目录，不存在时只用通用 schema
    pub schemas_dir: PathBuf,
    pub enable_llm: bool,
    pub local_retries: u32,
    pub correction_max_tokens: u32,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            agents: crate::agents::builtin::DEFAULT_PIPELINE
                .iter()
                .map(|s| s.to_string())
                .collect(),
            state_dir: PathBuf::from("state"),
            artifacts_dir: PathBuf::from("artifacts"),
            schemas_dir: PathBuf::from("schemas"),
            enable_llm: false,
            local_retries: 2,
            correction_max_tokens: 1500,
        }
    }
}

/// [metrics] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    /// 延迟 / token 样本环形缓冲大小
    pub sample_window: usize,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { sample_window: 50 }
    }
}

/// [worker] 段：并行模式下的并发数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub concurrency: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// 从 config 目录加载配置，环境变量 CONVEYOR__* 与扁平旧变量可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 CONVEYOR__*（双下划线表示嵌套键）
/// 4. 最后应用 OPENROUTER_API_KEY / ENABLE_LLM 等扁平变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONVEYOR")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    Ok(cfg)
}

/// 应用扁平环境变量；`lookup` 便于测试注入
pub fn apply_env_overrides<F>(cfg: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = lookup("OPENROUTER_API_KEY").filter(|k| !k.trim().is_empty()) {
        cfg.llm.api_key = Some(key);
    }
    if let Some(url) = lookup("OPENROUTER_API_URL").filter(|u| !u.trim().is_empty()) {
        cfg.llm.api_url = url;
    }
    if let Some(v) = lookup("OPENROUTER_TOTAL_TOKEN_BUDGET") {
        cfg.llm.token_budget = parse_env("OPENROUTER_TOTAL_TOKEN_BUDGET", &v)?;
    }
    if let Some(v) = lookup("CIRCUIT_THRESHOLD") {
        cfg.circuit.threshold = parse_env("CIRCUIT_THRESHOLD", &v)?;
    }
    if let Some(v) = lookup("CIRCUIT_COOLDOWN_MS") {
        cfg.circuit.cooldown_ms = parse_env("CIRCUIT_COOLDOWN_MS", &v)?;
    }
    if let Some(v) = lookup("ENABLE_LLM") {
        cfg.pipeline.enable_llm = matches!(v.trim(), "1" | "true");
    }
    if let Some(v) = lookup("WORKER_CONCURRENCY") {
        cfg.worker.concurrency = parse_env("WORKER_CONCURRENCY", &v)?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Message(format!("{key}: invalid value '{value}'")))
}
