//! 流水线调度
//!
//! 按配置顺序依次执行 handler：构造选项（runId、输入、上游 content）→ 纠错循环 → 追加结果。
//! 找不到或没有入口的 handler 记为 missing / no-execute，不中断运行。所有 handler 结束后整体写入运行记录与指标快照。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::agents::builtin::register_builtin;
use crate::agents::{HandlerContext, HandlerOptions, HandlerRegistry, Resolution};
use crate::config::AppConfig;
use crate::core::correction::{CorrectionLoop, CorrectionSettings};
use crate::core::error::PipelineError;
use crate::core::state::{HandlerResult, HandlerStatus, Run, RunStatus};
use crate::llm::{LlmClient, ModelSelector, ResilienceState};
use crate::persistence::{ArtifactStore, FileArtifactStore, RunStore};
use crate::validation::OutputValidator;

static LAST_RUN_MILLIS: AtomicU64 = AtomicU64::new(0);

/// `run_<毫秒时间戳>`；同一毫秒内多次生成时递增，保证进程内唯一且单调
pub fn next_run_id() -> String {
    let now = Utc::now().timestamp_millis().max(0) as u64;
    let mut last = LAST_RUN_MILLIS.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(last + 1);
        match LAST_RUN_MILLIS.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return format!("run_{candidate}"),
            Err(actual) => last = actual,
        }
    }
}

pub struct Dispatcher {
    agents: Vec<String>,
    registry: HandlerRegistry,
    correction: CorrectionLoop,
    ctx: HandlerContext,
    store: RunStore,
    resilience: Option<Arc<ResilienceState>>,
    llm_enabled: bool,
    agent_params: HashMap<String, Map<String, Value>>,
}

impl Dispatcher {
    pub fn builder(config: AppConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// 某 agent 的基础选项
    pub fn options_for(&self, agent_id: &str, run_id: &str, input: Option<&Path>) -> HandlerOptions {
        let mut options = HandlerOptions::new(run_id).with_llm(self.llm_enabled);
        if let Some(path) = input {
            options = options.with_input(path);
        }
        if let Some(params) = self.agent_params.get(agent_id) {
            options = options.with_params(params.clone());
        }
        options
    }

    /// 解析并执行单个 agent（流水线与 worker 共用）
    pub async fn run_agent(&self, agent_id: &str, options: HandlerOptions) -> HandlerResult {
        let run_id = options.run_id.clone();
        let handler = match self.registry.resolve(agent_id) {
            Resolution::Found(handler) => handler,
            Resolution::NoExecute => {
                tracing::warn!(agent = agent_id, "handler has no entry point");
                return HandlerResult::unavailable(agent_id, &run_id, HandlerStatus::NoExecute);
            }
            Resolution::Missing => {
                tracing::warn!(agent = agent_id, "handler not found");
                return HandlerResult::unavailable(agent_id, &run_id, HandlerStatus::Missing);
            }
        };
        if let Err(e) = options.check() {
            return HandlerResult::execution_failed(agent_id, &run_id, &e.to_string(), 0);
        }
        self.correction
            .run_with_correction(handler.as_ref(), &options, &self.ctx)
            .await
    }

    pub async fn run_pipeline(&self, input: Option<&Path>) -> Result<Run, PipelineError> {
        let mut run = Run::start(next_run_id());
        tracing::info!(run_id = %run.run_id, agents = self.agents.len(), "run started");

        // 只有成功的 content 会传给下游
        let mut contents: HashMap<&str, Value> = HashMap::new();
        for agent_id in &self.agents {
            let upstream = self
                .registry
                .get(agent_id)
                .and_then(|h| h.upstream().map(str::to_string))
                .and_then(|up| contents.get(up.as_str()).cloned());
            let options = self
                .options_for(agent_id, &run.run_id, input)
                .with_upstream(upstream);

            let result = self.run_agent(agent_id, options).await;
            tracing::info!(
                run_id = %run.run_id,
                agent = %agent_id,
                status = %result.status,
                attempts = result.attempts,
                corrected = result.corrected,
                "handler finished"
            );
            if result.is_ok() {
                contents.insert(agent_id.as_str(), result.content.clone());
            }
            run.push(result);
        }

        run.finish(RunStatus::Completed);
        if let Err(source) = self.store.save(&run) {
            run.finish(RunStatus::Failed);
            tracing::error!(run_id = %run.run_id, error = %source, "failed to persist run");
            return Err(PipelineError::Persist {
                run: Box::new(run),
                source,
            });
        }
        self.persist_metrics();

        tracing::info!(
            run_id = %run.run_id,
            ok = run.count_with(HandlerStatus::Ok),
            error = run.count_with(HandlerStatus::Error),
            "run completed"
        );
        Ok(run)
    }

    /// 指标写入失败不影响运行结果
    fn persist_metrics(&self) {
        let Some(state) = &self.resilience else {
            return;
        };
        match state.metrics().snapshot() {
            Ok(snapshot) => {
                if let Err(e) = self.store.save_metrics(&snapshot) {
                    tracing::warn!(error = %e, "failed to write metrics snapshot");
                }
            }
            Err(e) => tracing::warn!(error = %e, "metrics snapshot unavailable"),
        }
    }
}

/// Dispatcher 构建器：未显式提供的组件按配置创建
pub struct DispatcherBuilder {
    config: AppConfig,
    registry: Option<HandlerRegistry>,
    validator: Option<OutputValidator>,
    llm: Option<Arc<dyn LlmClient>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    resilience: Option<Arc<ResilienceState>>,
    agent_params: HashMap<String, Map<String, Value>>,
}

impl DispatcherBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            validator: None,
            llm: None,
            artifacts: None,
            resilience: None,
            agent_params: HashMap::new(),
        }
    }

    /// 覆盖执行顺序
    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.pipeline.agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_validator(mut self, validator: OutputValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// 用于在运行结束时写出指标快照
    pub fn with_resilience(mut self, state: Arc<ResilienceState>) -> Self {
        self.resilience = Some(state);
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.pipeline.state_dir = dir.into();
        self
    }

    pub fn with_enable_llm(mut self, enabled: bool) -> Self {
        self.config.pipeline.enable_llm = enabled;
        self
    }

    pub fn with_agent_params(mut self, agent_id: impl Into<String>, params: Map<String, Value>) -> Self {
        self.agent_params.insert(agent_id.into(), params);
        self
    }

    pub fn build(self) -> Result<Dispatcher, PipelineError> {
        let agents = self.config.pipeline.agents.clone();
        if agents.is_empty() {
            return Err(PipelineError::Config("pipeline.agents is empty".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = agents.iter().find(|a| !seen.insert(a.as_str())) {
            return Err(PipelineError::Config(format!("agent `{dup}` listed twice")));
        }

        let validator = match self.validator {
            Some(v) => v,
            None => OutputValidator::load_dir(&self.config.pipeline.schemas_dir)?,
        };
        let registry = self.registry.unwrap_or_else(|| {
            let mut registry = HandlerRegistry::new();
            register_builtin(&mut registry);
            registry
        });
        let artifacts = self.artifacts.unwrap_or_else(|| {
            Arc::new(FileArtifactStore::new(&self.config.pipeline.artifacts_dir))
        });
        let models = ModelSelector::from_settings(&self.config.llm);

        let mut correction = CorrectionLoop::new(
            Arc::new(validator),
            CorrectionSettings::from(&self.config.pipeline),
        )
        .with_models(models.clone());
        let mut ctx = HandlerContext::new(artifacts).with_models(models);
        if let Some(llm) = self.llm {
            correction = correction.with_llm(llm.clone());
            ctx = ctx.with_llm(llm);
        }

        Ok(Dispatcher {
            agents,
            registry,
            correction,
            ctx,
            store: RunStore::new(&self.config.pipeline.state_dir),
            resilience: self.resilience,
            llm_enabled: self.config.pipeline.enable_llm,
            agent_params: self.agent_params,
        })
    }
}
