//! Worker 池：并行执行彼此独立的 agent 任务
//!
//! 每个任务 `{agent_id, run_id, params}` 经 Dispatcher 的纠错循环执行；Semaphore 限制并发数。
//! 所有任务共享同一个 Dispatcher，因而共享同一份熔断 / 指标状态（内部加锁串行化更新）。

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{Dispatcher, HandlerResult};

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub agent_id: String,
    pub run_id: String,
    pub input_path: Option<PathBuf>,
    pub params: Map<String, Value>,
}

impl Job {
    pub fn new(agent_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            id: format!("job_{}", uuid::Uuid::new_v4().simple()),
            agent_id: agent_id.into(),
            run_id: run_id.into(),
            input_path: None,
            params: Map::new(),
        }
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_path = Some(path.into());
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone)]
pub enum JobState {
    Completed(HandlerResult),
    /// 取得执行许可前已取消
    Cancelled,
    /// 任务 panic
    Crashed(String),
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub agent_id: String,
    pub state: JobState,
}

impl JobOutcome {
    pub fn result(&self) -> Option<&HandlerResult> {
        match &self.state {
            JobState::Completed(r) => Some(r),
            _ => None,
        }
    }
}

pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(dispatcher: Arc<Dispatcher>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            dispatcher,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(dispatcher: Arc<Dispatcher>, cfg: &AppConfig) -> Self {
        Self::new(dispatcher, cfg.worker.concurrency)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 取消后尚未开始的任务直接返回 Cancelled，进行中的任务照常完成
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 执行全部任务，结果按提交顺序返回
    pub async fn run_all(&self, jobs: Vec<Job>) -> Vec<JobOutcome> {
        tracing::info!(jobs = jobs.len(), concurrency = self.concurrency, "worker pool started");
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let meta = (job.id.clone(), job.agent_id.clone());
                let handle = tokio::spawn(Self::process(
                    self.dispatcher.clone(),
                    self.semaphore.clone(),
                    self.cancel.clone(),
                    job,
                ));
                (meta, handle)
            })
            .collect();

        let (metas, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        join_all(handles)
            .await
            .into_iter()
            .zip(metas)
            .map(|(joined, (job_id, agent_id))| {
                let state = match joined {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::error!(job_id = %job_id, agent = %agent_id, error = %e, "job crashed");
                        JobState::Crashed(e.to_string())
                    }
                };
                JobOutcome {
                    job_id,
                    agent_id,
                    state,
                }
            })
            .collect()
    }

    async fn process(
        dispatcher: Arc<Dispatcher>,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
        job: Job,
    ) -> JobState {
        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            tracing::info!(job_id = %job.id, agent = %job.agent_id, "job cancelled");
            return JobState::Cancelled;
        };
        if cancel.is_cancelled() {
            return JobState::Cancelled;
        }

        tracing::info!(job_id = %job.id, agent = %job.agent_id, run_id = %job.run_id, "job started");
        let mut options = dispatcher
            .options_for(&job.agent_id, &job.run_id, job.input_path.as_deref())
            .with_task_id(job.id.clone());
        if !job.params.is_empty() {
            options = options.with_params(job.params);
        }
        let result = dispatcher.run_agent(&job.agent_id, options).await;
        tracing::info!(job_id = %job.id, agent = %job.agent_id, status = %result.status, "job finished");
        JobState::Completed(result)
    }
}
