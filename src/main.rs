//! Conveyor 命令行入口
//!
//! 用法：`conveyor [--config <file>] [--parallel a,b,..] [input.json]`。
//! 默认按配置顺序执行一次流水线；`--parallel` 把列出的 agent 作为独立任务交给 worker 池并行执行（不传递上游 content）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use conveyor::config::load_config;
use conveyor::core::next_run_id;
use conveyor::llm::{OpenRouterClient, ResilienceState};
use conveyor::observability;
use conveyor::validation::OutputValidator;
use conveyor::worker::{Job, JobState, WorkerPool};
use conveyor::Dispatcher;

/// Conveyor：按配置顺序执行 agent 流水线，校验并纠正每个输出
#[derive(Debug, Parser)]
#[command(name = "conveyor", version, about, long_about = None)]
struct CliArgs {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 逗号分隔的 agent 列表，作为独立任务交给 worker 池并行执行
    #[arg(short, long, value_delimiter = ',', value_parser = agent_id)]
    parallel: Vec<String>,

    /// 输入文档（JSON）
    input: Option<PathBuf>,
}

fn agent_id(raw: &str) -> Result<String, String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err("agent id must not be empty".into());
    }
    Ok(id.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args = CliArgs::parse();
    let cfg = load_config(args.config.clone()).context("Failed to load configuration")?;

    let schemas_dir = cfg.pipeline.schemas_dir.clone();
    let validator = OutputValidator::load_dir(&schemas_dir)
        .with_context(|| format!("Invalid output schema in {}", schemas_dir.display()))?;

    let state = ResilienceState::from_config(&cfg);
    let mut builder = Dispatcher::builder(cfg.clone())
        .with_validator(validator)
        .with_resilience(state.clone());
    match OpenRouterClient::from_config(&cfg, state) {
        Ok(client) => builder = builder.with_llm(Arc::new(client)),
        Err(e) => tracing::warn!(error = %e, "LLM client unavailable, running without it"),
    }
    let dispatcher = builder.build().context("Failed to build pipeline")?;

    if !args.parallel.is_empty() {
        return run_parallel(Arc::new(dispatcher), &cfg, &args).await;
    }

    let run = dispatcher
        .run_pipeline(args.input.as_deref())
        .await
        .context("Pipeline run failed")?;

    println!("run {} ({:?})", run.run_id, run.status);
    for result in &run.results {
        let marker = if result.is_ok() { "✓" } else { "✗" };
        println!(
            "  {marker} {:<18} {:<10} attempts={} corrected={}",
            result.agent_id, result.status, result.attempts, result.corrected
        );
    }
    println!("state: {}", dispatcher.store().run_path(&run.run_id).display());
    Ok(())
}

async fn run_parallel(
    dispatcher: Arc<Dispatcher>,
    cfg: &conveyor::config::AppConfig,
    args: &CliArgs,
) -> anyhow::Result<()> {
    let run_id = next_run_id();
    let jobs: Vec<Job> = args
        .parallel
        .iter()
        .map(|agent| {
            let job = Job::new(agent.as_str(), run_id.as_str());
            match &args.input {
                Some(path) => job.with_input(path),
                None => job,
            }
        })
        .collect();
    let pool = WorkerPool::from_config(dispatcher, cfg);
    println!("run {run_id} (parallel, concurrency={})", pool.concurrency());
    for outcome in pool.run_all(jobs).await {
        match &outcome.state {
            JobState::Completed(r) => println!(
                "  {} {:<18} {:<10} attempts={}",
                outcome.job_id, r.agent_id, r.status, r.attempts
            ),
            JobState::Cancelled => println!("  {} {:<18} cancelled", outcome.job_id, outcome.agent_id),
            JobState::Crashed(e) => println!("  {} {:<18} crashed: {e}", outcome.job_id, outcome.agent_id),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(v: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("conveyor").chain(v.iter().copied()))
    }

    #[test]
    fn test_parse_args() {
        let a = parse(&["--config", "c.toml", "spec.json"]).unwrap();
        assert_eq!(a.config, Some(PathBuf::from("c.toml")));
        assert_eq!(a.input, Some(PathBuf::from("spec.json")));
        assert!(a.parallel.is_empty());
        assert!(parse(&[]).unwrap().input.is_none());
        assert!(parse(&["--verbose"]).is_err());
        assert!(parse(&["a.json", "b.json"]).is_err());
        assert!(parse(&["--config"]).is_err());
    }

    #[test]
    fn test_parse_parallel_list() {
        let p = parse(&["-p", "task-planner, api-designer", "-c", "x.toml"]).unwrap();
        assert_eq!(p.parallel, vec!["task-planner", "api-designer"]);
        assert_eq!(p.config, Some(PathBuf::from("x.toml")));
        let p = parse(&["--parallel", "bootstrap", "--parallel", "spec-parser"]).unwrap();
        assert_eq!(p.parallel, vec!["bootstrap", "spec-parser"]);
        assert!(parse(&["--parallel"]).is_err());
        assert!(agent_id("  ").is_err());
        assert_eq!(agent_id(" api-designer ").unwrap(), "api-designer");
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }
}
