//! Conveyor - 多智能体流水线：输出校验、自动纠错与弹性 LLM 调用
//!
//! 模块划分：
//! - **agents**: 任务处理器契约、注册表与内置 handler
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 运行数据模型、纠错循环、流水线调度
//! - **llm**: LLM 客户端（熔断、退避重试、token 预算）、模型选择与 Mock
//! - **observability**: tracing 初始化与调用指标
//! - **persistence**: 运行记录、指标快照与产物存储
//! - **validation**: JSON Schema 子集校验与按 agent 的 schema 注册表
//! - **worker**: 有界并发的 worker 池

pub mod agents;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod persistence;
pub mod validation;
pub mod worker;

pub use crate::core::{Dispatcher, HandlerResult, HandlerStatus, Run, RunStatus};
