//! Agent（任务处理器）
//!
//! 每个 handler 实现统一的 `TaskHandler::execute(options, ctx)` 契约，由 HandlerRegistry 按 id 注册；
//! Dispatcher 通过 HandlerContext 注入产物存储与 LLM 客户端。

pub mod builtin;
pub mod handler;
pub mod registry;

pub use handler::{
    accept_correction, HandlerContext, HandlerError, HandlerOptions, HandlerOutput, TaskHandler,
    STATUS_ERROR, STATUS_OK,
};
pub use registry::{HandlerRegistry, Resolution};
