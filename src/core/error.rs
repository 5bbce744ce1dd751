//! 流水线级错误
//!
//! handler 级失败在 handler 边界收敛为结果，不会出现在这里；这里只有使整个运行无法完成的错误。

use thiserror::Error;

use crate::core::state::Run;
use crate::persistence::StoreError;
use crate::validation::SchemaError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// 运行已结束但记录无法写入；`run.status` 为 failed
    #[error("failed to persist run {}: {source}", run.run_id)]
    Persist {
        run: Box<Run>,
        #[source]
        source: StoreError,
    },
}
