//! 核心编排层：运行数据模型、JSON 提取、纠错循环、流水线调度

pub mod correction;
pub mod dispatcher;
pub mod error;
pub mod extract;
pub mod state;

pub use correction::{CorrectionLoop, CorrectionSettings};
pub use dispatcher::{next_run_id, Dispatcher, DispatcherBuilder};
pub use error::PipelineError;
pub use extract::{extract_json_object, strip_code_fence};
pub use state::{HandlerResult, HandlerStatus, ResultMetadata, Run, RunStatus};
