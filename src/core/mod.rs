//! 核心层：错误分类、超时、周期状态、优雅关闭

pub mod error;
pub mod shutdown;
pub mod state;

pub use error::{with_timeout, FailureCategory, OptimizerError};
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
pub use state::{CycleReport, CyclePhase, LoopStats};
