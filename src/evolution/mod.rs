pub mod analyzer;
pub mod engine;
pub mod events;
pub mod executor;
pub mod loop_;
pub mod planner;
pub mod types;
pub mod updater;

pub use analyzer::{agent_metrics, AnalyzerSettings, PatternAnalyzer};
pub use engine::OptimizerConfig;
pub use events::{EventSink, MemoryEventSink, OptimizerEvent, TracingEventSink};
pub use executor::{
    AppliedChange, ExecutionSummary, ExecutorPolicy, OptimizationImplementer, ParameterImplementer,
    RiskGatedExecutor, TuningTable,
};
pub use loop_::{ControlLoop, CycleTimer, HealthReport, ManualCycleTimer, TokioCycleTimer};
pub use planner::{rank, ImprovementPlanner};
pub use types::{
    confidence, AgentPerformanceMetrics, ApplicationRecord, ApplicationStatus, DetectedPattern, Level,
    OptimizationCategory, Outcome, Pattern, PatternKind, PatternPayload, SystemOptimization,
};
pub use updater::{ModelUpdater, UpdateReport};
