//! 状态定义：周期阶段与对外暴露的循环统计
//!
//! 控制循环内部维护完整状态，外部（健康检查、前端）只读取 LoopStats 快照。

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 控制循环所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Collecting,
    Analyzing,
    Generating,
    Executing,
    Updating,
    HealthCheck,
    Sleeping,
}

impl CyclePhase {
    /// 正常推进顺序；Sleeping 之后回到 Collecting
    pub fn next(self) -> CyclePhase {
        match self {
            CyclePhase::Idle => CyclePhase::Collecting,
            CyclePhase::Collecting => CyclePhase::Analyzing,
            CyclePhase::Analyzing => CyclePhase::Generating,
            CyclePhase::Generating => CyclePhase::Executing,
            CyclePhase::Executing => CyclePhase::Updating,
            CyclePhase::Updating => CyclePhase::HealthCheck,
            CyclePhase::HealthCheck => CyclePhase::Sleeping,
            CyclePhase::Sleeping => CyclePhase::Collecting,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Collecting => "collecting",
            CyclePhase::Analyzing => "analyzing",
            CyclePhase::Generating => "generating",
            CyclePhase::Executing => "executing",
            CyclePhase::Updating => "updating",
            CyclePhase::HealthCheck => "health_check",
            CyclePhase::Sleeping => "sleeping",
        }
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个周期的摘要
#[derive(Clone, Debug, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcomes: usize,
    pub patterns: usize,
    pub patterns_admitted: usize,
    pub proposals: usize,
    pub applied: usize,
    pub failed_applications: usize,
    pub models_updated: usize,
    pub models_failed: usize,
    pub healthy: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 循环统计快照
#[derive(Clone, Debug, Serialize)]
pub struct LoopStats {
    pub phase: CyclePhase,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
    pub proposals_applied_total: u64,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

impl Default for LoopStats {
    fn default() -> Self {
        Self {
            phase: CyclePhase::Idle,
            cycles_completed: 0,
            cycles_failed: 0,
            consecutive_failures: 0,
            proposals_applied_total: 0,
            last_report: None,
            last_error: None,
        }
    }
}
