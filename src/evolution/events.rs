//! 控制循环事件：每次阶段切换、低置信度跳过、提案应用/拒绝、失败都会产出一条结构化事件
//!
//! 组件只依赖 EventSink；生产环境使用 TracingEventSink（JSON 写入 tracing），
//! 测试使用 MemoryEventSink 直接断言事件序列。

use std::sync::Mutex;

use serde::Serialize;

use crate::core::{CyclePhase, FailureCategory};
use crate::evolution::types::{ApplicationStatus, Level, OptimizationCategory, PatternKind};

/// 单条事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerEvent {
    /// 进入新阶段
    PhaseEntered { cycle: u64, phase: CyclePhase },
    /// 拉取到的结果条数
    OutcomesCollected { cycle: u64, count: usize },
    /// 坏记录被跳过
    OutcomeSkipped { record: String, reason: String },
    /// 模式产出
    PatternDetected {
        kind: PatternKind,
        confidence: f64,
        sample_size: usize,
    },
    /// 置信度低于门限，未生成提案
    PatternSkipped {
        kind: PatternKind,
        confidence: f64,
        threshold: f64,
    },
    /// 提案类别不在 optimization_targets 中
    ProposalFiltered {
        component: String,
        category: OptimizationCategory,
    },
    ProposalGenerated {
        component: String,
        category: OptimizationCategory,
        score: f64,
    },
    /// 自动应用成功
    ProposalApplied {
        component: String,
        category: OptimizationCategory,
        previous_value: Option<f64>,
        applied_value: f64,
    },
    /// 未通过风险门，留给人工处理
    ProposalRejected {
        component: String,
        category: OptimizationCategory,
        risk: Level,
        effort: Level,
        impact: Level,
        reason: String,
    },
    ProposalFailed {
        component: String,
        category: OptimizationCategory,
        failure: FailureCategory,
        error: String,
    },
    ProposalRolledBack {
        component: String,
        category: OptimizationCategory,
        restored_value: Option<f64>,
    },
    /// 超出本周期实验上限
    ProposalDeferred {
        component: String,
        category: OptimizationCategory,
        limit: usize,
    },
    /// 审计记录写入失败（不影响后续提案）
    AuditWriteFailed {
        component: String,
        status: ApplicationStatus,
        error: String,
    },
    ModelUpdated { model: &'static str, records: usize },
    ModelUpdateFailed {
        model: &'static str,
        failure: FailureCategory,
        error: String,
    },
    HealthReport {
        cycle: u64,
        store_ok: bool,
        registry_ok: bool,
        consecutive_failures: u32,
    },
    CycleCompleted {
        cycle: u64,
        outcomes: usize,
        proposals: usize,
        applied: usize,
    },
    /// 周期被放弃，之后按恢复间隔重试
    CycleFailed {
        cycle: u64,
        phase: CyclePhase,
        failure: FailureCategory,
        error: String,
    },
    Sleeping { seconds: u64, recovery: bool },
}

impl OptimizerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerEvent::PhaseEntered { .. } => "phase_entered",
            OptimizerEvent::OutcomesCollected { .. } => "outcomes_collected",
            OptimizerEvent::OutcomeSkipped { .. } => "outcome_skipped",
            OptimizerEvent::PatternDetected { .. } => "pattern_detected",
            OptimizerEvent::PatternSkipped { .. } => "pattern_skipped",
            OptimizerEvent::ProposalFiltered { .. } => "proposal_filtered",
            OptimizerEvent::ProposalGenerated { .. } => "proposal_generated",
            OptimizerEvent::ProposalApplied { .. } => "proposal_applied",
            OptimizerEvent::ProposalRejected { .. } => "proposal_rejected",
            OptimizerEvent::ProposalFailed { .. } => "proposal_failed",
            OptimizerEvent::ProposalRolledBack { .. } => "proposal_rolled_back",
            OptimizerEvent::ProposalDeferred { .. } => "proposal_deferred",
            OptimizerEvent::AuditWriteFailed { .. } => "audit_write_failed",
            OptimizerEvent::ModelUpdated { .. } => "model_updated",
            OptimizerEvent::ModelUpdateFailed { .. } => "model_update_failed",
            OptimizerEvent::HealthReport { .. } => "health_report",
            OptimizerEvent::CycleCompleted { .. } => "cycle_completed",
            OptimizerEvent::CycleFailed { .. } => "cycle_failed",
            OptimizerEvent::Sleeping { .. } => "sleeping",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(
            self,
            OptimizerEvent::OutcomeSkipped { .. }
                | OptimizerEvent::ProposalFailed { .. }
                | OptimizerEvent::AuditWriteFailed { .. }
                | OptimizerEvent::ModelUpdateFailed { .. }
                | OptimizerEvent::CycleFailed { .. }
        )
    }
}

/// 结构化事件接收端
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OptimizerEvent);
}

/// 生产实现：每条事件序列化为 JSON，经 tracing 输出；失败类事件用 warn 级别
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: OptimizerEvent) {
        let json = serde_json::to_string(&event).unwrap_or_else(|_| event.name().to_string());
        if event.is_failure() {
            tracing::warn!(event = %json, "{}", event.name());
        } else {
            tracing::info!(event = %json, "{}", event.name());
        }
    }
}

/// 内存实现：记录所有事件，便于测试断言
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<OptimizerEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OptimizerEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: OptimizerEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
