use std::time::Duration;

use crate::config::{LearningMode, OptimizerSection};
use crate::evolution::analyzer::AnalyzerSettings;
use crate::evolution::types::OptimizationCategory;

/// Runtime view of the `[optimizer]` section with intervals as durations.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub learning_interval: Duration,
    pub recovery_interval: Duration,
    pub outcome_window: Duration,
    pub stage_timeout: Duration,
    pub confidence_threshold: f64,
    pub high_success_threshold: f64,
    pub failure_threshold: f64,
    pub auto_improvement_enabled: bool,
    pub max_concurrent_experiments: usize,
    pub safety_checks_enabled: bool,
    pub rollback_on_failure: bool,
    pub learning_modes: Vec<LearningMode>,
    pub optimization_targets: Vec<OptimizationCategory>,
}

impl From<OptimizerSection> for OptimizerConfig {
    fn from(section: OptimizerSection) -> Self {
        Self {
            learning_interval: Duration::from_secs(section.learning_interval),
            recovery_interval: Duration::from_secs(section.recovery_interval),
            outcome_window: Duration::from_secs(section.outcome_window),
            stage_timeout: Duration::from_secs(section.stage_timeout),
            confidence_threshold: section.confidence_threshold,
            high_success_threshold: section.high_success_threshold,
            failure_threshold: section.failure_threshold,
            auto_improvement_enabled: section.auto_improvement_enabled,
            max_concurrent_experiments: section.max_concurrent_experiments,
            safety_checks_enabled: section.safety_checks_enabled,
            rollback_on_failure: section.rollback_on_failure,
            learning_modes: section.learning_modes,
            optimization_targets: section.optimization_targets,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerSection::default().into()
    }
}

impl OptimizerConfig {
    pub fn analyzer_settings(&self) -> AnalyzerSettings {
        AnalyzerSettings {
            high_success_threshold: self.high_success_threshold,
            failure_threshold: self.failure_threshold,
        }
    }
}
