use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One closed unit of work's measured result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    pub id: String,
    pub category: String,
    /// Always within [0, 1]; ingestion clamps.
    pub success_score: f64,
    pub completion_hours: f64,
    pub resource_utilization: BTreeMap<String, f64>,
    pub quality_metrics: BTreeMap<String, f64>,
    pub lessons: Vec<String>,
    pub detected_patterns: Vec<DetectedPattern>,
    pub suggestions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Outcome {
    pub fn clamp_score(raw: f64) -> f64 {
        raw.clamp(0.0, 1.0)
    }

    /// Tags of detected-pattern records with the given type, read from `payload.tag`
    /// or a plain string payload.
    pub fn pattern_tags(&self, kind: &str) -> Vec<String> {
        self.detected_patterns
            .iter()
            .filter(|p| p.kind == kind)
            .filter_map(|p| match &p.payload {
                serde_json::Value::String(s) => Some(s.clone()),
                other => other.get("tag").and_then(|t| t.as_str()).map(str::to_string),
            })
            .collect()
    }
}

/// A pattern record attached upstream to an outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedPattern {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPerformanceMetrics {
    pub agent_id: String,
    pub agent_type: String,
    pub tasks_completed: u64,
    pub success_rate: f64,
    pub average_completion_time: f64,
    pub quality_score: f64,
    pub efficiency_score: f64,
    pub error_patterns: BTreeSet<String>,
    pub strengths: BTreeSet<String>,
    pub improvement_areas: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    SuccessFactors,
    FailureModes,
    ResourceOptimization,
    AgentPerformance,
    Temporal,
}

impl PatternKind {
    pub const ALL: [PatternKind; 5] = [
        PatternKind::SuccessFactors,
        PatternKind::FailureModes,
        PatternKind::ResourceOptimization,
        PatternKind::AgentPerformance,
        PatternKind::Temporal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::SuccessFactors => "success_factors",
            PatternKind::FailureModes => "failure_modes",
            PatternKind::ResourceOptimization => "resource_optimization",
            PatternKind::AgentPerformance => "agent_performance",
            PatternKind::Temporal => "temporal",
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Occurrence {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceFactor {
    pub resource: String,
    pub success_mean: f64,
    pub baseline_mean: f64,
    /// success_mean / baseline_mean; 1.0 when the baseline is zero.
    pub lift: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SuccessFactors {
    pub supporting: Vec<String>,
    pub factors: Vec<ResourceFactor>,
    pub recurring_lessons: Vec<Occurrence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureMode {
    pub category: String,
    pub count: usize,
    /// Fraction of all failing outcomes in this category.
    pub share: f64,
    pub mean_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FailureModes {
    pub failing: Vec<String>,
    pub modes: Vec<FailureMode>,
    pub error_tags: Vec<Occurrence>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UtilizationStatus {
    Over,
    Under,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceProfile {
    pub resource: String,
    pub mean_utilization: f64,
    pub samples: usize,
    pub status: UtilizationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceUsage {
    pub observed: Vec<String>,
    pub resources: Vec<ResourceProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentPerformance {
    pub attributed: Vec<String>,
    pub agents: Vec<AgentPerformanceMetrics>,
    pub batch_mean_completion: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HourBucket {
    pub hour: u32,
    pub count: usize,
    pub mean_completion_hours: f64,
    pub mean_success: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TemporalProfile {
    pub observed: Vec<String>,
    pub buckets: Vec<HourBucket>,
    pub batch_mean_completion: f64,
    pub slowest_hour: Option<u32>,
}

/// Kind-specific pattern data; the variant is the pattern kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PatternPayload {
    SuccessFactors(SuccessFactors),
    FailureModes(FailureModes),
    ResourceOptimization(ResourceUsage),
    AgentPerformance(AgentPerformance),
    Temporal(TemporalProfile),
}

impl PatternPayload {
    pub fn kind(&self) -> PatternKind {
        match self {
            PatternPayload::SuccessFactors(_) => PatternKind::SuccessFactors,
            PatternPayload::FailureModes(_) => PatternKind::FailureModes,
            PatternPayload::ResourceOptimization(_) => PatternKind::ResourceOptimization,
            PatternPayload::AgentPerformance(_) => PatternKind::AgentPerformance,
            PatternPayload::Temporal(_) => PatternKind::Temporal,
        }
    }

    /// Count of supporting observations (outcomes) behind this payload.
    pub fn sample_size(&self) -> usize {
        match self {
            PatternPayload::SuccessFactors(p) => p.supporting.len(),
            PatternPayload::FailureModes(p) => p.failing.len(),
            PatternPayload::ResourceOptimization(p) => p.observed.len(),
            PatternPayload::AgentPerformance(p) => p.attributed.len(),
            PatternPayload::Temporal(p) => p.observed.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_size() == 0
    }
}

/// `min(1, n / 100)`: saturates at 100 supporting observations, 0.0 for none.
pub fn confidence(sample_size: usize) -> f64 {
    (sample_size as f64 / 100.0).min(1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub payload: PatternPayload,
    pub confidence: f64,
}

impl Pattern {
    pub fn new(payload: PatternPayload) -> Self {
        let confidence = confidence(payload.sample_size());
        Self { payload, confidence }
    }

    pub fn kind(&self) -> PatternKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationCategory {
    Performance,
    Accuracy,
    Efficiency,
    Cost,
    Reliability,
    Scalability,
}

impl OptimizationCategory {
    pub const ALL: [OptimizationCategory; 6] = [
        OptimizationCategory::Performance,
        OptimizationCategory::Accuracy,
        OptimizationCategory::Efficiency,
        OptimizationCategory::Cost,
        OptimizationCategory::Reliability,
        OptimizationCategory::Scalability,
    ];

    /// Accuracy and cost proposals always go to manual review.
    pub fn has_autonomous_path(&self) -> bool {
        matches!(
            self,
            OptimizationCategory::Performance
                | OptimizationCategory::Efficiency
                | OptimizationCategory::Reliability
                | OptimizationCategory::Scalability
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationCategory::Performance => "performance",
            OptimizationCategory::Accuracy => "accuracy",
            OptimizationCategory::Efficiency => "efficiency",
            OptimizationCategory::Cost => "cost",
            OptimizationCategory::Reliability => "reliability",
            OptimizationCategory::Scalability => "scalability",
        }
    }
}

impl std::fmt::Display for OptimizationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-point ordinal scale shared by effort, impact and risk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
}

impl Level {
    pub fn impact_score(&self) -> f64 {
        match self {
            Level::Low => 0.3,
            Level::Medium => 0.6,
            Level::High => 1.0,
        }
    }

    /// Inverse of effort: cheaper changes are more feasible.
    pub fn feasibility_score(&self) -> f64 {
        match self {
            Level::Low => 1.0,
            Level::Medium => 0.6,
            Level::High => 0.3,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Low => write!(f, "low"),
            Level::Medium => write!(f, "medium"),
            Level::High => write!(f, "high"),
        }
    }
}

/// An improvement proposal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemOptimization {
    pub category: OptimizationCategory,
    pub component: String,
    pub current_value: f64,
    pub target_value: f64,
    pub improvement_percentage: f64,
    pub implementation_effort: Level,
    pub expected_impact: Level,
    pub risk_level: Level,
    pub implementation_steps: Vec<String>,
    pub validation_criteria: Vec<String>,
}

impl SystemOptimization {
    pub fn new(
        category: OptimizationCategory,
        component: impl Into<String>,
        current_value: f64,
        target_value: f64,
    ) -> Self {
        Self {
            category,
            component: component.into(),
            current_value,
            target_value,
            improvement_percentage: improvement_percentage(current_value, target_value),
            implementation_effort: Level::Medium,
            expected_impact: Level::Medium,
            risk_level: Level::Medium,
            implementation_steps: Vec::new(),
            validation_criteria: Vec::new(),
        }
    }

    pub fn with_levels(mut self, effort: Level, impact: Level, risk: Level) -> Self {
        self.implementation_effort = effort;
        self.expected_impact = impact;
        self.risk_level = risk;
        self
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.implementation_steps = steps;
        self
    }

    pub fn with_validation(mut self, criteria: Vec<String>) -> Self {
        self.validation_criteria = criteria;
        self
    }

    pub fn ranking_score(&self) -> f64 {
        self.expected_impact.impact_score() * self.implementation_effort.feasibility_score()
    }

    /// risk low, effort low, impact medium or high.
    pub fn is_low_risk(&self) -> bool {
        self.risk_level == Level::Low
            && self.implementation_effort == Level::Low
            && matches!(self.expected_impact, Level::Medium | Level::High)
    }
}

/// `((target - current) / current) * 100`, 0.0 when current is zero.
pub fn improvement_percentage(current: f64, target: f64) -> f64 {
    if current == 0.0 || !current.is_finite() || !target.is_finite() {
        return 0.0;
    }
    (target - current) / current * 100.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Applied,
    Failed,
    RolledBack,
    ManualReview,
    Deferred,
}

/// Audit record for one proposal the executor looked at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationRecord {
    pub id: String,
    pub cycle: u64,
    pub category: OptimizationCategory,
    pub component: String,
    pub status: ApplicationStatus,
    pub previous_value: Option<f64>,
    pub applied_value: Option<f64>,
    pub improvement_percentage: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ApplicationRecord {
    pub fn new(cycle: u64, proposal: &SystemOptimization, status: ApplicationStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cycle,
            category: proposal.category,
            component: proposal.component.clone(),
            status,
            previous_value: None,
            applied_value: None,
            improvement_percentage: proposal.improvement_percentage,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Whether application was actually attempted (as opposed to routed elsewhere).
    pub fn attempted(&self) -> bool {
        matches!(
            self.status,
            ApplicationStatus::Applied | ApplicationStatus::Failed | ApplicationStatus::RolledBack
        )
    }
}
