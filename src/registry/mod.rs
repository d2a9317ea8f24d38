//! 模型仓库抽象层
//!
//! ModelRegistry 接受四个命名的模型更新（成功预测、资源估计、质量预测、智能体表现），
//! 每次调用携带一批与具体模型无关的训练记录，并各自返回成功或失败。
//! 提供文件（JSONL）和内存两种实现。

mod file;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LearningMode;
use crate::core::OptimizerError;
use crate::evolution::types::{AgentPerformanceMetrics, ApplicationRecord, Outcome};
use crate::store::DEFAULT_QUALITY_SCORE;

pub use file::FileModelRegistry;
pub use memory::InMemoryModelRegistry;

/// 四个可更新的模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    SuccessPrediction,
    ResourceEstimation,
    QualityPrediction,
    AgentPerformance,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::SuccessPrediction,
        ModelKind::ResourceEstimation,
        ModelKind::QualityPrediction,
        ModelKind::AgentPerformance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::SuccessPrediction => "success_prediction",
            ModelKind::ResourceEstimation => "resource_estimation",
            ModelKind::QualityPrediction => "quality_prediction",
            ModelKind::AgentPerformance => "agent_performance",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条训练记录（由一条 Outcome 生成）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub outcome_id: String,
    pub category: String,
    pub features: BTreeMap<String, f64>,
    pub labels: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl TrainingRecord {
    pub fn from_outcome(outcome: &Outcome) -> Self {
        let mut features = BTreeMap::new();
        for (name, value) in &outcome.resource_utilization {
            features.insert(format!("resource.{name}"), *value);
        }
        for (name, value) in &outcome.quality_metrics {
            features.insert(format!("quality.{name}"), *value);
        }
        features.insert("completion_hours".to_string(), outcome.completion_hours);
        features.insert("hour_of_day".to_string(), outcome.timestamp.hour() as f64);
        features.insert("lesson_count".to_string(), outcome.lessons.len() as f64);
        features.insert("suggestion_count".to_string(), outcome.suggestions.len() as f64);
        features.insert("pattern_count".to_string(), outcome.detected_patterns.len() as f64);

        let mut labels = BTreeMap::new();
        labels.insert("success_score".to_string(), outcome.success_score);
        labels.insert("completion_hours".to_string(), outcome.completion_hours);
        labels.insert(
            "average_quality".to_string(),
            outcome
                .quality_metrics
                .get("average_quality")
                .copied()
                .unwrap_or(DEFAULT_QUALITY_SCORE),
        );

        Self {
            outcome_id: outcome.id.clone(),
            category: outcome.category.clone(),
            features,
            labels,
            timestamp: outcome.timestamp,
        }
    }
}

/// 一次更新提交给模型仓库的批次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingBatch {
    pub records: Vec<TrainingRecord>,
    pub agent_metrics: Vec<AgentPerformanceMetrics>,
    /// 强化信号：仅在 learning_modes 含 reinforcement 时填充
    pub applications: Vec<ApplicationRecord>,
    pub learning_modes: Vec<LearningMode>,
    pub generated_at: DateTime<Utc>,
}

/// 模型仓库接口
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// 用一批训练记录更新指定模型
    async fn update(&self, model: ModelKind, batch: &TrainingBatch) -> Result<(), OptimizerError>;

    /// 健康检查
    async fn ping(&self) -> Result<(), OptimizerError>;
}
