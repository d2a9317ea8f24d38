//! 结果库抽象层
//!
//! OutcomeBackend 是外部持久化层的接口边界：按时间窗口查询结果行、按项目查询资源/质量指标、
//! 追加已应用改进的审计记录。返回的都是原始行，字段校验与默认值由 OutcomeStoreAdapter 负责。
//! 后端自身不做重试，重试策略属于控制循环。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::OptimizerError;
use crate::evolution::types::{ApplicationRecord, DetectedPattern};

/// 结果库中的一行（未校验）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOutcome {
    pub project_id: Option<String>,
    pub outcome_type: Option<String>,
    pub impact_score: Option<f64>,
    pub completion_hours: Option<f64>,
    pub lessons_learned: Option<Vec<String>>,
    pub patterns_identified: Option<Vec<DetectedPattern>>,
    pub recommendations: Option<Vec<String>>,
    pub created_at: Option<DateTime<Utc>>,
    /// 后端解析该行时发现的问题（如 JSON 列无法解析）
    #[serde(default)]
    pub defect: Option<String>,
}

impl RawOutcome {
    pub fn new(project_id: impl Into<String>, outcome_type: impl Into<String>, impact_score: f64) -> Self {
        Self {
            project_id: Some(project_id.into()),
            outcome_type: Some(outcome_type.into()),
            impact_score: Some(impact_score),
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn completed_in(mut self, hours: f64) -> Self {
        self.completion_hours = Some(hours);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_lessons(mut self, lessons: Vec<String>) -> Self {
        self.lessons_learned = Some(lessons);
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<DetectedPattern>) -> Self {
        self.patterns_identified = Some(patterns);
        self
    }

    pub fn with_recommendations(mut self, recommendations: Vec<String>) -> Self {
        self.recommendations = Some(recommendations);
        self
    }

    /// 用于日志的记录标识
    pub fn label(&self) -> String {
        self.project_id.clone().unwrap_or_else(|| "<unknown>".to_string())
    }
}

/// 单个资源指标的平均值；None 表示该指标没有有效值
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub average: Option<f64>,
}

/// 项目产物质量汇总；average_quality 为 None 表示没有产物
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawQuality {
    pub total_artifacts: u64,
    pub average_quality: Option<f64>,
}

/// 结果库后端接口
#[async_trait]
pub trait OutcomeBackend: Send + Sync {
    /// 查询 `(since, until]` 内创建、且项目已完成的结果行；无数据时返回空 Vec
    async fn query_outcomes(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawOutcome>, OptimizerError>;

    /// 查询项目在 since 之后的资源指标平均值
    async fn query_resource_metrics(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, OptimizerError>;

    async fn query_quality(&self, project_id: &str) -> Result<RawQuality, OptimizerError>;

    /// 追加一条已应用改进的审计记录
    async fn append_application(&self, record: &ApplicationRecord) -> Result<(), OptimizerError>;

    /// 健康检查
    async fn ping(&self) -> Result<(), OptimizerError>;
}
