//! 结果库适配器：带类型的结果读取
//!
//! - 每次后端调用都有显式超时，超时按协作方不可用处理
//! - 缺少必填字段的行被单独跳过并产出事件，不会中断整批
//! - 成功分数在摄取时夹取到 [0, 1]
//! - 单个指标缺失时使用默认值（资源利用率 0.0，质量分 0.8）

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::{with_timeout, OptimizerError};
use crate::evolution::events::{EventSink, OptimizerEvent};
use crate::evolution::types::{ApplicationRecord, Outcome};
use crate::store::backend::{OutcomeBackend, RawOutcome};

/// 产物缺少质量分时使用的中性先验
pub const DEFAULT_QUALITY_SCORE: f64 = 0.8;

/// 资源指标回看窗口
const RESOURCE_LOOKBACK_HOURS: i64 = 24;

/// 查询时间窗口 `(since, until]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl TimeWindow {
    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self { since, until }
    }

    /// 截止到现在、长度为 length 的窗口
    pub fn trailing(length: Duration) -> Self {
        let until = Utc::now();
        let length = chrono::Duration::from_std(length).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            since: until - length,
            until,
        }
    }
}

pub struct OutcomeStoreAdapter {
    backend: Arc<dyn OutcomeBackend>,
    timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl OutcomeStoreAdapter {
    pub fn new(backend: Arc<dyn OutcomeBackend>, timeout: Duration, events: Arc<dyn EventSink>) -> Self {
        Self {
            backend,
            timeout,
            events,
        }
    }

    /// 拉取窗口内的结果；窗口内无数据时返回空 Vec 而不是错误
    pub async fn fetch_recent_outcomes(&self, window: TimeWindow) -> Result<Vec<Outcome>, OptimizerError> {
        let rows = with_timeout(
            "fetch_recent_outcomes",
            self.timeout,
            self.backend.query_outcomes(window.since, window.until),
        )
        .await?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for raw in rows {
            let label = raw.label();
            let required = match RequiredFields::extract(&raw) {
                Ok(fields) => fields,
                Err(err) => {
                    tracing::warn!(record = %label, error = %err, "Skipping malformed outcome");
                    self.events.emit(OptimizerEvent::OutcomeSkipped {
                        record: label,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let resources = self.resource_metrics(&required.project_id).await?;
            let quality = self.quality_metrics(&required.project_id).await?;
            outcomes.push(required.into_outcome(raw, resources, quality));
        }

        Ok(outcomes)
    }

    /// 项目近 24 小时资源利用率均值；无效值（缺失、负数、非有限数）记为 0.0
    pub async fn resource_metrics(&self, project_id: &str) -> Result<BTreeMap<String, f64>, OptimizerError> {
        let since = Utc::now() - chrono::Duration::hours(RESOURCE_LOOKBACK_HOURS);
        let samples = with_timeout(
            "resource_metrics",
            self.timeout,
            self.backend.query_resource_metrics(project_id, since),
        )
        .await?;

        Ok(samples
            .into_iter()
            .map(|s| {
                let value = s.average.filter(|v| v.is_finite() && *v >= 0.0).unwrap_or(0.0);
                (s.name, value)
            })
            .collect())
    }

    /// `{total_artifacts, average_quality}`；没有产物或均值无效时 average_quality 为 0.8
    pub async fn quality_metrics(&self, project_id: &str) -> Result<BTreeMap<String, f64>, OptimizerError> {
        let raw = with_timeout("quality_metrics", self.timeout, self.backend.query_quality(project_id)).await?;
        let average = raw
            .average_quality
            .filter(|v| v.is_finite())
            .unwrap_or(DEFAULT_QUALITY_SCORE);

        let mut metrics = BTreeMap::new();
        metrics.insert("total_artifacts".to_string(), raw.total_artifacts as f64);
        metrics.insert("average_quality".to_string(), average);
        Ok(metrics)
    }

    pub async fn record_application(&self, record: &ApplicationRecord) -> Result<(), OptimizerError> {
        with_timeout("record_application", self.timeout, self.backend.append_application(record)).await
    }

    pub async fn ping(&self) -> Result<(), OptimizerError> {
        with_timeout("store_ping", self.timeout, self.backend.ping()).await
    }
}

struct RequiredFields {
    project_id: String,
    outcome_type: String,
    impact_score: f64,
    created_at: DateTime<Utc>,
}

impl RequiredFields {
    fn extract(raw: &RawOutcome) -> Result<Self, OptimizerError> {
        let malformed = |reason: &str| OptimizerError::MalformedRecord {
            record: raw.label(),
            reason: reason.to_string(),
        };

        if let Some(defect) = &raw.defect {
            return Err(malformed(defect));
        }
        let project_id = raw
            .project_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| malformed("missing project id"))?;
        let outcome_type = raw
            .outcome_type
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| malformed("missing outcome type"))?;
        let impact_score = raw
            .impact_score
            .filter(|v| v.is_finite())
            .ok_or_else(|| malformed("missing or non-finite impact score"))?;
        let created_at = raw.created_at.ok_or_else(|| malformed("missing created_at"))?;

        Ok(Self {
            project_id,
            outcome_type,
            impact_score,
            created_at,
        })
    }

    fn into_outcome(
        self,
        raw: RawOutcome,
        resource_utilization: BTreeMap<String, f64>,
        quality_metrics: BTreeMap<String, f64>,
    ) -> Outcome {
        Outcome {
            id: self.project_id,
            category: self.outcome_type,
            success_score: Outcome::clamp_score(self.impact_score),
            completion_hours: raw
                .completion_hours
                .filter(|h| h.is_finite())
                .map(|h| h.max(0.0))
                .unwrap_or(0.0),
            resource_utilization,
            quality_metrics,
            lessons: raw.lessons_learned.unwrap_or_default(),
            detected_patterns: raw.patterns_identified.unwrap_or_default(),
            suggestions: raw.recommendations.unwrap_or_default(),
            timestamp: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::events::MemoryEventSink;
    use crate::store::memory::InMemoryOutcomeBackend;

    fn adapter(backend: Arc<InMemoryOutcomeBackend>) -> (OutcomeStoreAdapter, Arc<MemoryEventSink>) {
        let events = Arc::new(MemoryEventSink::new());
        let adapter = OutcomeStoreAdapter::new(backend, Duration::from_secs(5), events.clone());
        (adapter, events)
    }

    #[tokio::test]
    async fn test_success_score_clamped() {
        let backend = Arc::new(InMemoryOutcomeBackend::new());
        backend.push_outcome(RawOutcome::new("high", "build", 1.4));
        backend.push_outcome(RawOutcome::new("low", "build", -0.2));
        let (adapter, _) = adapter(backend);

        let outcomes = adapter
            .fetch_recent_outcomes(TimeWindow::trailing(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].success_score, 1.0);
        assert_eq!(outcomes[1].success_score, 0.0);
    }

    #[tokio::test]
    async fn test_malformed_rows_skipped_individually() {
        let backend = Arc::new(InMemoryOutcomeBackend::new());
        backend.push_outcome(RawOutcome::new("ok", "build", 0.7));
        let mut missing_score = RawOutcome::new("bad", "build", 0.0);
        missing_score.impact_score = None;
        backend.push_outcome(missing_score);
        let mut missing_type = RawOutcome::new("bad2", "build", 0.5);
        missing_type.outcome_type = None;
        backend.push_outcome(missing_type);
        let (adapter, events) = adapter(backend);

        let outcomes = adapter
            .fetch_recent_outcomes(TimeWindow::trailing(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].id, "ok");
        assert_eq!(events.count("outcome_skipped"), 2);
    }

    #[tokio::test]
    async fn test_empty_window_is_not_an_error() {
        let backend = Arc::new(InMemoryOutcomeBackend::new());
        let (adapter, _) = adapter(backend);
        let outcomes = adapter
            .fetch_recent_outcomes(TimeWindow::trailing(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let backend = Arc::new(InMemoryOutcomeBackend::new());
        backend.fail_next_queries(1);
        let (adapter, _) = adapter(backend);
        let err = adapter
            .fetch_recent_outcomes(TimeWindow::trailing(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let backend = Arc::new(InMemoryOutcomeBackend::new());
        backend.set_query_delay(Some(Duration::from_secs(10)));
        let events = Arc::new(MemoryEventSink::new());
        let adapter = OutcomeStoreAdapter::new(backend, Duration::from_millis(20), events);
        let err = adapter
            .fetch_recent_outcomes(TimeWindow::trailing(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_metric_defaults() {
        let backend = Arc::new(InMemoryOutcomeBackend::new());
        backend.set_resource("p1", "cpu", Some(0.9));
        backend.set_resource("p1", "memory", None);
        backend.set_resource("p1", "disk", Some(f64::NAN));
        let (adapter, _) = adapter(backend);

        let resources = adapter.resource_metrics("p1").await.unwrap();
        assert_eq!(resources["cpu"], 0.9);
        assert_eq!(resources["memory"], 0.0);
        assert_eq!(resources["disk"], 0.0);

        let quality = adapter.quality_metrics("p1").await.unwrap();
        assert_eq!(quality["total_artifacts"], 0.0);
        assert_eq!(quality["average_quality"], DEFAULT_QUALITY_SCORE);
    }

    #[tokio::test]
    async fn test_completion_hours_defaults_and_clamps() {
        let backend = Arc::new(InMemoryOutcomeBackend::new());
        backend.push_outcome(RawOutcome::new("neg", "build", 0.5).completed_in(-3.0));
        backend.push_outcome(RawOutcome::new("none", "build", 0.5));
        let (adapter, _) = adapter(backend);
        let outcomes = adapter
            .fetch_recent_outcomes(TimeWindow::trailing(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!(outcomes.iter().all(|o| o.completion_hours == 0.0));
    }
}
