use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::LearningMode;
use crate::core::{with_timeout, FailureCategory, OptimizerError};
use crate::evolution::analyzer::agent_metrics;
use crate::evolution::events::{EventSink, OptimizerEvent};
use crate::evolution::types::{AgentPerformanceMetrics, ApplicationRecord, Outcome};
use crate::registry::{ModelKind, ModelRegistry, TrainingBatch, TrainingRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateReport {
    pub succeeded: Vec<ModelKind>,
    pub failed: Vec<(ModelKind, FailureCategory, String)>,
}

impl UpdateReport {
    pub fn is_noop(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    /// Registry outage or timeout on any model; the stage fails after all four were attempted.
    pub fn unavailable(&self) -> Option<OptimizerError> {
        let models: Vec<String> = self
            .failed
            .iter()
            .filter(|(_, category, _)| *category == FailureCategory::CollaboratorUnavailable)
            .map(|(model, _, error)| format!("{model}: {error}"))
            .collect();
        if models.is_empty() {
            None
        } else {
            Some(OptimizerError::registry(models.join("; ")))
        }
    }
}

pub struct ModelUpdater {
    registry: Arc<dyn ModelRegistry>,
    timeout: Duration,
    failure_threshold: f64,
    learning_modes: Vec<LearningMode>,
    events: Arc<dyn EventSink>,
    agent_snapshot: RwLock<Vec<AgentPerformanceMetrics>>,
}

impl ModelUpdater {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        timeout: Duration,
        failure_threshold: f64,
        learning_modes: Vec<LearningMode>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            timeout,
            failure_threshold,
            learning_modes,
            events,
            agent_snapshot: RwLock::new(Vec::new()),
        }
    }

    /// Agent metrics from the most recent non-empty update.
    pub async fn latest_agent_metrics(&self) -> Vec<AgentPerformanceMetrics> {
        self.agent_snapshot.read().await.clone()
    }

    /// Four independent model updates; an empty batch makes no registry calls.
    pub async fn update(&self, outcomes: &[Outcome], applications: &[ApplicationRecord]) -> UpdateReport {
        let mut report = UpdateReport::default();
        if outcomes.is_empty() {
            return report;
        }

        let agents = agent_metrics(outcomes, self.failure_threshold);
        *self.agent_snapshot.write().await = agents.clone();

        let batch = TrainingBatch {
            records: outcomes.iter().map(TrainingRecord::from_outcome).collect(),
            agent_metrics: agents,
            applications: if self.learning_modes.contains(&LearningMode::Reinforcement) {
                applications.to_vec()
            } else {
                Vec::new()
            },
            learning_modes: self.learning_modes.clone(),
            generated_at: Utc::now(),
        };

        for model in ModelKind::ALL {
            match with_timeout(model.as_str(), self.timeout, self.registry.update(model, &batch)).await {
                Ok(()) => {
                    tracing::debug!(model = %model, records = batch.records.len(), "Model updated");
                    self.events.emit(OptimizerEvent::ModelUpdated {
                        model: model.as_str(),
                        records: batch.records.len(),
                    });
                    report.succeeded.push(model);
                }
                Err(err) => {
                    tracing::warn!(model = %model, error = %err, "Model update failed");
                    self.events.emit(OptimizerEvent::ModelUpdateFailed {
                        model: model.as_str(),
                        failure: err.category(),
                        error: err.to_string(),
                    });
                    report.failed.push((model, err.category(), err.to_string()));
                }
            }
        }

        report
    }

    pub async fn ping(&self) -> bool {
        with_timeout("registry_ping", self.timeout, self.registry.ping())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::events::MemoryEventSink;
    use crate::evolution::types::{Level, OptimizationCategory, SystemOptimization};
    use crate::evolution::types::ApplicationStatus;
    use crate::registry::InMemoryModelRegistry;
    use std::collections::BTreeMap;

    fn outcome(id: &str, score: f64) -> Outcome {
        Outcome {
            id: id.into(),
            category: "build".into(),
            success_score: score,
            completion_hours: 2.0,
            resource_utilization: BTreeMap::new(),
            quality_metrics: BTreeMap::new(),
            lessons: vec![],
            detected_patterns: vec![],
            suggestions: vec![],
            timestamp: Utc::now(),
        }
    }

    fn updater(
        registry: Arc<InMemoryModelRegistry>,
        modes: Vec<LearningMode>,
    ) -> (ModelUpdater, Arc<MemoryEventSink>) {
        let events = Arc::new(MemoryEventSink::new());
        (
            ModelUpdater::new(registry, Duration::from_secs(5), 0.5, modes, events.clone()),
            events,
        )
    }

    fn application() -> ApplicationRecord {
        let proposal = SystemOptimization::new(OptimizationCategory::Performance, "p", 1.0, 2.0)
            .with_levels(Level::Low, Level::High, Level::Low);
        ApplicationRecord::new(1, &proposal, ApplicationStatus::Applied)
    }

    #[tokio::test]
    async fn test_empty_outcomes_make_no_registry_calls() {
        let registry = Arc::new(InMemoryModelRegistry::new());
        let (updater, events) = updater(registry.clone(), vec![LearningMode::Supervised]);
        let report = updater.update(&[], &[application()]).await;
        assert!(report.is_noop());
        assert_eq!(registry.call_count(), 0);
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_model_does_not_block_others() {
        let registry = Arc::new(InMemoryModelRegistry::new());
        registry.fail_model(ModelKind::ResourceEstimation);
        let (updater, events) = updater(registry.clone(), vec![LearningMode::Supervised]);

        let report = updater.update(&[outcome("a", 0.9)], &[]).await;
        assert_eq!(report.succeeded.len(), 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, ModelKind::ResourceEstimation);
        assert_eq!(report.failed[0].1, FailureCategory::CollaboratorUnavailable);
        let called: Vec<ModelKind> = registry.calls().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            called,
            vec![ModelKind::SuccessPrediction, ModelKind::QualityPrediction, ModelKind::AgentPerformance]
        );
        assert_eq!(events.count("model_update_failed"), 1);
    }

    #[tokio::test]
    async fn test_slow_registry_times_out_per_model() {
        let registry = Arc::new(InMemoryModelRegistry::new());
        registry.set_delay(Some(Duration::from_secs(10)));
        let events = Arc::new(MemoryEventSink::new());
        let updater = ModelUpdater::new(registry, Duration::from_millis(10), 0.5, vec![], events);
        let report = updater.update(&[outcome("a", 0.9)], &[]).await;
        assert_eq!(report.failed.len(), 4);
        assert!(matches!(report.unavailable(), Some(OptimizerError::RegistryUnavailable(_))));
    }

    #[tokio::test]
    async fn test_clean_update_has_no_unavailable_error() {
        let registry = Arc::new(InMemoryModelRegistry::new());
        let (updater, _) = updater(registry, vec![LearningMode::Supervised]);
        let report = updater.update(&[outcome("a", 0.9)], &[]).await;
        assert_eq!(report.succeeded.len(), 4);
        assert!(report.unavailable().is_none());
        assert!(UpdateReport::default().unavailable().is_none());
    }

    #[tokio::test]
    async fn test_applications_only_with_reinforcement() {
        let registry = Arc::new(InMemoryModelRegistry::new());
        let (plain, _) = updater(registry.clone(), vec![LearningMode::Supervised]);
        plain.update(&[outcome("a", 0.9)], &[application()]).await;
        assert!(registry.calls()[0].1.applications.is_empty());

        let registry = Arc::new(InMemoryModelRegistry::new());
        let (rl, _) = updater(registry.clone(), vec![LearningMode::Reinforcement]);
        rl.update(&[outcome("a", 0.9)], &[application()]).await;
        assert_eq!(registry.calls()[0].1.applications.len(), 1);
    }

    #[tokio::test]
    async fn test_agent_snapshot_replaced() {
        let registry = Arc::new(InMemoryModelRegistry::new());
        let (updater, _) = updater(registry, vec![]);
        assert!(updater.latest_agent_metrics().await.is_empty());

        updater.update(&[outcome("a", 0.9), outcome("b", 0.1)], &[]).await;
        let first = updater.latest_agent_metrics().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].tasks_completed, 2);

        updater.update(&[outcome("c", 0.9)], &[]).await;
        assert_eq!(updater.latest_agent_metrics().await[0].tasks_completed, 1);
    }
}
