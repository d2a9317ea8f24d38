use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::{with_timeout, OptimizerError};
use crate::evolution::engine::OptimizerConfig;
use crate::evolution::events::{EventSink, OptimizerEvent};
use crate::evolution::types::{
    ApplicationRecord, ApplicationStatus, OptimizationCategory, SystemOptimization,
};
use crate::store::OutcomeStoreAdapter;

/// Value a parameter held before and after an application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedChange {
    pub previous: Option<f64>,
    pub applied: f64,
}

/// Category-specific side effect behind an eligible proposal.
#[async_trait]
pub trait OptimizationImplementer: Send + Sync {
    fn category(&self) -> OptimizationCategory;

    async fn apply(&self, proposal: &SystemOptimization) -> Result<AppliedChange, OptimizerError>;

    /// Checks the change against the proposal's validation criteria.
    async fn verify(&self, proposal: &SystemOptimization, change: &AppliedChange) -> Result<bool, OptimizerError>;

    /// Undo. `change` is None when `apply` itself failed.
    async fn rollback(
        &self,
        proposal: &SystemOptimization,
        change: Option<&AppliedChange>,
    ) -> Result<(), OptimizerError>;
}

/// Live tunable parameters keyed by component, shared with whatever consumes them.
#[derive(Debug, Clone, Default)]
pub struct TuningTable {
    values: Arc<RwLock<HashMap<String, f64>>>,
}

impl TuningTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, component: &str) -> Option<f64> {
        self.values.read().await.get(component).copied()
    }

    /// Returns the previous value.
    pub async fn set(&self, component: &str, value: f64) -> Option<f64> {
        self.values.write().await.insert(component.to_string(), value)
    }

    pub async fn remove(&self, component: &str) -> Option<f64> {
        self.values.write().await.remove(component)
    }

    pub async fn snapshot(&self) -> HashMap<String, f64> {
        self.values.read().await.clone()
    }
}

/// Writes a proposal's target value into the tuning table.
pub struct ParameterImplementer {
    category: OptimizationCategory,
    table: TuningTable,
}

impl ParameterImplementer {
    pub fn new(category: OptimizationCategory, table: TuningTable) -> Self {
        Self { category, table }
    }
}

#[async_trait]
impl OptimizationImplementer for ParameterImplementer {
    fn category(&self) -> OptimizationCategory {
        self.category
    }

    async fn apply(&self, proposal: &SystemOptimization) -> Result<AppliedChange, OptimizerError> {
        if !proposal.target_value.is_finite() {
            return Err(OptimizerError::apply(&proposal.component, "target value is not finite"));
        }
        let previous = self.table.set(&proposal.component, proposal.target_value).await;
        Ok(AppliedChange {
            previous,
            applied: proposal.target_value,
        })
    }

    async fn verify(&self, proposal: &SystemOptimization, change: &AppliedChange) -> Result<bool, OptimizerError> {
        Ok(self.table.get(&proposal.component).await == Some(change.applied))
    }

    async fn rollback(
        &self,
        proposal: &SystemOptimization,
        change: Option<&AppliedChange>,
    ) -> Result<(), OptimizerError> {
        match change {
            Some(AppliedChange { previous: Some(prev), .. }) => {
                self.table.set(&proposal.component, *prev).await;
            }
            Some(AppliedChange { previous: None, .. }) => {
                self.table.remove(&proposal.component).await;
            }
            // the table write is atomic, nothing partial to undo
            None => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorPolicy {
    pub auto_improvement_enabled: bool,
    pub max_concurrent_experiments: usize,
    pub safety_checks_enabled: bool,
    pub rollback_on_failure: bool,
    pub timeout: Duration,
}

impl From<&OptimizerConfig> for ExecutorPolicy {
    fn from(config: &OptimizerConfig) -> Self {
        Self {
            auto_improvement_enabled: config.auto_improvement_enabled,
            max_concurrent_experiments: config.max_concurrent_experiments,
            safety_checks_enabled: config.safety_checks_enabled,
            rollback_on_failure: config.rollback_on_failure,
            timeout: config.stage_timeout,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub records: Vec<ApplicationRecord>,
}

impl ExecutionSummary {
    fn count(&self, status: ApplicationStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn applied(&self) -> usize {
        self.count(ApplicationStatus::Applied)
    }

    /// Failed or rolled back.
    pub fn failed(&self) -> usize {
        self.count(ApplicationStatus::Failed) + self.count(ApplicationStatus::RolledBack)
    }

    pub fn attempted(&self) -> usize {
        self.records.iter().filter(|r| r.attempted()).count()
    }
}

pub struct RiskGatedExecutor {
    implementers: HashMap<OptimizationCategory, Arc<dyn OptimizationImplementer>>,
    policy: ExecutorPolicy,
    store: Arc<OutcomeStoreAdapter>,
    events: Arc<dyn EventSink>,
}

impl RiskGatedExecutor {
    pub fn new(policy: ExecutorPolicy, store: Arc<OutcomeStoreAdapter>, events: Arc<dyn EventSink>) -> Self {
        Self {
            implementers: HashMap::new(),
            policy,
            store,
            events,
        }
    }

    /// Registers `implementer` for its category, replacing any earlier one.
    pub fn with_implementer(mut self, implementer: Arc<dyn OptimizationImplementer>) -> Self {
        self.implementers.insert(implementer.category(), implementer);
        self
    }

    /// Parameter implementers for every category with an autonomous path.
    pub fn with_tuning_table(self, table: &TuningTable) -> Self {
        OptimizationCategory::ALL
            .iter()
            .filter(|c| c.has_autonomous_path())
            .fold(self, |exec, c| {
                exec.with_implementer(Arc::new(ParameterImplementer::new(*c, table.clone())))
            })
    }

    /// Walks proposals in ranking order. One proposal's failure never stops the rest.
    pub async fn execute_safe(&self, cycle: u64, proposals: &[SystemOptimization]) -> ExecutionSummary {
        let mut summary = ExecutionSummary::default();
        let mut experiments = 0usize;

        for proposal in proposals {
            let record = match self.route(proposal) {
                Some(reason) => self.manual_review(cycle, proposal, reason),
                None if experiments >= self.policy.max_concurrent_experiments => {
                    self.events.emit(OptimizerEvent::ProposalDeferred {
                        component: proposal.component.clone(),
                        category: proposal.category,
                        limit: self.policy.max_concurrent_experiments,
                    });
                    ApplicationRecord::new(cycle, proposal, ApplicationStatus::Deferred)
                }
                None => match self.implementers.get(&proposal.category) {
                    Some(implementer) => {
                        experiments += 1;
                        self.attempt(cycle, proposal, implementer.as_ref()).await
                    }
                    None => self.manual_review(cycle, proposal, "no implementer registered"),
                },
            };

            if let Err(err) = self.store.record_application(&record).await {
                tracing::warn!(component = %record.component, error = %err, "Failed to write audit record");
                self.events.emit(OptimizerEvent::AuditWriteFailed {
                    component: record.component.clone(),
                    status: record.status,
                    error: err.to_string(),
                });
            }
            summary.records.push(record);
        }

        summary
    }

    /// Why a proposal must go to manual review, if it must.
    fn route(&self, proposal: &SystemOptimization) -> Option<&'static str> {
        if !self.policy.auto_improvement_enabled {
            Some("automatic improvement disabled")
        } else if !proposal.is_low_risk() {
            Some("risk gate")
        } else if !proposal.category.has_autonomous_path() {
            Some("no autonomous path for category")
        } else {
            None
        }
    }

    fn manual_review(&self, cycle: u64, proposal: &SystemOptimization, reason: &str) -> ApplicationRecord {
        tracing::info!(component = %proposal.component, category = %proposal.category, reason, "Proposal left for manual review");
        self.events.emit(OptimizerEvent::ProposalRejected {
            component: proposal.component.clone(),
            category: proposal.category,
            risk: proposal.risk_level,
            effort: proposal.implementation_effort,
            impact: proposal.expected_impact,
            reason: reason.to_string(),
        });
        ApplicationRecord::new(cycle, proposal, ApplicationStatus::ManualReview)
    }

    async fn attempt(
        &self,
        cycle: u64,
        proposal: &SystemOptimization,
        implementer: &dyn OptimizationImplementer,
    ) -> ApplicationRecord {
        let change = match with_timeout("apply_proposal", self.policy.timeout, implementer.apply(proposal)).await {
            Ok(change) => change,
            Err(err) => {
                if self.policy.rollback_on_failure {
                    self.undo(proposal, implementer, None).await;
                }
                return self.failed(cycle, proposal, None, err);
            }
        };

        if self.policy.safety_checks_enabled {
            let verified = with_timeout(
                "verify_proposal",
                self.policy.timeout,
                implementer.verify(proposal, &change),
            )
            .await
            .and_then(|ok| {
                if ok {
                    Ok(())
                } else {
                    Err(OptimizerError::apply(&proposal.component, "verification failed"))
                }
            });

            if let Err(err) = verified {
                if self.policy.rollback_on_failure && self.undo(proposal, implementer, Some(&change)).await {
                    tracing::warn!(component = %proposal.component, error = %err, "Rolled back proposal");
                    self.events.emit(OptimizerEvent::ProposalRolledBack {
                        component: proposal.component.clone(),
                        category: proposal.category,
                        restored_value: change.previous,
                    });
                    let mut record = ApplicationRecord::new(cycle, proposal, ApplicationStatus::RolledBack);
                    record.previous_value = change.previous;
                    record.applied_value = Some(change.applied);
                    record.error = Some(err.to_string());
                    return record;
                }
                return self.failed(cycle, proposal, Some(change), err);
            }
        }

        tracing::info!(
            component = %proposal.component,
            category = %proposal.category,
            applied = change.applied,
            "Applied proposal"
        );
        self.events.emit(OptimizerEvent::ProposalApplied {
            component: proposal.component.clone(),
            category: proposal.category,
            previous_value: change.previous,
            applied_value: change.applied,
        });
        let mut record = ApplicationRecord::new(cycle, proposal, ApplicationStatus::Applied);
        record.previous_value = change.previous;
        record.applied_value = Some(change.applied);
        record
    }

    async fn undo(
        &self,
        proposal: &SystemOptimization,
        implementer: &dyn OptimizationImplementer,
        change: Option<&AppliedChange>,
    ) -> bool {
        match with_timeout(
            "rollback_proposal",
            self.policy.timeout,
            implementer.rollback(proposal, change),
        )
        .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(component = %proposal.component, error = %err, "Rollback failed");
                false
            }
        }
    }

    fn failed(
        &self,
        cycle: u64,
        proposal: &SystemOptimization,
        change: Option<AppliedChange>,
        err: OptimizerError,
    ) -> ApplicationRecord {
        let err = match err {
            e @ OptimizerError::ApplyFailed { .. } => e,
            other => OptimizerError::apply(&proposal.component, other),
        };
        tracing::warn!(
            component = %proposal.component,
            category = %proposal.category,
            error = %err,
            "Proposal application failed"
        );
        self.events.emit(OptimizerEvent::ProposalFailed {
            component: proposal.component.clone(),
            category: proposal.category,
            failure: err.category(),
            error: err.to_string(),
        });
        let mut record = ApplicationRecord::new(cycle, proposal, ApplicationStatus::Failed);
        record.previous_value = change.and_then(|c| c.previous);
        record.applied_value = change.map(|c| c.applied);
        record.error = Some(err.to_string());
        record
    }
}
