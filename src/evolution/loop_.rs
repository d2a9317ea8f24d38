use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{CyclePhase, CycleReport, LoopStats, OptimizerError};
use crate::evolution::analyzer::PatternAnalyzer;
use crate::evolution::engine::OptimizerConfig;
use crate::evolution::events::{EventSink, OptimizerEvent};
use crate::evolution::executor::{
    ExecutorPolicy, OptimizationImplementer, RiskGatedExecutor, TuningTable,
};
use crate::evolution::planner::ImprovementPlanner;
use crate::evolution::updater::ModelUpdater;
use crate::registry::ModelRegistry;
use crate::store::{OutcomeBackend, OutcomeStoreAdapter, TimeWindow};

/// Inter-cycle wait. Returns false when cancelled before the interval elapsed.
#[async_trait]
pub trait CycleTimer: Send + Sync {
    async fn sleep(&self, duration: Duration, token: &CancellationToken) -> bool;
}

#[derive(Debug, Default)]
pub struct TokioCycleTimer;

#[async_trait]
impl CycleTimer for TokioCycleTimer {
    async fn sleep(&self, duration: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Records requested sleeps without waiting; cancels the token after `stop_after` sleeps.
#[derive(Debug)]
pub struct ManualCycleTimer {
    sleeps: Mutex<Vec<Duration>>,
    stop_after: usize,
}

impl ManualCycleTimer {
    pub fn new(stop_after: usize) -> Self {
        Self {
            sleeps: Mutex::new(Vec::new()),
            stop_after,
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CycleTimer for ManualCycleTimer {
    async fn sleep(&self, duration: Duration, token: &CancellationToken) -> bool {
        let count = match self.sleeps.lock() {
            Ok(mut sleeps) => {
                sleeps.push(duration);
                sleeps.len()
            }
            Err(_) => self.stop_after,
        };
        if count >= self.stop_after {
            token.cancel();
        }
        tokio::task::yield_now().await;
        !token.is_cancelled()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub store_ok: bool,
    pub registry_ok: bool,
    pub consecutive_failures: u32,
    pub cycles_completed: u64,
    pub proposals_applied_total: u64,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store_ok && self.registry_ok
    }
}

#[derive(Default)]
struct LoopState {
    stats: LoopStats,
    cycle: u64,
    /// Upper bound of the last window whose outcomes reached the registry.
    watermark: Option<DateTime<Utc>>,
}

pub struct ControlLoop {
    config: OptimizerConfig,
    store: Arc<OutcomeStoreAdapter>,
    analyzer: PatternAnalyzer,
    planner: ImprovementPlanner,
    executor: RiskGatedExecutor,
    updater: ModelUpdater,
    tuning: TuningTable,
    timer: Arc<dyn CycleTimer>,
    events: Arc<dyn EventSink>,
    state: Mutex<LoopState>,
}

impl ControlLoop {
    pub fn new(
        config: OptimizerConfig,
        backend: Arc<dyn OutcomeBackend>,
        registry: Arc<dyn ModelRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let store = Arc::new(OutcomeStoreAdapter::new(backend, config.stage_timeout, events.clone()));
        let tuning = TuningTable::new();
        let analyzer = PatternAnalyzer::new(config.analyzer_settings(), events.clone());
        let planner = ImprovementPlanner::new(
            config.confidence_threshold,
            config.optimization_targets.clone(),
            events.clone(),
        );
        let executor = RiskGatedExecutor::new(ExecutorPolicy::from(&config), store.clone(), events.clone())
            .with_tuning_table(&tuning);
        let updater = ModelUpdater::new(
            registry,
            config.stage_timeout,
            config.failure_threshold,
            config.learning_modes.clone(),
            events.clone(),
        );

        Self {
            config,
            store,
            analyzer,
            planner,
            executor,
            updater,
            tuning,
            timer: Arc::new(TokioCycleTimer),
            events,
            state: Mutex::new(LoopState::default()),
        }
    }

    pub fn with_timer(mut self, timer: Arc<dyn CycleTimer>) -> Self {
        self.timer = timer;
        self
    }

    /// Replaces the implementer for the implementer's category.
    pub fn with_implementer(mut self, implementer: Arc<dyn OptimizationImplementer>) -> Self {
        self.executor = self.executor.with_implementer(implementer);
        self
    }

    pub fn tuning_table(&self) -> &TuningTable {
        &self.tuning
    }

    pub fn updater(&self) -> &ModelUpdater {
        &self.updater
    }

    pub fn stats(&self) -> LoopStats {
        self.state().stats.clone()
    }

    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, cycle: u64, phase: CyclePhase) {
        self.state().stats.phase = phase;
        tracing::debug!(cycle, phase = %phase, "Entering phase");
        self.events.emit(OptimizerEvent::PhaseEntered { cycle, phase });
    }

    /// Runs until `token` is cancelled. A failed cycle never ends the loop.
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!(
            learning_interval = self.config.learning_interval.as_secs(),
            recovery_interval = self.config.recovery_interval.as_secs(),
            "Control loop started"
        );

        while !token.is_cancelled() {
            let outcome = tokio::select! {
                _ = token.cancelled() => break,
                result = self.run_cycle() => result,
            };

            let (interval, recovery) = match outcome {
                Ok(_) => (self.config.learning_interval, false),
                Err(_) => (self.config.recovery_interval, true),
            };

            let cycle = self.state().cycle;
            self.enter(cycle, CyclePhase::Sleeping);
            self.events.emit(OptimizerEvent::Sleeping {
                seconds: interval.as_secs(),
                recovery,
            });
            if !self.timer.sleep(interval, &token).await {
                break;
            }
        }

        self.state().stats.phase = CyclePhase::Idle;
        tracing::info!("Control loop stopped");
    }

    /// One full pass. Errors are recorded in the stats and event stream before returning.
    pub async fn run_cycle(&self) -> Result<CycleReport, OptimizerError> {
        let cycle = {
            let mut state = self.state();
            state.cycle += 1;
            state.cycle
        };

        match self.stages(cycle).await {
            Ok(report) => {
                {
                    let mut state = self.state();
                    state.stats.cycles_completed += 1;
                    state.stats.consecutive_failures = 0;
                    state.stats.proposals_applied_total += report.applied as u64;
                    state.stats.last_report = Some(report.clone());
                    state.stats.last_error = None;
                }
                tracing::info!(
                    cycle,
                    outcomes = report.outcomes,
                    proposals = report.proposals,
                    applied = report.applied,
                    "Cycle completed"
                );
                self.events.emit(OptimizerEvent::CycleCompleted {
                    cycle,
                    outcomes: report.outcomes,
                    proposals: report.proposals,
                    applied: report.applied,
                });
                Ok(report)
            }
            Err(err) => {
                let phase = {
                    let mut state = self.state();
                    state.stats.cycles_failed += 1;
                    state.stats.consecutive_failures += 1;
                    state.stats.last_error = Some(err.to_string());
                    state.stats.phase
                };
                tracing::error!(cycle, phase = %phase, error = %err, "Cycle failed");
                self.events.emit(OptimizerEvent::CycleFailed {
                    cycle,
                    phase,
                    failure: err.category(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn stages(&self, cycle: u64) -> Result<CycleReport, OptimizerError> {
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        self.enter(cycle, CyclePhase::Collecting);
        let window = self.collection_window();
        let outcomes = self.store.fetch_recent_outcomes(window).await?;
        report.outcomes = outcomes.len();
        self.events.emit(OptimizerEvent::OutcomesCollected {
            cycle,
            count: outcomes.len(),
        });

        self.enter(cycle, CyclePhase::Analyzing);
        let patterns = self.analyzer.analyze(&outcomes);
        report.patterns = patterns.len();
        report.patterns_admitted = patterns
            .iter()
            .filter(|p| p.confidence >= self.config.confidence_threshold)
            .count();

        self.enter(cycle, CyclePhase::Generating);
        let proposals = self.planner.generate(&patterns);
        report.proposals = proposals.len();

        self.enter(cycle, CyclePhase::Executing);
        let summary = self.executor.execute_safe(cycle, &proposals).await;
        report.applied = summary.applied();
        report.failed_applications = summary.failed();

        self.enter(cycle, CyclePhase::Updating);
        let update = self.updater.update(&outcomes, &summary.records).await;
        report.models_updated = update.succeeded.len();
        report.models_failed = update.failed.len();
        if let Some(err) = update.unavailable() {
            return Err(err);
        }
        // advance only once the window reached the registry
        self.state().watermark = Some(window.until);

        self.enter(cycle, CyclePhase::HealthCheck);
        let health = self.health_check(cycle).await;
        report.healthy = health.is_healthy();

        report.finished_at = Some(Utc::now());
        Ok(report)
    }

    /// `(max(watermark, now - outcome_window), now]`
    fn collection_window(&self) -> TimeWindow {
        let trailing = TimeWindow::trailing(self.config.outcome_window);
        match self.state().watermark {
            Some(mark) if mark > trailing.since => TimeWindow::between(mark, trailing.until),
            _ => trailing,
        }
    }

    /// Pings both collaborators. A degraded report is an event, not a failure.
    pub async fn health_check(&self, cycle: u64) -> HealthReport {
        let store_ok = self.store.ping().await.is_ok();
        let registry_ok = self.updater.ping().await;
        let report = {
            let state = self.state();
            HealthReport {
                store_ok,
                registry_ok,
                consecutive_failures: state.stats.consecutive_failures,
                cycles_completed: state.stats.cycles_completed,
                proposals_applied_total: state.stats.proposals_applied_total,
            }
        };

        if !report.is_healthy() {
            tracing::warn!(store_ok, registry_ok, "Collaborator health degraded");
        }
        self.events.emit(OptimizerEvent::HealthReport {
            cycle,
            store_ok,
            registry_ok,
            consecutive_failures: report.consecutive_failures,
        });
        report
    }
}
