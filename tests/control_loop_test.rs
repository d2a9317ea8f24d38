//! 控制循环集成测试

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use bee_optimizer::core::{CyclePhase, FailureCategory, OptimizerError};
    use bee_optimizer::evolution::{
        rank, AppliedChange, ApplicationStatus, ControlLoop, CycleTimer, ExecutorPolicy, Level,
        ManualCycleTimer, MemoryEventSink, OptimizationCategory, OptimizationImplementer,
        OptimizerConfig, OptimizerEvent, RiskGatedExecutor, SystemOptimization,
    };
    use bee_optimizer::registry::InMemoryModelRegistry;
    use bee_optimizer::store::{InMemoryOutcomeBackend, OutcomeStoreAdapter, RawOutcome, SqliteOutcomeBackend};

    struct Harness {
        control: ControlLoop,
        backend: Arc<InMemoryOutcomeBackend>,
        registry: Arc<InMemoryModelRegistry>,
        events: Arc<MemoryEventSink>,
    }

    fn harness(config: OptimizerConfig) -> Harness {
        let backend = Arc::new(InMemoryOutcomeBackend::new());
        let registry = Arc::new(InMemoryModelRegistry::new());
        let events = Arc::new(MemoryEventSink::new());
        let control = ControlLoop::new(config, backend.clone(), registry.clone(), events.clone());
        Harness {
            control,
            backend,
            registry,
            events,
        }
    }

    /// n 个刚完成的项目，cpu 利用率都偏高
    fn seed_hot_cpu(backend: &InMemoryOutcomeBackend, n: usize) {
        let now = Utc::now();
        for i in 0..n {
            let id = format!("proj-{i}");
            backend.push_outcome(
                RawOutcome::new(&id, "build", 0.9)
                    .completed_in(2.0)
                    .created_at(now - chrono::Duration::seconds(i as i64 + 1)),
            );
            backend.set_resource(&id, "cpu", Some(0.95));
        }
    }

    #[tokio::test]
    async fn test_scores_clamped_during_ingestion() {
        let h = harness(OptimizerConfig::default());
        h.backend.push_outcome(RawOutcome::new("high", "build", 1.4));
        h.backend.push_outcome(RawOutcome::new("low", "build", -0.2));

        h.control.run_cycle().await.unwrap();

        let (_, batch) = &h.registry.calls()[0];
        let scores: Vec<f64> = batch.records.iter().map(|r| r.labels["success_score"]).collect();
        assert_eq!(scores, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_confident_pattern_applied_end_to_end() {
        let h = harness(OptimizerConfig::default());
        seed_hot_cpu(&h.backend, 120);

        let report = h.control.run_cycle().await.unwrap();
        assert_eq!(report.outcomes, 120);
        assert_eq!(report.patterns, 5);
        assert_eq!(report.proposals, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(report.models_updated, 4);
        assert!(report.healthy);

        assert_eq!(h.control.tuning_table().get("capacity:cpu").await, Some(0.7));
        let audit = h.backend.applications();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, ApplicationStatus::Applied);
        assert_eq!(audit[0].category, OptimizationCategory::Scalability);

        // 默认学习模式含 reinforcement，应用结果随批次提交
        let (_, batch) = &h.registry.calls()[0];
        assert_eq!(batch.applications.len(), 1);
        assert_eq!(h.control.stats().proposals_applied_total, 1);
    }

    #[tokio::test]
    async fn test_half_confidence_batch_yields_no_proposals() {
        let h = harness(OptimizerConfig::default());
        seed_hot_cpu(&h.backend, 50);

        let report = h.control.run_cycle().await.unwrap();
        assert_eq!(report.patterns, 5);
        assert_eq!(report.patterns_admitted, 0);
        assert_eq!(report.proposals, 0);
        assert_eq!(h.events.count("pattern_skipped"), 5);
        assert!(h.backend.applications().is_empty());
    }

    #[test]
    fn test_ranking_order_is_deterministic() {
        let high = SystemOptimization::new(OptimizationCategory::Performance, "high", 1.0, 2.0)
            .with_levels(Level::Low, Level::High, Level::Low);
        let medium = SystemOptimization::new(OptimizationCategory::Performance, "medium", 1.0, 2.0)
            .with_levels(Level::Medium, Level::Medium, Level::Low);
        let tie = SystemOptimization::new(OptimizationCategory::Efficiency, "tie", 1.0, 2.0)
            .with_levels(Level::Low, Level::High, Level::Low);
        assert!((high.ranking_score() - 1.0).abs() < 1e-12);
        assert!((medium.ranking_score() - 0.36).abs() < 1e-12);

        let mut proposals = vec![medium, high, tie];
        rank(&mut proposals);
        let order: Vec<&str> = proposals.iter().map(|p| p.component.as_str()).collect();
        assert_eq!(order, vec!["high", "tie", "medium"]);
    }

    /// 对指定组件抛错，其余正常
    struct FailingOn {
        component: &'static str,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OptimizationImplementer for FailingOn {
        fn category(&self) -> OptimizationCategory {
            OptimizationCategory::Performance
        }

        async fn apply(&self, proposal: &SystemOptimization) -> Result<AppliedChange, OptimizerError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(proposal.component.clone());
            }
            if proposal.component == self.component {
                return Err(OptimizerError::apply(&proposal.component, "simulated outage"));
            }
            Ok(AppliedChange {
                previous: None,
                applied: proposal.target_value,
            })
        }

        async fn verify(&self, _: &SystemOptimization, _: &AppliedChange) -> Result<bool, OptimizerError> {
            Ok(true)
        }

        async fn rollback(&self, _: &SystemOptimization, _: Option<&AppliedChange>) -> Result<(), OptimizerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_one_failed_application_does_not_stop_the_rest() {
        let backend = Arc::new(InMemoryOutcomeBackend::new());
        let events = Arc::new(MemoryEventSink::new());
        let store = Arc::new(OutcomeStoreAdapter::new(backend.clone(), Duration::from_secs(5), events.clone()));
        let implementer = Arc::new(FailingOn {
            component: "p2",
            seen: Mutex::new(Vec::new()),
        });
        let executor = RiskGatedExecutor::new(ExecutorPolicy::from(&OptimizerConfig::default()), store, events.clone())
            .with_implementer(implementer.clone());

        let proposals: Vec<SystemOptimization> = ["p1", "p2", "p3"]
            .iter()
            .map(|c| {
                SystemOptimization::new(OptimizationCategory::Performance, *c, 4.0, 3.0)
                    .with_levels(Level::Low, Level::Medium, Level::Low)
            })
            .collect();

        let summary = executor.execute_safe(1, &proposals).await;
        let statuses: Vec<(String, ApplicationStatus)> = summary
            .records
            .iter()
            .map(|r| (r.component.clone(), r.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("p1".to_string(), ApplicationStatus::Applied),
                ("p2".to_string(), ApplicationStatus::Failed),
                ("p3".to_string(), ApplicationStatus::Applied),
            ]
        );
        assert_eq!(summary.attempted(), 3);
        assert_eq!(implementer.seen.lock().unwrap().clone(), vec!["p1", "p2", "p3"]);
        assert_eq!(backend.applications().len(), 3);

        let failure = events.events().into_iter().find_map(|e| match e {
            OptimizerEvent::ProposalFailed { component, failure, .. } => Some((component, failure)),
            _ => None,
        });
        assert_eq!(failure, Some(("p2".to_string(), FailureCategory::ProposalApplication)));
    }

    #[tokio::test]
    async fn test_low_impact_proposal_never_auto_applied() {
        let h = harness(OptimizerConfig::default());
        let proposal = SystemOptimization::new(OptimizationCategory::Performance, "p", 1.0, 2.0)
            .with_levels(Level::Low, Level::Low, Level::Low);
        assert!(!proposal.is_low_risk());

        let backend = Arc::new(InMemoryOutcomeBackend::new());
        let store = Arc::new(OutcomeStoreAdapter::new(backend, Duration::from_secs(5), h.events.clone()));
        let executor = RiskGatedExecutor::new(ExecutorPolicy::from(&OptimizerConfig::default()), store, h.events.clone())
            .with_tuning_table(h.control.tuning_table());
        let summary = executor.execute_safe(1, &[proposal]).await;
        assert_eq!(summary.records[0].status, ApplicationStatus::ManualReview);
        assert!(h.control.tuning_table().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_registry_calls() {
        let h = harness(OptimizerConfig::default());
        let report = h.control.run_cycle().await.unwrap();
        assert_eq!(report.outcomes, 0);
        assert_eq!(report.patterns, 0);
        assert_eq!(report.models_updated, 0);
        assert_eq!(h.registry.call_count(), 0);
        assert_eq!(h.events.count("model_updated"), 0);
    }

    /// 第一次休眠时恢复存储，之后再休眠一次即停止
    struct RecoveringTimer {
        backend: Arc<InMemoryOutcomeBackend>,
        inner: ManualCycleTimer,
    }

    #[async_trait]
    impl CycleTimer for RecoveringTimer {
        async fn sleep(&self, duration: Duration, token: &CancellationToken) -> bool {
            self.backend.set_query_delay(None);
            self.inner.sleep(duration, token).await
        }
    }

    #[tokio::test]
    async fn test_store_timeout_sleeps_recovery_interval_then_continues() {
        let mut config = OptimizerConfig::default();
        config.stage_timeout = Duration::from_millis(50);
        let h = harness(config);
        h.backend.set_query_delay(Some(Duration::from_secs(5)));
        let timer = Arc::new(RecoveringTimer {
            backend: h.backend.clone(),
            inner: ManualCycleTimer::new(2),
        });
        let control = h.control.with_timer(timer.clone());

        control.run(CancellationToken::new()).await;

        assert_eq!(
            timer.inner.sleeps(),
            vec![Duration::from_secs(60), Duration::from_secs(300)]
        );
        let stats = control.stats();
        assert_eq!(stats.cycles_failed, 1);
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(h.backend.outcome_queries(), 2);

        let failed = h.events.events().into_iter().find_map(|e| match e {
            OptimizerEvent::CycleFailed { cycle, phase, failure, .. } => Some((cycle, phase, failure)),
            _ => None,
        });
        assert_eq!(
            failed,
            Some((1, CyclePhase::Collecting, FailureCategory::CollaboratorUnavailable))
        );
    }

    #[tokio::test]
    async fn test_cancelled_token_interrupts_real_sleep() {
        let h = harness(OptimizerConfig::default());
        let token = CancellationToken::new();
        let control = Arc::new(h.control);
        let runner = {
            let control = control.clone();
            let token = token.clone();
            tokio::spawn(async move { control.run(token).await })
        };

        // 第一个周期完成后进入 300 秒的休眠
        for _ in 0..100 {
            if control.stats().cycles_completed >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("loop should stop promptly")
            .unwrap();
        assert_eq!(control.stats().phase, CyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_sqlite_backend_full_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SqliteOutcomeBackend::open(dir.path().join("outcomes.db")).unwrap());
        let now = Utc::now();
        for i in 0..110 {
            let id = format!("proj-{i}");
            backend
                .insert_project(&id, "completed", Some(now - chrono::Duration::hours(3)), Some(now))
                .await
                .unwrap();
            backend
                .insert_outcome(&id, "build", 0.9, &[], &[], &[], now - chrono::Duration::seconds(i + 1))
                .await
                .unwrap();
            backend.insert_metric(&id, "cpu", Some(0.95), now).await.unwrap();
        }
        backend.insert_project("running", "in_progress", Some(now), None).await.unwrap();
        backend
            .insert_outcome("running", "build", 0.1, &[], &[], &[], now - chrono::Duration::seconds(5))
            .await
            .unwrap();

        let registry = Arc::new(InMemoryModelRegistry::new());
        let events = Arc::new(MemoryEventSink::new());
        let control = ControlLoop::new(OptimizerConfig::default(), backend.clone(), registry.clone(), events);

        let report = control.run_cycle().await.unwrap();
        assert_eq!(report.outcomes, 110);
        assert_eq!(report.applied, 1);
        let audit = backend.list_applications().await.unwrap();
        assert_eq!(
            audit,
            vec![("capacity:cpu".to_string(), "scalability".to_string(), "applied".to_string())]
        );
        assert_eq!(registry.call_count(), 4);
    }
}
