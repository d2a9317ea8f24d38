use std::sync::Arc;

use crate::evolution::events::{EventSink, OptimizerEvent};
use crate::evolution::types::{
    AgentPerformance, FailureModes, Level, OptimizationCategory, Pattern, PatternPayload,
    ResourceUsage, SuccessFactors, SystemOptimization, TemporalProfile, UtilizationStatus,
};

const EFFICIENCY_LIFT: f64 = 1.1;
const STRONG_LIFT: f64 = 1.5;
const RETRY_SHARE: f64 = 0.25;
const WORKFLOW_SHARE: f64 = 0.10;
const TARGET_UTILIZATION: f64 = 0.7;
const AGENT_SUCCESS_FLOOR: f64 = 0.6;
const AGENT_SUCCESS_GOAL: f64 = 0.8;
const SLOW_AGENT_FACTOR: f64 = 1.5;
const SLOW_HOUR_FACTOR: f64 = 1.25;

pub struct ImprovementPlanner {
    confidence_threshold: f64,
    targets: Vec<OptimizationCategory>,
    events: Arc<dyn EventSink>,
}

impl ImprovementPlanner {
    pub fn new(
        confidence_threshold: f64,
        targets: Vec<OptimizationCategory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            confidence_threshold,
            targets,
            events,
        }
    }

    /// Proposals from admitted patterns, highest ranking score first.
    pub fn generate(&self, patterns: &[Pattern]) -> Vec<SystemOptimization> {
        let mut proposals = Vec::new();

        for pattern in patterns {
            if pattern.confidence < self.confidence_threshold {
                tracing::debug!(
                    kind = %pattern.kind(),
                    confidence = pattern.confidence,
                    threshold = self.confidence_threshold,
                    "Pattern below confidence threshold"
                );
                self.events.emit(OptimizerEvent::PatternSkipped {
                    kind: pattern.kind(),
                    confidence: pattern.confidence,
                    threshold: self.confidence_threshold,
                });
                continue;
            }

            for proposal in propose(&pattern.payload) {
                if !self.targets.contains(&proposal.category) {
                    tracing::debug!(component = %proposal.component, category = %proposal.category, "Category not targeted");
                    self.events.emit(OptimizerEvent::ProposalFiltered {
                        component: proposal.component,
                        category: proposal.category,
                    });
                    continue;
                }
                proposals.push(proposal);
            }
        }

        rank(&mut proposals);

        for p in &proposals {
            self.events.emit(OptimizerEvent::ProposalGenerated {
                component: p.component.clone(),
                category: p.category,
                score: p.ranking_score(),
            });
        }
        proposals
    }
}

/// Stable descending sort by ranking score.
pub fn rank(proposals: &mut [SystemOptimization]) {
    proposals.sort_by(|a, b| b.ranking_score().total_cmp(&a.ranking_score()));
}

fn propose(payload: &PatternPayload) -> Vec<SystemOptimization> {
    match payload {
        PatternPayload::SuccessFactors(p) => from_success_factors(p),
        PatternPayload::FailureModes(p) => from_failure_modes(p),
        PatternPayload::ResourceOptimization(p) => from_resource_usage(p),
        PatternPayload::AgentPerformance(p) => from_agent_performance(p),
        PatternPayload::Temporal(p) => from_temporal(p),
    }
}

fn read_back(component: &str, target: f64) -> String {
    format!("{component} reads back {target:.3}")
}

fn from_success_factors(p: &SuccessFactors) -> Vec<SystemOptimization> {
    p.factors
        .iter()
        .filter(|f| f.lift >= EFFICIENCY_LIFT)
        .map(|f| {
            let component = format!("resource:{}", f.resource);
            let impact = if f.lift >= STRONG_LIFT { Level::High } else { Level::Medium };
            SystemOptimization::new(OptimizationCategory::Efficiency, &component, f.baseline_mean, f.success_mean)
                .with_levels(Level::Low, impact, Level::Low)
                .with_steps(vec![
                    format!("Move default {} allocation to {:.3}", f.resource, f.success_mean),
                    "Keep the previous allocation for rollback".to_string(),
                ])
                .with_validation(vec![
                    read_back(&component, f.success_mean),
                    "Success rate does not drop in the next cycle".to_string(),
                ])
        })
        .collect()
}

fn from_failure_modes(p: &FailureModes) -> Vec<SystemOptimization> {
    let mut out = Vec::new();
    for mode in &p.modes {
        let target = mode.share / 2.0;
        if mode.share >= RETRY_SHARE {
            let component = format!("retry-policy:{}", mode.category);
            out.push(
                SystemOptimization::new(OptimizationCategory::Reliability, &component, mode.share, target)
                    .with_levels(Level::Low, Level::High, Level::Low)
                    .with_steps(vec![
                        format!("Enable retry with backoff for {} work", mode.category),
                        format!("Target failure share {target:.3}"),
                    ])
                    .with_validation(vec![read_back(&component, target)]),
            );
        } else if mode.share >= WORKFLOW_SHARE {
            let component = format!("workflow:{}", mode.category);
            out.push(
                SystemOptimization::new(OptimizationCategory::Reliability, &component, mode.share, target)
                    .with_levels(Level::Medium, Level::High, Level::Medium)
                    .with_steps(vec![
                        format!("Review the {} workflow for recurring failure causes", mode.category),
                        format!("Mean failing score is {:.3} over {} outcomes", mode.mean_score, mode.count),
                    ])
                    .with_validation(vec![format!("Failure share for {} below {target:.3}", mode.category)]),
            );
        }
    }
    out
}

fn from_resource_usage(p: &ResourceUsage) -> Vec<SystemOptimization> {
    p.resources
        .iter()
        .filter_map(|r| match r.status {
            UtilizationStatus::Over => {
                let component = format!("capacity:{}", r.resource);
                Some(
                    SystemOptimization::new(
                        OptimizationCategory::Scalability,
                        &component,
                        r.mean_utilization,
                        TARGET_UTILIZATION,
                    )
                    .with_levels(Level::Low, Level::High, Level::Low)
                    .with_steps(vec![format!(
                        "Scale {} capacity until utilization is near {TARGET_UTILIZATION:.2}",
                        r.resource
                    )])
                    .with_validation(vec![read_back(&component, TARGET_UTILIZATION)]),
                )
            }
            UtilizationStatus::Under => {
                let component = format!("allocation:{}", r.resource);
                Some(
                    SystemOptimization::new(
                        OptimizationCategory::Cost,
                        &component,
                        r.mean_utilization,
                        TARGET_UTILIZATION,
                    )
                    .with_levels(Level::Low, Level::Medium, Level::Low)
                    .with_steps(vec![format!(
                        "Reduce {} allocation; mean utilization is {:.3} over {} samples",
                        r.resource, r.mean_utilization, r.samples
                    )])
                    .with_validation(vec![format!("{} utilization rises toward {TARGET_UTILIZATION:.2}", r.resource)]),
                )
            }
            UtilizationStatus::Balanced => None,
        })
        .collect()
}

fn from_agent_performance(p: &AgentPerformance) -> Vec<SystemOptimization> {
    let mut out = Vec::new();
    for agent in &p.agents {
        if agent.success_rate < AGENT_SUCCESS_FLOOR {
            out.push(
                SystemOptimization::new(
                    OptimizationCategory::Accuracy,
                    format!("agent:{}", agent.agent_id),
                    agent.success_rate,
                    AGENT_SUCCESS_GOAL,
                )
                .with_levels(Level::Medium, Level::High, Level::Medium)
                .with_steps(vec![
                    format!("Retrain or reconfigure {} agent {}", agent.agent_type, agent.agent_id),
                    format!("Focus areas: {}", agent.improvement_areas.iter().cloned().collect::<Vec<_>>().join(", ")),
                ])
                .with_validation(vec![format!("Success rate reaches {AGENT_SUCCESS_GOAL:.2}")]),
            );
        }

        let limit = p.batch_mean_completion * SLOW_AGENT_FACTOR;
        if p.batch_mean_completion > 0.0 && agent.average_completion_time > limit {
            let component = format!("agent-timeout:{}", agent.agent_id);
            out.push(
                SystemOptimization::new(
                    OptimizationCategory::Performance,
                    &component,
                    agent.average_completion_time,
                    limit,
                )
                .with_levels(Level::Low, Level::Medium, Level::Low)
                .with_steps(vec![format!("Cap {} task time at {limit:.2}h", agent.agent_id)])
                .with_validation(vec![read_back(&component, limit)]),
            );
        }
    }
    out
}

fn from_temporal(p: &TemporalProfile) -> Vec<SystemOptimization> {
    let Some(hour) = p.slowest_hour else {
        return Vec::new();
    };
    let Some(bucket) = p.buckets.iter().find(|b| b.hour == hour) else {
        return Vec::new();
    };
    if p.batch_mean_completion <= 0.0 || bucket.mean_completion_hours <= p.batch_mean_completion * SLOW_HOUR_FACTOR {
        return Vec::new();
    }

    let component = format!("scheduling:hour-{hour}");
    vec![SystemOptimization::new(
        OptimizationCategory::Performance,
        &component,
        bucket.mean_completion_hours,
        p.batch_mean_completion,
    )
    .with_levels(Level::Low, Level::Medium, Level::Low)
    .with_steps(vec![format!("Shift deferrable work away from {hour:02}:00 UTC")])
    .with_validation(vec![read_back(&component, p.batch_mean_completion)])]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::events::MemoryEventSink;
    use crate::evolution::types::{
        FailureMode, HourBucket, PatternKind, ResourceFactor, ResourceProfile,
    };

    fn planner(threshold: f64) -> (ImprovementPlanner, Arc<MemoryEventSink>) {
        let events = Arc::new(MemoryEventSink::new());
        (
            ImprovementPlanner::new(threshold, OptimizationCategory::ALL.to_vec(), events.clone()),
            events,
        )
    }

    fn usage(resources: &[(&str, f64)], observed: usize) -> PatternPayload {
        PatternPayload::ResourceOptimization(ResourceUsage {
            observed: (0..observed).map(|i| format!("p{i}")).collect(),
            resources: resources
                .iter()
                .map(|(name, mean)| ResourceProfile {
                    resource: name.to_string(),
                    mean_utilization: *mean,
                    samples: observed,
                    status: if *mean > 0.85 {
                        UtilizationStatus::Over
                    } else if *mean < 0.30 {
                        UtilizationStatus::Under
                    } else {
                        UtilizationStatus::Balanced
                    },
                })
                .collect(),
        })
    }

    #[test]
    fn test_low_confidence_patterns_yield_nothing() {
        let (planner, events) = planner(0.7);
        let patterns: Vec<Pattern> = PatternKind::ALL
            .iter()
            .map(|_| Pattern {
                payload: usage(&[("cpu", 0.95)], 50),
                confidence: 0.5,
            })
            .collect();
        assert!(planner.generate(&patterns).is_empty());
        assert_eq!(events.count("pattern_skipped"), 5);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let (planner, _) = planner(0.4);
        let pattern = Pattern::new(usage(&[("cpu", 0.95)], 50));
        let proposals = planner.generate(&[pattern]);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].component, "capacity:cpu");
        assert_eq!(proposals[0].category, OptimizationCategory::Scalability);
        assert!(proposals[0].is_low_risk());
    }

    #[test]
    fn test_ranking_descends_and_keeps_ties() {
        let mk = |name: &str, effort, impact| {
            SystemOptimization::new(OptimizationCategory::Performance, name, 1.0, 2.0)
                .with_levels(effort, impact, Level::Low)
        };
        let mut proposals = vec![
            mk("medium", Level::Medium, Level::Medium),
            mk("tie-a", Level::Low, Level::Medium),
            mk("best", Level::Low, Level::High),
            mk("tie-b", Level::Low, Level::Medium),
        ];
        rank(&mut proposals);
        let order: Vec<&str> = proposals.iter().map(|p| p.component.as_str()).collect();
        assert_eq!(order, vec!["best", "tie-a", "tie-b", "medium"]);
    }

    #[test]
    fn test_untargeted_categories_dropped() {
        let events = Arc::new(MemoryEventSink::new());
        let planner = ImprovementPlanner::new(0.0, vec![OptimizationCategory::Scalability], events.clone());
        let pattern = Pattern::new(usage(&[("cpu", 0.95), ("disk", 0.1)], 100));
        let proposals = planner.generate(&[pattern]);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].component, "capacity:cpu");
        assert_eq!(events.count("proposal_filtered"), 1);
    }

    #[test]
    fn test_success_factor_lift_rules() {
        let sf = SuccessFactors {
            supporting: vec!["a".into()],
            factors: vec![
                ResourceFactor { resource: "cache".into(), success_mean: 0.9, baseline_mean: 0.5, lift: 1.8 },
                ResourceFactor { resource: "cpu".into(), success_mean: 0.6, baseline_mean: 0.5, lift: 1.2 },
                ResourceFactor { resource: "disk".into(), success_mean: 0.5, baseline_mean: 0.5, lift: 1.0 },
            ],
            recurring_lessons: vec![],
        };
        let proposals = from_success_factors(&sf);
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].expected_impact, Level::High);
        assert_eq!(proposals[1].expected_impact, Level::Medium);
        assert!((proposals[0].improvement_percentage - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_share_tiers() {
        let fm = FailureModes {
            failing: vec!["a".into(); 10],
            modes: vec![
                FailureMode { category: "deploy".into(), count: 6, share: 0.6, mean_score: 0.2 },
                FailureMode { category: "test".into(), count: 3, share: 0.15, mean_score: 0.3 },
                FailureMode { category: "lint".into(), count: 1, share: 0.05, mean_score: 0.4 },
            ],
            error_tags: vec![],
        };
        let proposals = from_failure_modes(&fm);
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].component, "retry-policy:deploy");
        assert!(proposals[0].is_low_risk());
        assert_eq!(proposals[1].component, "workflow:test");
        assert!(!proposals[1].is_low_risk());
    }

    #[test]
    fn test_temporal_slow_hour() {
        let profile = TemporalProfile {
            observed: vec!["a".into(), "b".into()],
            buckets: vec![
                HourBucket { hour: 9, count: 1, mean_completion_hours: 1.0, mean_success: 0.9 },
                HourBucket { hour: 17, count: 1, mean_completion_hours: 5.0, mean_success: 0.4 },
            ],
            batch_mean_completion: 3.0,
            slowest_hour: Some(17),
        };
        let proposals = from_temporal(&profile);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].component, "scheduling:hour-17");
        assert_eq!(proposals[0].target_value, 3.0);
    }
}
