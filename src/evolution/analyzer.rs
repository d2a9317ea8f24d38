use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Timelike;

use crate::evolution::events::{EventSink, OptimizerEvent};
use crate::evolution::types::{
    AgentPerformance, AgentPerformanceMetrics, FailureMode, FailureModes, HourBucket, Occurrence,
    Outcome, Pattern, PatternKind, PatternPayload, ResourceFactor, ResourceProfile, ResourceUsage,
    SuccessFactors, TemporalProfile, UtilizationStatus,
};

pub const OVER_UTILIZED: f64 = 0.85;
pub const UNDER_UTILIZED: f64 = 0.30;
const MAX_RECURRING: usize = 10;

/// Score cut-offs shared by the pattern handlers.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerSettings {
    /// Outcomes at or above this score support the success-factor pattern.
    pub high_success_threshold: f64,
    /// Outcomes below this score count as failures.
    pub failure_threshold: f64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            high_success_threshold: 0.8,
            failure_threshold: 0.5,
        }
    }
}

pub struct PatternAnalyzer {
    settings: AnalyzerSettings,
    events: Arc<dyn EventSink>,
}

impl PatternAnalyzer {
    pub fn new(settings: AnalyzerSettings, events: Arc<dyn EventSink>) -> Self {
        Self { settings, events }
    }

    /// One pattern per kind for a non-empty batch; nothing for an empty one.
    pub fn analyze(&self, outcomes: &[Outcome]) -> Vec<Pattern> {
        if outcomes.is_empty() {
            return Vec::new();
        }

        PatternKind::ALL
            .iter()
            .map(|kind| {
                let pattern = Pattern::new(kind.extract(outcomes, &self.settings));
                self.events.emit(OptimizerEvent::PatternDetected {
                    kind: *kind,
                    confidence: pattern.confidence,
                    sample_size: pattern.payload.sample_size(),
                });
                pattern
            })
            .collect()
    }
}

impl PatternKind {
    /// Handler dispatch: each kind owns exactly one extraction routine.
    pub fn extract(&self, outcomes: &[Outcome], settings: &AnalyzerSettings) -> PatternPayload {
        match self {
            PatternKind::SuccessFactors => {
                PatternPayload::SuccessFactors(success_factors(outcomes, settings))
            }
            PatternKind::FailureModes => PatternPayload::FailureModes(failure_modes(outcomes, settings)),
            PatternKind::ResourceOptimization => {
                PatternPayload::ResourceOptimization(resource_usage(outcomes))
            }
            PatternKind::AgentPerformance => {
                PatternPayload::AgentPerformance(agent_performance(outcomes, settings))
            }
            PatternKind::Temporal => PatternPayload::Temporal(temporal_profile(outcomes)),
        }
    }
}

fn mean<I: IntoIterator<Item = f64>>(values: I) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// Counts values appearing at least `min_count` times, most frequent first.
fn recurring<I: IntoIterator<Item = String>>(values: I, min_count: usize) -> Vec<Occurrence> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for v in values {
        let v = v.trim();
        if !v.is_empty() {
            *counts.entry(v.to_string()).or_default() += 1;
        }
    }
    let mut items: Vec<Occurrence> = counts
        .into_iter()
        .filter(|(_, count)| *count >= min_count)
        .map(|(value, count)| Occurrence { value, count })
        .collect();
    items.sort_by(|a, b| b.count.cmp(&a.count));
    items.truncate(MAX_RECURRING);
    items
}

fn resource_names(outcomes: &[Outcome]) -> BTreeSet<&str> {
    outcomes
        .iter()
        .flat_map(|o| o.resource_utilization.keys().map(String::as_str))
        .collect()
}

fn resource_mean<'a, I: IntoIterator<Item = &'a Outcome>>(outcomes: I, resource: &str) -> Option<f64> {
    mean(
        outcomes
            .into_iter()
            .filter_map(|o| o.resource_utilization.get(resource).copied()),
    )
}

fn success_factors(outcomes: &[Outcome], settings: &AnalyzerSettings) -> SuccessFactors {
    let supporting: Vec<&Outcome> = outcomes
        .iter()
        .filter(|o| o.success_score >= settings.high_success_threshold)
        .collect();
    if supporting.is_empty() {
        return SuccessFactors::default();
    }

    let mut factors: Vec<ResourceFactor> = resource_names(outcomes)
        .into_iter()
        .filter_map(|resource| {
            let success_mean = resource_mean(supporting.iter().copied(), resource)?;
            let baseline_mean = resource_mean(outcomes, resource)?;
            let lift = if baseline_mean > 0.0 {
                success_mean / baseline_mean
            } else {
                1.0
            };
            Some(ResourceFactor {
                resource: resource.to_string(),
                success_mean,
                baseline_mean,
                lift,
            })
        })
        .collect();
    factors.sort_by(|a, b| b.lift.total_cmp(&a.lift));

    SuccessFactors {
        supporting: supporting.iter().map(|o| o.id.clone()).collect(),
        factors,
        recurring_lessons: recurring(supporting.iter().flat_map(|o| o.lessons.iter().cloned()), 2),
    }
}

fn failure_modes(outcomes: &[Outcome], settings: &AnalyzerSettings) -> FailureModes {
    let failing: Vec<&Outcome> = outcomes
        .iter()
        .filter(|o| o.success_score < settings.failure_threshold)
        .collect();
    if failing.is_empty() {
        return FailureModes::default();
    }

    let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for o in &failing {
        groups.entry(o.category.as_str()).or_default().push(o.success_score);
    }
    let total = failing.len() as f64;
    let mut modes: Vec<FailureMode> = groups
        .into_iter()
        .map(|(category, scores)| FailureMode {
            category: category.to_string(),
            count: scores.len(),
            share: scores.len() as f64 / total,
            mean_score: mean(scores.iter().copied()).unwrap_or(0.0),
        })
        .collect();
    modes.sort_by(|a, b| b.count.cmp(&a.count));

    FailureModes {
        failing: failing.iter().map(|o| o.id.clone()).collect(),
        modes,
        error_tags: recurring(failing.iter().flat_map(|o| o.pattern_tags("error")), 1),
    }
}

fn resource_usage(outcomes: &[Outcome]) -> ResourceUsage {
    let observed: Vec<&Outcome> = outcomes
        .iter()
        .filter(|o| !o.resource_utilization.is_empty())
        .collect();

    let resources = resource_names(outcomes)
        .into_iter()
        .filter_map(|resource| {
            let values: Vec<f64> = observed
                .iter()
                .filter_map(|o| o.resource_utilization.get(resource).copied())
                .collect();
            let mean_utilization = mean(values.iter().copied())?;
            let status = if mean_utilization > OVER_UTILIZED {
                UtilizationStatus::Over
            } else if mean_utilization < UNDER_UTILIZED {
                UtilizationStatus::Under
            } else {
                UtilizationStatus::Balanced
            };
            Some(ResourceProfile {
                resource: resource.to_string(),
                mean_utilization,
                samples: values.len(),
                status,
            })
        })
        .collect();

    ResourceUsage {
        observed: observed.iter().map(|o| o.id.clone()).collect(),
        resources,
    }
}

/// Agent identity from an upstream `agent` pattern record, else the outcome category.
fn attribute(outcome: &Outcome) -> (String, String) {
    outcome
        .detected_patterns
        .iter()
        .filter(|p| p.kind == "agent")
        .find_map(|p| {
            let id = p.payload.get("agent_id")?.as_str()?.to_string();
            let agent_type = p
                .payload
                .get("agent_type")
                .and_then(|t| t.as_str())
                .unwrap_or(outcome.category.as_str())
                .to_string();
            Some((id, agent_type))
        })
        .unwrap_or_else(|| (outcome.category.clone(), outcome.category.clone()))
}

/// Per-agent summaries. Each outcome record counts exactly once toward
/// `tasks_completed`; it is a success when its score is at or above the failure threshold.
pub fn agent_metrics(outcomes: &[Outcome], failure_threshold: f64) -> Vec<AgentPerformanceMetrics> {
    let batch_mean = mean(outcomes.iter().map(|o| o.completion_hours)).unwrap_or(0.0);

    let mut groups: BTreeMap<String, (String, Vec<&Outcome>)> = BTreeMap::new();
    for o in outcomes {
        let (id, agent_type) = attribute(o);
        groups.entry(id).or_insert_with(|| (agent_type, Vec::new())).1.push(o);
    }

    groups
        .into_iter()
        .filter_map(|(agent_id, (agent_type, items))| {
            let timestamp = items.iter().map(|o| o.timestamp).max()?;
            let n = items.len();
            let successes = items.iter().filter(|o| o.success_score >= failure_threshold).count();
            let success_rate = successes as f64 / n as f64;
            let average_completion_time = mean(items.iter().map(|o| o.completion_hours)).unwrap_or(0.0);
            let quality_score = mean(items.iter().map(|o| {
                o.quality_metrics
                    .get("average_quality")
                    .copied()
                    .unwrap_or(crate::store::DEFAULT_QUALITY_SCORE)
            }))
            .unwrap_or(crate::store::DEFAULT_QUALITY_SCORE);
            let mean_success = mean(items.iter().map(|o| o.success_score)).unwrap_or(0.0);
            let efficiency_score = if average_completion_time > 0.0 && batch_mean > 0.0 {
                mean_success * (batch_mean / average_completion_time).min(1.0)
            } else {
                mean_success
            };

            let mut strengths = BTreeSet::new();
            let mut improvement_areas = BTreeSet::new();
            if success_rate >= 0.9 {
                strengths.insert("reliable".to_string());
            }
            if success_rate < 0.6 {
                improvement_areas.insert("reliability".to_string());
            }
            if batch_mean > 0.0 && average_completion_time < batch_mean * 0.75 {
                strengths.insert("fast".to_string());
            }
            if batch_mean > 0.0 && average_completion_time > batch_mean * 1.5 {
                improvement_areas.insert("speed".to_string());
            }
            if quality_score >= 0.9 {
                strengths.insert("high_quality".to_string());
            }
            if quality_score < 0.7 {
                improvement_areas.insert("quality".to_string());
            }

            Some(AgentPerformanceMetrics {
                agent_id,
                agent_type,
                tasks_completed: n as u64,
                success_rate,
                average_completion_time,
                quality_score,
                efficiency_score,
                error_patterns: items.iter().flat_map(|o| o.pattern_tags("error")).collect(),
                strengths,
                improvement_areas,
                timestamp,
            })
        })
        .collect()
}

fn agent_performance(outcomes: &[Outcome], settings: &AnalyzerSettings) -> AgentPerformance {
    AgentPerformance {
        attributed: outcomes.iter().map(|o| o.id.clone()).collect(),
        agents: agent_metrics(outcomes, settings.failure_threshold),
        batch_mean_completion: mean(outcomes.iter().map(|o| o.completion_hours)).unwrap_or(0.0),
    }
}

fn temporal_profile(outcomes: &[Outcome]) -> TemporalProfile {
    let mut by_hour: BTreeMap<u32, Vec<&Outcome>> = BTreeMap::new();
    for o in outcomes {
        by_hour.entry(o.timestamp.hour()).or_default().push(o);
    }

    let buckets: Vec<HourBucket> = by_hour
        .into_iter()
        .map(|(hour, items)| HourBucket {
            hour,
            count: items.len(),
            mean_completion_hours: mean(items.iter().map(|o| o.completion_hours)).unwrap_or(0.0),
            mean_success: mean(items.iter().map(|o| o.success_score)).unwrap_or(0.0),
        })
        .collect();

    // ties resolve to the earliest hour
    let slowest_hour = buckets
        .iter()
        .fold(None::<&HourBucket>, |best, b| match best {
            Some(cur) if cur.mean_completion_hours >= b.mean_completion_hours => Some(cur),
            _ => Some(b),
        })
        .map(|b| b.hour);

    TemporalProfile {
        observed: outcomes.iter().map(|o| o.id.clone()).collect(),
        buckets,
        batch_mean_completion: mean(outcomes.iter().map(|o| o.completion_hours)).unwrap_or(0.0),
        slowest_hour,
    }
}
