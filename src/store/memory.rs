//! 内存结果库：与 SQLite 后端相同的契约，支持故障注入（失败 / 延迟），用于演示与测试

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::OptimizerError;
use crate::evolution::types::ApplicationRecord;
use crate::store::backend::{MetricSample, OutcomeBackend, RawOutcome, RawQuality};

#[derive(Default)]
struct State {
    outcomes: Vec<RawOutcome>,
    resources: HashMap<String, BTreeMap<String, Option<f64>>>,
    artifacts: HashMap<String, Vec<Option<f64>>>,
    applications: Vec<ApplicationRecord>,
    failing_queries: usize,
    query_delay: Option<Duration>,
    fail_appends: bool,
    unreachable: bool,
    outcome_queries: usize,
}

#[derive(Default)]
pub struct InMemoryOutcomeBackend {
    state: Mutex<State>,
}

impl InMemoryOutcomeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T, OptimizerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| OptimizerError::store("in-memory store poisoned"))?;
        Ok(f(&mut state))
    }

    pub fn push_outcome(&self, outcome: RawOutcome) {
        let _ = self.with_state(|s| s.outcomes.push(outcome));
    }

    pub fn set_resource(&self, project_id: &str, metric: &str, value: Option<f64>) {
        let _ = self.with_state(|s| {
            s.resources
                .entry(project_id.to_string())
                .or_default()
                .insert(metric.to_string(), value);
        });
    }

    /// 追加一个产物；quality 为 None 表示该产物没有质量分
    pub fn add_artifact(&self, project_id: &str, quality: Option<f64>) {
        let _ = self.with_state(|s| {
            s.artifacts.entry(project_id.to_string()).or_default().push(quality);
        });
    }

    /// 接下来 n 次结果查询返回 StoreUnavailable
    pub fn fail_next_queries(&self, n: usize) {
        let _ = self.with_state(|s| s.failing_queries = n);
    }

    /// 每次结果查询前先等待（用于模拟超时）
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        let _ = self.with_state(|s| s.query_delay = delay);
    }

    pub fn set_fail_appends(&self, fail: bool) {
        let _ = self.with_state(|s| s.fail_appends = fail);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        let _ = self.with_state(|s| s.unreachable = unreachable);
    }

    pub fn applications(&self) -> Vec<ApplicationRecord> {
        self.with_state(|s| s.applications.clone()).unwrap_or_default()
    }

    pub fn outcome_queries(&self) -> usize {
        self.with_state(|s| s.outcome_queries).unwrap_or_default()
    }
}

#[async_trait]
impl OutcomeBackend for InMemoryOutcomeBackend {
    async fn query_outcomes(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawOutcome>, OptimizerError> {
        let delay = self.with_state(|s| {
            s.outcome_queries += 1;
            s.query_delay
        })?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with_state(|s| {
            if s.unreachable {
                return Err(OptimizerError::store("connection refused"));
            }
            if s.failing_queries > 0 {
                s.failing_queries -= 1;
                return Err(OptimizerError::store("injected query failure"));
            }
            Ok(s.outcomes
                .iter()
                .filter(|o| match o.created_at {
                    Some(at) => at > since && at <= until,
                    // 缺少时间戳的行总是返回，由适配器判定为坏记录
                    None => true,
                })
                .cloned()
                .collect())
        })?
    }

    async fn query_resource_metrics(
        &self,
        project_id: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, OptimizerError> {
        self.with_state(|s| {
            s.resources
                .get(project_id)
                .map(|m| {
                    m.iter()
                        .map(|(name, average)| MetricSample {
                            name: name.clone(),
                            average: *average,
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    async fn query_quality(&self, project_id: &str) -> Result<RawQuality, OptimizerError> {
        self.with_state(|s| match s.artifacts.get(project_id) {
            Some(items) if !items.is_empty() => {
                let sum: f64 = items.iter().map(|q| q.unwrap_or(0.8)).sum();
                RawQuality {
                    total_artifacts: items.len() as u64,
                    average_quality: Some(sum / items.len() as f64),
                }
            }
            _ => RawQuality::default(),
        })
    }

    async fn append_application(&self, record: &ApplicationRecord) -> Result<(), OptimizerError> {
        self.with_state(|s| {
            if s.fail_appends {
                return Err(OptimizerError::store("injected append failure"));
            }
            s.applications.push(record.clone());
            Ok(())
        })?
    }

    async fn ping(&self) -> Result<(), OptimizerError> {
        self.with_state(|s| {
            if s.unreachable {
                Err(OptimizerError::store("connection refused"))
            } else {
                Ok(())
            }
        })?
    }
}
