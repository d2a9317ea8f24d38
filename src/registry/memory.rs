//! 内存模型仓库：记录每次调用，可按模型注入失败或延迟

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ModelKind, ModelRegistry, TrainingBatch};
use crate::core::OptimizerError;

#[derive(Default)]
struct State {
    calls: Vec<(ModelKind, TrainingBatch)>,
    failing: HashSet<ModelKind>,
    delay: Option<Duration>,
    unreachable: bool,
}

#[derive(Default)]
pub struct InMemoryModelRegistry {
    state: Mutex<State>,
}

impl InMemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T, OptimizerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| OptimizerError::registry("in-memory registry poisoned"))?;
        Ok(f(&mut state))
    }

    /// 该模型的所有更新都返回 RegistryUnavailable
    pub fn fail_model(&self, model: ModelKind) {
        let _ = self.with_state(|s| s.failing.insert(model));
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        let _ = self.with_state(|s| s.delay = delay);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        let _ = self.with_state(|s| s.unreachable = unreachable);
    }

    /// 成功的更新调用（模型, 批次）
    pub fn calls(&self) -> Vec<(ModelKind, TrainingBatch)> {
        self.with_state(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.with_state(|s| s.calls.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelRegistry for InMemoryModelRegistry {
    async fn update(&self, model: ModelKind, batch: &TrainingBatch) -> Result<(), OptimizerError> {
        let delay = self.with_state(|s| s.delay)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_state(|s| {
            if s.unreachable || s.failing.contains(&model) {
                return Err(OptimizerError::registry(format!("{model} update rejected")));
            }
            s.calls.push((model, batch.clone()));
            Ok(())
        })?
    }

    async fn ping(&self) -> Result<(), OptimizerError> {
        self.with_state(|s| {
            if s.unreachable {
                Err(OptimizerError::registry("registry unreachable"))
            } else {
                Ok(())
            }
        })?
    }
}
