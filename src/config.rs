//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE_OPTIMIZER__*` 覆盖
//! （双下划线表示嵌套，如 `BEE_OPTIMIZER__OPTIMIZER__LEARNING_INTERVAL=60`）。
//! 加载后必须调用 [`AppConfig::validate`]；校验失败应在循环启动前终止进程。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::OptimizerError;
use crate::evolution::types::OptimizationCategory;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub optimizer: OptimizerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub registry: RegistrySection,
}

/// 学习模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    Supervised,
    Unsupervised,
    Reinforcement,
    Transfer,
    Federated,
}

/// [optimizer] 段：控制循环节奏、置信度门限与安全策略
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerSection {
    /// 正常周期间隔（秒）
    #[serde(default = "default_learning_interval")]
    pub learning_interval: u64,
    /// 失败后的恢复间隔（秒），应短于 learning_interval
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval: u64,
    /// 首个周期回看的时间窗口（秒）；之后按水位线增量拉取
    #[serde(default = "default_outcome_window")]
    pub outcome_window: u64,
    /// 单次外部调用（存储 / 模型仓库）超时（秒）
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_high_success_threshold")]
    pub high_success_threshold: f64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    #[serde(default = "default_true")]
    pub auto_improvement_enabled: bool,
    /// 每个周期最多自动应用的提案数
    #[serde(default = "default_max_concurrent_experiments")]
    pub max_concurrent_experiments: usize,
    #[serde(default = "default_true")]
    pub safety_checks_enabled: bool,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    #[serde(default = "default_learning_modes")]
    pub learning_modes: Vec<LearningMode>,
    #[serde(default = "default_optimization_targets")]
    pub optimization_targets: Vec<OptimizationCategory>,
}

fn default_learning_interval() -> u64 {
    300
}

fn default_recovery_interval() -> u64 {
    60
}

fn default_outcome_window() -> u64 {
    3600
}

fn default_stage_timeout() -> u64 {
    30
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_high_success_threshold() -> f64 {
    0.8
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_experiments() -> usize {
    5
}

fn default_learning_modes() -> Vec<LearningMode> {
    vec![
        LearningMode::Supervised,
        LearningMode::Unsupervised,
        LearningMode::Reinforcement,
    ]
}

fn default_optimization_targets() -> Vec<OptimizationCategory> {
    OptimizationCategory::ALL.to_vec()
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            learning_interval: default_learning_interval(),
            recovery_interval: default_recovery_interval(),
            outcome_window: default_outcome_window(),
            stage_timeout: default_stage_timeout(),
            confidence_threshold: default_confidence_threshold(),
            high_success_threshold: default_high_success_threshold(),
            failure_threshold: default_failure_threshold(),
            auto_improvement_enabled: true,
            max_concurrent_experiments: default_max_concurrent_experiments(),
            safety_checks_enabled: true,
            rollback_on_failure: true,
            learning_modes: default_learning_modes(),
            optimization_targets: default_optimization_targets(),
        }
    }
}

/// [store] 段：结果库位置
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("workspace/outcomes.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// [registry] 段：模型训练批次落盘目录
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_registry_dir")]
    pub directory: PathBuf,
}

fn default_registry_dir() -> PathBuf {
    PathBuf::from("workspace/models")
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            directory: default_registry_dir(),
        }
    }
}

impl AppConfig {
    /// 启动前校验；任何错误都是致命的
    pub fn validate(&self) -> Result<(), OptimizerError> {
        let o = &self.optimizer;
        for (name, value) in [
            ("confidence_threshold", o.confidence_threshold),
            ("high_success_threshold", o.high_success_threshold),
            ("failure_threshold", o.failure_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(OptimizerError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if o.failure_threshold > o.high_success_threshold {
            return Err(OptimizerError::Config(
                "failure_threshold must not exceed high_success_threshold".into(),
            ));
        }
        for (name, value) in [
            ("learning_interval", o.learning_interval),
            ("recovery_interval", o.recovery_interval),
            ("outcome_window", o.outcome_window),
            ("stage_timeout", o.stage_timeout),
        ] {
            if value == 0 {
                return Err(OptimizerError::Config(format!("{name} must be positive")));
            }
        }
        if o.recovery_interval > o.learning_interval {
            return Err(OptimizerError::Config(format!(
                "recovery_interval ({}s) must not exceed learning_interval ({}s)",
                o.recovery_interval, o.learning_interval
            )));
        }
        if o.max_concurrent_experiments == 0 {
            return Err(OptimizerError::Config(
                "max_concurrent_experiments must be at least 1".into(),
            ));
        }
        if o.learning_modes.is_empty() {
            return Err(OptimizerError::Config("learning_modes must not be empty".into()));
        }
        if o.optimization_targets.is_empty() {
            return Err(OptimizerError::Config(
                "optimization_targets must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 BEE_OPTIMIZER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE_OPTIMIZER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(environment());

    let c = builder.build()?;
    c.try_deserialize()
}

/// 环境变量覆盖源；列表键以逗号分隔
/// （如 `BEE_OPTIMIZER__OPTIMIZER__LEARNING_MODES=supervised,reinforcement`）
fn environment() -> config::Environment {
    config::Environment::with_prefix("BEE_OPTIMIZER")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("optimizer.learning_modes")
        .with_list_parse_key("optimizer.optimization_targets")
}
