//! 优化控制器错误类型与失败分类
//!
//! 与 ControlLoop 配合：阶段内部错误在阶段边界被捕获，并按 FailureCategory 归类后写入事件流。
//! 只有启动时的配置错误会终止进程。

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// 控制循环运行过程中可能出现的错误（存储、模型仓库、超时、坏记录、应用失败、配置）
#[derive(Error, Debug, Clone)]
pub enum OptimizerError {
    #[error("Outcome store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Model registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// 外部调用超时；按所在阶段的失败处理，不视为致命错误
    #[error("{operation} timed out after {limit:?}")]
    Timeout { operation: String, limit: Duration },

    #[error("Malformed outcome record {record}: {reason}")]
    MalformedRecord { record: String, reason: String },

    #[error("Failed to apply {component}: {reason}")]
    ApplyFailed { component: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}

impl OptimizerError {
    pub fn store(msg: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(msg.to_string())
    }

    pub fn registry(msg: impl std::fmt::Display) -> Self {
        Self::RegistryUnavailable(msg.to_string())
    }

    pub fn apply(component: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ApplyFailed {
            component: component.into(),
            reason: reason.to_string(),
        }
    }

    /// 将错误映射到四类失败之一，用于结构化日志
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::StoreUnavailable(_)
            | Self::RegistryUnavailable(_)
            | Self::Timeout { .. }
            | Self::Cancelled => FailureCategory::CollaboratorUnavailable,
            Self::MalformedRecord { .. } => FailureCategory::MalformedRecord,
            Self::ApplyFailed { .. } => FailureCategory::ProposalApplication,
            Self::Config(_) => FailureCategory::Configuration,
        }
    }
}

/// 失败分类（事件流中以 snake_case 输出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// 存储或模型仓库不可达 / 超时：在循环层面恢复
    CollaboratorUnavailable,
    /// 单条结果缺少必填字段：跳过该条
    MalformedRecord,
    /// 单个提案应用失败：隔离并记录
    ProposalApplication,
    /// 配置错误：启动前致命
    Configuration,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCategory::CollaboratorUnavailable => write!(f, "collaborator_unavailable"),
            FailureCategory::MalformedRecord => write!(f, "malformed_record"),
            FailureCategory::ProposalApplication => write!(f, "proposal_application"),
            FailureCategory::Configuration => write!(f, "configuration"),
        }
    }
}

/// 为外部调用施加超时；超时转为 OptimizerError::Timeout
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T, OptimizerError>
where
    F: Future<Output = Result<T, OptimizerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(OptimizerError::Timeout {
            operation: operation.to_string(),
            limit,
        }),
    }
}
