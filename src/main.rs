//! Bee Optimizer 入口
//!
//! 初始化日志、加载并校验配置（失败即退出）、打开结果库与模型仓库，然后运行控制循环直到收到关闭信号。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bee_optimizer::config::load_config;
use bee_optimizer::core::ShutdownManager;
use bee_optimizer::core::run_with_graceful_shutdown;
use bee_optimizer::evolution::{ControlLoop, OptimizerConfig, TracingEventSink};
use bee_optimizer::observability;
use bee_optimizer::registry::FileModelRegistry;
use bee_optimizer::store::SqliteOutcomeBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选：第一个参数为额外的配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let app_config = load_config(config_path).context("Failed to load configuration")?;
    app_config.validate().context("Invalid configuration")?;

    let backend = SqliteOutcomeBackend::open(&app_config.store.database_path).with_context(|| {
        format!(
            "Failed to open outcome store at {}",
            app_config.store.database_path.display()
        )
    })?;
    let registry = FileModelRegistry::new(&app_config.registry.directory);

    let control = ControlLoop::new(
        OptimizerConfig::from(app_config.optimizer.clone()),
        Arc::new(backend),
        Arc::new(registry),
        Arc::new(TracingEventSink),
    );

    tracing::info!(
        database = %app_config.store.database_path.display(),
        models = %app_config.registry.directory.display(),
        "Bee optimizer starting"
    );

    let shutdown = Arc::new(ShutdownManager::new());
    let token = shutdown.token();
    let mut reasons = shutdown.subscribe();
    run_with_graceful_shutdown(shutdown, control.run(token)).await;

    if let Ok(reason) = reasons.try_recv() {
        tracing::info!(?reason, "Bee optimizer stopped");
    }

    Ok(())
}
