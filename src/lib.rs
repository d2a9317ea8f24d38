//! Bee Optimizer - 持续反馈驱动的优化控制器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与启动校验
//! - **core**: 错误分类、关闭信号、周期阶段与统计
//! - **evolution**: 模式分析、改进生成、风险门执行、模型更新与控制循环
//! - **observability**: tracing 初始化
//! - **registry**: 模型仓库接口与文件 / 内存实现
//! - **store**: 结果库接口、SQLite / 内存后端与带类型的适配器

pub mod config;
pub mod core;
pub mod evolution;
pub mod observability;
pub mod registry;
pub mod store;

pub use evolution::{ControlLoop, OptimizerConfig};
