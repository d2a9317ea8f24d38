//! 结果库：后端接口（SQLite / 内存）与带类型的适配器

pub mod adapter;
pub mod backend;
pub mod memory;
pub mod sqlite;

pub use adapter::{OutcomeStoreAdapter, TimeWindow, DEFAULT_QUALITY_SCORE};
pub use backend::{MetricSample, OutcomeBackend, RawOutcome, RawQuality};
pub use memory::InMemoryOutcomeBackend;
pub use sqlite::SqliteOutcomeBackend;
