//! SQLite 结果库
//!
//! rusqlite 是同步库：所有查询都在 spawn_blocking 中执行，连接由 Arc<Mutex<Connection>> 共享。
//! 时间戳统一存为 RFC3339（UTC、微秒、`Z` 结尾），因此字符串比较即时间比较。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::OptimizerError;
use crate::evolution::types::{ApplicationRecord, DetectedPattern};
use crate::store::backend::{MetricSample, OutcomeBackend, RawOutcome, RawQuality};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);
CREATE TABLE IF NOT EXISTS learning_outcomes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    outcome_type TEXT,
    impact_score REAL,
    lessons_learned TEXT,
    patterns_identified TEXT,
    recommendations TEXT,
    created_at TEXT
);
CREATE TABLE IF NOT EXISTS system_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    value REAL,
    timestamp TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS project_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    quality_score REAL
);
CREATE TABLE IF NOT EXISTS applied_improvements (
    id TEXT PRIMARY KEY,
    cycle INTEGER NOT NULL,
    category TEXT NOT NULL,
    component TEXT NOT NULL,
    status TEXT NOT NULL,
    previous_value REAL,
    applied_value REAL,
    improvement_percentage REAL NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outcomes_created ON learning_outcomes(created_at);
CREATE INDEX IF NOT EXISTS idx_metrics_project ON system_metrics(project_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_artifacts_project ON project_artifacts(project_id);
";

pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// 解析 JSON 列；列为空时返回 Ok(None)
fn parse_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: Option<String>,
) -> Result<Option<T>, String> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| format!("{column} is not valid JSON: {e}")),
    }
}

/// 宽松读取文本列：SQLite 列类型是动态的，类型不符记为该行缺陷而不是让整批查询失败
fn text_column(row: &Row<'_>, idx: usize, column: &str, defects: &mut Vec<String>) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Some(text.to_string()),
            Err(_) => {
                defects.push(format!("{column} is not valid UTF-8"));
                None
            }
        },
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Blob(_) => {
            defects.push(format!("{column} holds a blob"));
            None
        }
    })
}

/// 宽松读取数值列
fn real_column(row: &Row<'_>, idx: usize, column: &str, defects: &mut Vec<String>) -> rusqlite::Result<Option<f64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f),
        other => {
            defects.push(format!("{column} has non-numeric type {}", other.data_type()));
            None
        }
    })
}

#[derive(Clone)]
pub struct SqliteOutcomeBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteOutcomeBackend {
    /// 打开（或创建）数据库文件并建表；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OptimizerError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(OptimizerError::store)?;
            }
        }
        let conn = Connection::open(path.as_ref()).map_err(OptimizerError::store)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, OptimizerError> {
        let conn = Connection::open_in_memory().map_err(OptimizerError::store)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, OptimizerError> {
        conn.execute_batch(SCHEMA).map_err(OptimizerError::store)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, OptimizerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| OptimizerError::store("sqlite connection poisoned"))?;
            f(&guard).map_err(OptimizerError::store)
        })
        .await
        .map_err(OptimizerError::store)?
    }

    pub async fn insert_project(
        &self,
        id: &str,
        status: &str,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), OptimizerError> {
        let id = id.to_string();
        let status = status.to_string();
        self.blocking(move |c| {
            c.execute(
                "INSERT OR REPLACE INTO projects (id, status, started_at, completed_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, status, started_at.map(format_ts), completed_at.map(format_ts)],
            )
            .map(|_| ())
        })
        .await
    }

    /// 写入一条学习结果；列表字段以 JSON 存储
    pub async fn insert_outcome(
        &self,
        project_id: &str,
        outcome_type: &str,
        impact_score: f64,
        lessons: &[String],
        patterns: &[DetectedPattern],
        recommendations: &[String],
        created_at: DateTime<Utc>,
    ) -> Result<(), OptimizerError> {
        let project_id = project_id.to_string();
        let outcome_type = outcome_type.to_string();
        let lessons = serde_json::to_string(lessons).map_err(OptimizerError::store)?;
        let patterns = serde_json::to_string(patterns).map_err(OptimizerError::store)?;
        let recommendations = serde_json::to_string(recommendations).map_err(OptimizerError::store)?;
        self.blocking(move |c| {
            c.execute(
                "INSERT INTO learning_outcomes
                    (project_id, outcome_type, impact_score, lessons_learned, patterns_identified, recommendations, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project_id,
                    outcome_type,
                    impact_score,
                    lessons,
                    patterns,
                    recommendations,
                    format_ts(created_at)
                ],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn insert_metric(
        &self,
        project_id: &str,
        metric_name: &str,
        value: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<(), OptimizerError> {
        let project_id = project_id.to_string();
        let metric_name = metric_name.to_string();
        self.blocking(move |c| {
            c.execute(
                "INSERT INTO system_metrics (project_id, metric_name, value, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![project_id, metric_name, value, format_ts(at)],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn insert_artifact(&self, project_id: &str, quality_score: Option<f64>) -> Result<(), OptimizerError> {
        let project_id = project_id.to_string();
        self.blocking(move |c| {
            c.execute(
                "INSERT INTO project_artifacts (project_id, quality_score) VALUES (?1, ?2)",
                params![project_id, quality_score],
            )
            .map(|_| ())
        })
        .await
    }

    /// 读取已记录的改进审计（按写入顺序）
    pub async fn list_applications(&self) -> Result<Vec<(String, String, String)>, OptimizerError> {
        self.blocking(|c| {
            let mut stmt = c.prepare(
                "SELECT component, category, status FROM applied_improvements ORDER BY created_at, rowid",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect()
        })
        .await
    }
}

#[async_trait]
impl OutcomeBackend for SqliteOutcomeBackend {
    async fn query_outcomes(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawOutcome>, OptimizerError> {
        self.blocking(move |c| {
            let mut stmt = c.prepare(
                "SELECT p.id, lo.outcome_type, lo.impact_score, p.started_at, p.completed_at,
                        lo.lessons_learned, lo.patterns_identified, lo.recommendations, lo.created_at
                 FROM projects p
                 JOIN learning_outcomes lo ON p.id = lo.project_id
                 WHERE lo.created_at > ?1 AND lo.created_at <= ?2
                   AND p.status = 'completed'
                 ORDER BY lo.created_at, lo.id",
            )?;
            let rows = stmt.query_map(params![format_ts(since), format_ts(until)], |row| {
                let mut defects = Vec::new();
                let project_id = text_column(row, 0, "project_id", &mut defects)?;
                let outcome_type = text_column(row, 1, "outcome_type", &mut defects)?;
                let impact_score = real_column(row, 2, "impact_score", &mut defects)?;
                let started = parse_ts(text_column(row, 3, "started_at", &mut defects)?);
                let completed = parse_ts(text_column(row, 4, "completed_at", &mut defects)?);
                let completion_hours = match (started, completed) {
                    (Some(s), Some(e)) => Some((e - s).num_seconds() as f64 / 3600.0),
                    _ => None,
                };

                let lessons_raw = text_column(row, 5, "lessons_learned", &mut defects)?;
                let patterns_raw = text_column(row, 6, "patterns_identified", &mut defects)?;
                let recommendations_raw = text_column(row, 7, "recommendations", &mut defects)?;
                let created_at = parse_ts(text_column(row, 8, "created_at", &mut defects)?);

                let lessons = parse_json::<Vec<String>>("lessons_learned", lessons_raw)
                    .unwrap_or_else(|e| {
                        defects.push(e);
                        None
                    });
                let patterns = parse_json::<Vec<DetectedPattern>>("patterns_identified", patterns_raw)
                    .unwrap_or_else(|e| {
                        defects.push(e);
                        None
                    });
                let recommendations = parse_json::<Vec<String>>("recommendations", recommendations_raw)
                    .unwrap_or_else(|e| {
                        defects.push(e);
                        None
                    });

                Ok(RawOutcome {
                    project_id,
                    outcome_type,
                    impact_score,
                    completion_hours,
                    lessons_learned: lessons,
                    patterns_identified: patterns,
                    recommendations,
                    created_at,
                    defect: if defects.is_empty() { None } else { Some(defects.join("; ")) },
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn query_resource_metrics(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, OptimizerError> {
        let project_id = project_id.to_string();
        self.blocking(move |c| {
            let mut stmt = c.prepare(
                "SELECT metric_name, AVG(value)
                 FROM system_metrics
                 WHERE project_id = ?1 AND timestamp > ?2
                 GROUP BY metric_name
                 ORDER BY metric_name",
            )?;
            let rows = stmt.query_map(params![project_id, format_ts(since)], |row| {
                Ok(MetricSample {
                    name: row.get(0)?,
                    average: row.get(1)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn query_quality(&self, project_id: &str) -> Result<RawQuality, OptimizerError> {
        let project_id = project_id.to_string();
        self.blocking(move |c| {
            c.query_row(
                "SELECT COUNT(*), AVG(COALESCE(quality_score, 0.8))
                 FROM project_artifacts WHERE project_id = ?1",
                params![project_id],
                |row| {
                    let total: i64 = row.get(0)?;
                    Ok(RawQuality {
                        total_artifacts: total.max(0) as u64,
                        average_quality: row.get(1)?,
                    })
                },
            )
        })
        .await
    }

    async fn append_application(&self, record: &ApplicationRecord) -> Result<(), OptimizerError> {
        let record = record.clone();
        let status = serde_json::to_value(record.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.blocking(move |c| {
            c.execute(
                "INSERT INTO applied_improvements
                    (id, cycle, category, component, status, previous_value, applied_value,
                     improvement_percentage, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.cycle as i64,
                    record.category.as_str(),
                    record.component,
                    status,
                    record.previous_value,
                    record.applied_value,
                    record.improvement_percentage,
                    record.error,
                    format_ts(record.timestamp)
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn ping(&self) -> Result<(), OptimizerError> {
        self.blocking(|c| c.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).optional())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::events::MemoryEventSink;
    use crate::evolution::types::{ApplicationStatus, OptimizationCategory, SystemOptimization};
    use crate::store::{OutcomeStoreAdapter, TimeWindow};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn seeded(dir: &TempDir) -> SqliteOutcomeBackend {
        let backend = SqliteOutcomeBackend::open(dir.path().join("outcomes.db")).unwrap();
        let now = Utc::now();
        backend
            .insert_project("p1", "completed", Some(now - chrono::Duration::hours(3)), Some(now))
            .await
            .unwrap();
        backend.insert_project("p2", "running", Some(now), None).await.unwrap();
        backend
            .insert_outcome(
                "p1",
                "build",
                1.4,
                &["cache deps".to_string()],
                &[DetectedPattern { kind: "error".into(), payload: serde_json::json!("timeout") }],
                &[],
                now - chrono::Duration::minutes(1),
            )
            .await
            .unwrap();
        backend
            .insert_outcome("p2", "build", 0.5, &[], &[], &[], now - chrono::Duration::minutes(1))
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_query_only_completed_projects() {
        let dir = TempDir::new().unwrap();
        let backend = seeded(&dir).await;
        let now = Utc::now();
        let rows = backend
            .query_outcomes(now - chrono::Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.project_id.as_deref(), Some("p1"));
        assert_eq!(row.impact_score, Some(1.4));
        assert!((row.completion_hours.unwrap() - 3.0).abs() < 0.01);
        assert_eq!(row.lessons_learned.as_ref().unwrap(), &vec!["cache deps".to_string()]);
        assert_eq!(row.patterns_identified.as_ref().unwrap().len(), 1);
        assert!(row.defect.is_none());
    }

    #[tokio::test]
    async fn test_resource_metrics_averaged() {
        let dir = TempDir::new().unwrap();
        let backend = seeded(&dir).await;
        let now = Utc::now();
        backend.insert_metric("p1", "cpu", Some(0.5), now).await.unwrap();
        backend.insert_metric("p1", "cpu", Some(0.7), now).await.unwrap();
        backend.insert_metric("p1", "memory", None, now).await.unwrap();
        backend
            .insert_metric("p1", "gpu", Some(0.9), now - chrono::Duration::hours(48))
            .await
            .unwrap();

        let samples = backend
            .query_resource_metrics("p1", now - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "cpu");
        assert!((samples[0].average.unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(samples[1], MetricSample { name: "memory".into(), average: None });
    }

    #[tokio::test]
    async fn test_quality_defaults_to_prior() {
        let dir = TempDir::new().unwrap();
        let backend = seeded(&dir).await;
        backend.insert_artifact("p1", Some(0.6)).await.unwrap();
        backend.insert_artifact("p1", None).await.unwrap();
        let q = backend.query_quality("p1").await.unwrap();
        assert_eq!(q.total_artifacts, 2);
        assert!((q.average_quality.unwrap() - 0.7).abs() < 1e-9);

        let empty = backend.query_quality("p2").await.unwrap();
        assert_eq!(empty.total_artifacts, 0);
        assert_eq!(empty.average_quality, None);
    }

    #[tokio::test]
    async fn test_bad_json_column_marked_defective() {
        let backend = SqliteOutcomeBackend::open_in_memory().unwrap();
        let now = Utc::now();
        backend.insert_project("p1", "completed", None, None).await.unwrap();
        let created = format_ts(now);
        backend
            .blocking(move |c| {
                c.execute(
                    "INSERT INTO learning_outcomes (project_id, outcome_type, impact_score, lessons_learned, created_at)
                     VALUES ('p1', 'build', 0.5, 'not json', ?1)",
                    params![created],
                )
                .map(|_| ())
            })
            .await
            .unwrap();
        let rows = backend
            .query_outcomes(now - chrono::Duration::hours(1), now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].defect.as_ref().unwrap().contains("lessons_learned"));
        assert_eq!(rows[0].completion_hours, None);
    }

    #[tokio::test]
    async fn test_mistyped_score_marks_only_that_row() {
        let backend = SqliteOutcomeBackend::open_in_memory().unwrap();
        let now = Utc::now();
        backend.insert_project("p1", "completed", None, None).await.unwrap();
        backend.insert_project("p2", "completed", None, None).await.unwrap();
        backend
            .insert_outcome("p1", "build", 0.9, &[], &[], &[], now - chrono::Duration::minutes(2))
            .await
            .unwrap();
        let created = format_ts(now - chrono::Duration::minutes(1));
        backend
            .blocking(move |c| {
                c.execute(
                    "INSERT INTO learning_outcomes (project_id, outcome_type, impact_score, created_at)
                     VALUES ('p2', 'build', 'n/a', ?1)",
                    params![created],
                )
                .map(|_| ())
            })
            .await
            .unwrap();

        let rows = backend
            .query_outcomes(now - chrono::Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].defect.is_none());
        assert_eq!(rows[0].impact_score, Some(0.9));
        assert_eq!(rows[1].impact_score, None);
        assert!(rows[1].defect.as_ref().unwrap().contains("impact_score"));

        let events = Arc::new(MemoryEventSink::new());
        let adapter = OutcomeStoreAdapter::new(Arc::new(backend), Duration::from_secs(5), events.clone());
        let outcomes = adapter
            .fetch_recent_outcomes(TimeWindow::between(now - chrono::Duration::hours(1), now))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].id, "p1");
        assert_eq!(events.count("outcome_skipped"), 1);
    }

    #[tokio::test]
    async fn test_append_application_roundtrip() {
        let backend = SqliteOutcomeBackend::open_in_memory().unwrap();
        let proposal = SystemOptimization::new(OptimizationCategory::Scalability, "capacity:cpu", 0.9, 0.7);
        let record = ApplicationRecord::new(3, &proposal, ApplicationStatus::Applied);
        backend.append_application(&record).await.unwrap();
        backend.ping().await.unwrap();

        let rows = backend.list_applications().await.unwrap();
        assert_eq!(
            rows,
            vec![("capacity:cpu".to_string(), "scalability".to_string(), "applied".to_string())]
        );
    }
}
