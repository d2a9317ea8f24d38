//! 文件模型仓库：每个模型一个 `<model>.jsonl`，每次更新追加一行批次 JSON

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{ModelKind, ModelRegistry, TrainingBatch};
use crate::core::OptimizerError;

pub struct FileModelRegistry {
    directory: PathBuf,
}

impl FileModelRegistry {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, model: ModelKind) -> PathBuf {
        self.directory.join(format!("{}.jsonl", model.as_str()))
    }
}

#[async_trait]
impl ModelRegistry for FileModelRegistry {
    async fn update(&self, model: ModelKind, batch: &TrainingBatch) -> Result<(), OptimizerError> {
        let mut line = serde_json::to_string(batch).map_err(OptimizerError::registry)?;
        line.push('\n');

        fs::create_dir_all(&self.directory)
            .await
            .map_err(OptimizerError::registry)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(model))
            .await
            .map_err(OptimizerError::registry)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(OptimizerError::registry)?;
        file.flush().await.map_err(OptimizerError::registry)
    }

    async fn ping(&self) -> Result<(), OptimizerError> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(OptimizerError::registry)?;
        let meta = fs::metadata(&self.directory)
            .await
            .map_err(OptimizerError::registry)?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(OptimizerError::registry(format!(
                "{} is not a directory",
                self.directory.display()
            )))
        }
    }
}
