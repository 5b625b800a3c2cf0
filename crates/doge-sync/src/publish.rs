//! Writes updated snapshots and uploads them to the project store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use doge_core::{snapshot_filename, Category, RecordTable};
use doge_storage::{write_snapshot_csv, ProjectStorage};
use serde::Serialize;
use tracing::{error, info};

/// Which attempted files uploaded and which did not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub success: Vec<String>,
    pub failure: Vec<String>,
}

impl UploadOutcome {
    pub fn attempted(&self) -> usize {
        self.success.len() + self.failure.len()
    }
}

/// New rows found per category this run.
pub type NewRowCounts = BTreeMap<Category, usize>;

#[derive(Debug, Clone, Default)]
pub struct PublishResult {
    pub outcome: UploadOutcome,
    /// Local files written this run; the caller removes them.
    pub written: Vec<PathBuf>,
}

pub struct SnapshotPublisher {
    storage: Arc<dyn ProjectStorage>,
    project_id: String,
    work_dir: PathBuf,
    delay: Duration,
}

impl SnapshotPublisher {
    pub fn new(
        storage: Arc<dyn ProjectStorage>,
        project_id: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        delay: Duration,
    ) -> Self {
        Self {
            storage,
            project_id: project_id.into(),
            work_dir: work_dir.into(),
            delay,
        }
    }

    /// Writes each table whose category gained rows, then uploads each
    /// written file independently. Categories with no new rows are skipped.
    ///
    /// A local write failure is an error; a failed upload only lands in
    /// `outcome.failure`.
    pub async fn persist_and_upload(
        &self,
        tables: &[(Category, RecordTable)],
        new_rows: &NewRowCounts,
        stamp: &str,
    ) -> Result<PublishResult> {
        let mut result = PublishResult::default();

        for (category, table) in tables {
            if new_rows.get(category).copied().unwrap_or(0) == 0 {
                info!(%category, "no new rows; snapshot not written");
                continue;
            }
            let path = self.work_dir.join(snapshot_filename(*category, stamp));
            write_snapshot_csv(&path, table)
                .await
                .with_context(|| format!("writing {} snapshot", category))?;
            info!(%category, path = %path.display(), rows = table.len(), "wrote snapshot");
            result.written.push(path);
        }

        for (idx, path) in result.written.iter().enumerate() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            match self.storage.upload_file(&self.project_id, path).await {
                Ok(()) => {
                    info!(file = %name, "uploaded snapshot");
                    result.outcome.success.push(name);
                }
                Err(err) => {
                    error!(file = %name, error = %err, "snapshot upload failed");
                    result.outcome.failure.push(name);
                }
            }
            if !self.delay.is_zero() && idx + 1 < result.written.len() {
                tokio::time::sleep(self.delay).await;
            }
        }

        Ok(result)
    }
}
