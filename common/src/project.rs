use std::path::{Path, PathBuf};

use crate::datasource::DatasourceId;
use crate::error::EngineError;

pub const SRC_DIR_NAME: &str = "src";
pub const OUTPUT_DIR_NAME: &str = "output";
pub const STATE_DB_NAME: &str = "state.db";

/// Resolved directory layout of a context project.
///
/// ```text
/// <project_dir>/
///   src/        datasource configs and raw files
///   output/     one folder per build run with rendered context documents
///   state.db    embedded store
/// ```
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub project_dir: PathBuf,
    pub src_dir: PathBuf,
    pub output_dir: PathBuf,
    pub state_db_path: PathBuf,
}

impl ProjectLayout {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self {
            src_dir: project_dir.join(SRC_DIR_NAME),
            output_dir: project_dir.join(OUTPUT_DIR_NAME),
            state_db_path: project_dir.join(STATE_DB_NAME),
            project_dir,
        }
    }

    /// Create the project skeleton on disk, idempotently.
    pub fn ensure_created(&self) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.src_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }

    /// Validate that `project_dir` holds an initialized project.
    pub fn ensure_project_dir(project_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let layout = Self::new(project_dir);
        if !layout.src_dir.is_dir() {
            return Err(EngineError::Validation(format!(
                "Not a context project (missing src directory): {}",
                layout.project_dir.display()
            )));
        }
        Ok(layout)
    }

    /// The store address for the embedded engine, file backed.
    pub fn state_db_address(&self) -> String {
        format!("surrealkv://{}", self.state_db_path.display())
    }

    pub fn run_output_dir(&self, run_id: i64) -> PathBuf {
        self.output_dir.join(format!("run-{run_id}"))
    }

    pub fn config_file_path(&self, id: &DatasourceId) -> PathBuf {
        self.src_dir.join(id.relative_path_to_config_file())
    }

    pub fn context_file_path(&self, run_dir: &Path, id: &DatasourceId) -> PathBuf {
        run_dir.join(id.relative_path_to_context_file())
    }

    /// The output directory of the most recent run, by run id.
    pub fn latest_run_dir(&self) -> Result<Option<PathBuf>, EngineError> {
        if !self.output_dir.is_dir() {
            return Ok(None);
        }

        let mut best: Option<(i64, PathBuf)> = None;
        for entry in std::fs::read_dir(&self.output_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(run_id) = name.strip_prefix("run-").and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };
            if best.as_ref().is_none_or(|(id, _)| run_id > *id) {
                best = Some((run_id, entry.path()));
            }
        }

        Ok(best.map(|(_, path)| path))
    }
}
