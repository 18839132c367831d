//! Per-job working state.

use crate::error::Result;
use crate::job::StageId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};
use uuid::Uuid;

/// Subdirectory the separator writes stems into
const SEPARATION_DIR: &str = "separated";
const CONVERTED_VOCAL: &str = "converted_vocal.wav";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub stage: StageId,
    pub at: DateTime<Utc>,
    pub text: String,
}

impl std::fmt::Display for DiagnosticEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.stage, self.text.trim_end())
    }
}

/// Artifacts handed from one stage to the next
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub source_audio: Option<PathBuf>,
    pub vocal_stem: Option<PathBuf>,
    pub instrumental_stem: Option<PathBuf>,
    pub converted_vocal: Option<PathBuf>,
    pub final_mix: Option<PathBuf>,
}

/// Private working directory plus the job's diagnostic log.
///
/// The directory is removed when the context drops, whatever the outcome,
/// unless it was created with `keep` set.
pub struct JobContext {
    job_id: Uuid,
    dir: TempDir,
    pub artifacts: Artifacts,
    diagnostics: Mutex<Vec<DiagnosticEntry>>,
}

impl JobContext {
    pub fn create(job_id: Uuid, work_root: &Path, keep: bool) -> Result<Self> {
        std::fs::create_dir_all(work_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job_id))
            .disable_cleanup(keep)
            .tempdir_in(work_root)?;
        std::fs::create_dir_all(dir.path().join(SEPARATION_DIR))?;

        info!("Job {}: working directory {}", job_id, dir.path().display());
        Ok(Self {
            job_id,
            dir,
            artifacts: Artifacts::default(),
            diagnostics: Mutex::new(Vec::new()),
        })
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn separation_dir(&self) -> PathBuf {
        self.dir.path().join(SEPARATION_DIR)
    }

    pub fn converted_vocal_path(&self) -> PathBuf {
        self.dir.path().join(CONVERTED_VOCAL)
    }

    pub fn final_mix_path(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_name)
    }

    /// Append to the diagnostic log; blank text is dropped
    pub fn record(&self, stage: StageId, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        debug!("Job {}: [{}] {}", self.job_id, stage, text.trim_end());
        self.diagnostics.lock().push(DiagnosticEntry {
            stage,
            at: Utc::now(),
            text,
        });
    }

    pub fn diagnostics(&self) -> Vec<DiagnosticEntry> {
        self.diagnostics.lock().clone()
    }
}
