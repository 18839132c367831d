use crate::error::{ErrorKind, PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline stage identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Request,
    Assets,
    Download,
    Separation,
    Conversion,
    Mixing,
    Publish,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Request => "request",
            StageId::Assets => "assets",
            StageId::Download => "download",
            StageId::Separation => "separation",
            StageId::Conversion => "conversion",
            StageId::Mixing => "mixing",
            StageId::Publish => "publish",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "request" => Ok(StageId::Request),
            "assets" => Ok(StageId::Assets),
            "download" => Ok(StageId::Download),
            "separation" => Ok(StageId::Separation),
            "conversion" => Ok(StageId::Conversion),
            "mixing" => Ok(StageId::Mixing),
            "publish" => Ok(StageId::Publish),
            _ => Err(PipelineError::parse(format!("Invalid stage ID: {}", s))),
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Incoming job request. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// URI of the song to cover
    #[serde(default, alias = "song_url")]
    pub source_audio_reference: String,

    /// Semitone offset applied by the voice-conversion tool
    #[serde(default, alias = "pitch")]
    pub pitch_shift: i32,
}

impl JobRequest {
    pub fn new(source_audio_reference: impl Into<String>, pitch_shift: i32) -> Self {
        Self {
            source_audio_reference: source_audio_reference.into(),
            pitch_shift,
        }
    }

    /// Reject requests that must not reach any stage. `file://` references
    /// are only accepted when `allow_local_sources` is set.
    pub fn validate(&self, allow_local_sources: bool) -> Result<()> {
        let reference = self.source_audio_reference.trim();
        if reference.is_empty() {
            return Err(PipelineError::RequestValidation(
                "source_audio_reference is required".to_string(),
            ));
        }

        let url = reqwest::Url::parse(reference).map_err(|e| {
            PipelineError::RequestValidation(format!(
                "source_audio_reference is not a valid URI ({}): {}",
                e, reference
            ))
        })?;

        match url.scheme() {
            "http" | "https" => Ok(()),
            "file" if allow_local_sources => Ok(()),
            "file" => Err(PipelineError::RequestValidation(
                "local file sources are disabled on this worker".to_string(),
            )),
            other => Err(PipelineError::RequestValidation(format!(
                "unsupported source_audio_reference scheme: {}",
                other
            ))),
        }
    }
}

/// Job state (one variant per pipeline checkpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobState {
    Received {
        received_at: DateTime<Utc>,
    },
    AssetsReady,
    Downloaded,
    Separated,
    Converted,
    Mixed,
    Published {
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        download_url: String,
    },
    Failed {
        failed_at: DateTime<Utc>,
        failed_stage: StageId,
        error_kind: ErrorKind,
        error: String,
    },
}

impl JobState {
    pub fn state_name(&self) -> &'static str {
        match self {
            JobState::Received { .. } => "received",
            JobState::AssetsReady => "assets_ready",
            JobState::Downloaded => "downloaded",
            JobState::Separated => "separated",
            JobState::Converted => "converted",
            JobState::Mixed => "mixed",
            JobState::Published { .. } => "published",
            JobState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Published { .. } | JobState::Failed { .. })
    }

    /// Stage whose success moves the job out of this state
    pub fn next_stage(&self) -> Option<StageId> {
        match self {
            JobState::Received { .. } => Some(StageId::Assets),
            JobState::AssetsReady => Some(StageId::Download),
            JobState::Downloaded => Some(StageId::Separation),
            JobState::Separated => Some(StageId::Conversion),
            JobState::Converted => Some(StageId::Mixing),
            JobState::Mixed => Some(StageId::Publish),
            JobState::Published { .. } | JobState::Failed { .. } => None,
        }
    }
}

/// Job model
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub request: JobRequest,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request,
            state: JobState::Received { received_at: now },
            created_at: now,
            updated_at: now,
        }
    }
}

/// Forward-only state machine over [`JobState`]
pub struct JobStateMachine {
    job: Job,
}

impl JobStateMachine {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Record success of `stage` and move to the following state.
    /// Publish success goes through [`JobStateMachine::publish`] instead.
    pub fn advance(&mut self, stage: StageId) -> Result<()> {
        let next = match (&self.job.state, stage) {
            (JobState::Received { .. }, StageId::Assets) => JobState::AssetsReady,
            (JobState::AssetsReady, StageId::Download) => JobState::Downloaded,
            (JobState::Downloaded, StageId::Separation) => JobState::Separated,
            (JobState::Separated, StageId::Conversion) => JobState::Converted,
            (JobState::Converted, StageId::Mixing) => JobState::Mixed,
            _ => {
                return Err(PipelineError::InvalidStateTransition {
                    from: self.job.state.state_name().to_string(),
                    to: format!("after {}", stage),
                })
            }
        };

        self.job.state = next;
        self.job.updated_at = Utc::now();
        Ok(())
    }

    /// Transition: MIXED → PUBLISHED
    pub fn publish(&mut self, download_url: String) -> Result<()> {
        match &self.job.state {
            JobState::Mixed => {
                let now = Utc::now();
                let duration_ms = (now - self.job.created_at).num_milliseconds().max(0) as u64;
                self.job.state = JobState::Published {
                    completed_at: now,
                    duration_ms,
                    download_url,
                };
                self.job.updated_at = now;
                Ok(())
            }
            _ => Err(PipelineError::InvalidStateTransition {
                from: self.job.state.state_name().to_string(),
                to: "published".to_string(),
            }),
        }
    }

    /// Transition: any non-terminal state → FAILED(stage)
    pub fn fail(&mut self, failed_stage: StageId, error_kind: ErrorKind, error: String) -> Result<()> {
        if self.job.state.is_terminal() {
            return Err(PipelineError::InvalidStateTransition {
                from: self.job.state.state_name().to_string(),
                to: "failed".to_string(),
            });
        }

        let now = Utc::now();
        self.job.state = JobState::Failed {
            failed_at: now,
            failed_stage,
            error_kind,
            error,
        };
        self.job.updated_at = now;
        Ok(())
    }
}

/// Result status on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Error,
}

/// Boundary-facing job result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Retention caveat of the hosting backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Human-readable error; present iff status is error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Verbatim tool stderr / backend bodies collected during the job
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    pub duration_ms: u64,
}

impl JobResult {
    pub fn success(
        job_id: Uuid,
        download_url: String,
        note: Option<String>,
        model_used: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::Success,
            download_url: Some(download_url),
            note,
            message: None,
            failed_stage: None,
            error_kind: None,
            diagnostics: Vec::new(),
            model_used,
            duration_ms,
        }
    }

    pub fn error(
        job_id: Uuid,
        failed_stage: StageId,
        error_kind: ErrorKind,
        message: String,
        diagnostics: Vec<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::Error,
            download_url: None,
            note: None,
            message: Some(message),
            failed_stage: Some(failed_stage),
            error_kind: Some(error_kind),
            diagnostics,
            model_used: None,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}
