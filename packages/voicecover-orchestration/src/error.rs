use crate::job::StageId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    RequestValidation(String),

    #[error("Asset provisioning failed for {asset}: {reason}")]
    AssetProvisioning { asset: String, reason: String },

    #[error("Stage {stage} failed: {diagnostic}")]
    ToolInvocation { stage: StageId, diagnostic: String },

    #[error("Stage {stage} produced an unusable result: {reason}")]
    DataQuality { stage: StageId, reason: String },

    #[error("All upload backends failed:\n{}", diagnostics.join("\n"))]
    Publish { diagnostics: Vec<String> },

    /// `diagnostic` holds whatever the tool printed before it was killed
    #[error("Stage {stage} timed out after {timeout_ms}ms")]
    Timeout {
        stage: StageId,
        timeout_ms: u64,
        diagnostic: String,
    },

    /// `diagnostic` starts with the reason and carries the tool's stderr
    #[error("Stage {stage} left no usable output at {path}: {diagnostic}")]
    MissingOutput {
        stage: StageId,
        path: String,
        diagnostic: String,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl PipelineError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn asset<A: std::fmt::Display, E: std::fmt::Display>(asset: A, reason: E) -> Self {
        Self::AssetProvisioning {
            asset: asset.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Classification reported back to the caller in the job result
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RequestValidation(_) => ErrorKind::RequestValidation,
            Self::AssetProvisioning { .. } | Self::Git(_) => ErrorKind::AssetProvisioning,
            Self::ToolInvocation { .. } | Self::MissingOutput { .. } => ErrorKind::ToolInvocation,
            Self::DataQuality { .. } => ErrorKind::DataQuality,
            Self::Publish { .. } => ErrorKind::Publish,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidStateTransition { .. }
            | Self::Config(_)
            | Self::Io(_)
            | Self::Http(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::Parse(_) => ErrorKind::Internal,
        }
    }

    /// Stage the error is attributed to, if the error carries one
    pub fn stage(&self) -> Option<StageId> {
        match self {
            Self::ToolInvocation { stage, .. }
            | Self::DataQuality { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::MissingOutput { stage, .. } => Some(*stage),
            Self::AssetProvisioning { .. } | Self::Git(_) => Some(StageId::Assets),
            Self::Publish { .. } => Some(StageId::Publish),
            _ => None,
        }
    }
}

/// Error taxonomy exposed to callers. Retry decisions belong to whoever
/// resubmits the job; the pipeline never retries on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed request fields; no stage ran
    RequestValidation,
    /// Weights/index/codebase could not be acquired
    AssetProvisioning,
    /// External tool exited non-zero, failed to launch, or left no output
    ToolInvocation,
    /// Tool succeeded but the result is unusable (e.g. no vocal stem)
    DataQuality,
    /// Every upload backend failed
    Publish,
    /// Stage deadline expired and the subprocess was killed
    Timeout,
    /// Anything else (IO, config, state machine misuse)
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RequestValidation => "request_validation",
            ErrorKind::AssetProvisioning => "asset_provisioning",
            ErrorKind::ToolInvocation => "tool_invocation",
            ErrorKind::DataQuality => "data_quality",
            ErrorKind::Publish => "publish",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "request_validation" => Ok(ErrorKind::RequestValidation),
            "asset_provisioning" => Ok(ErrorKind::AssetProvisioning),
            "tool_invocation" => Ok(ErrorKind::ToolInvocation),
            "data_quality" => Ok(ErrorKind::DataQuality),
            "publish" => Ok(ErrorKind::Publish),
            "timeout" => Ok(ErrorKind::Timeout),
            "internal" => Ok(ErrorKind::Internal),
            _ => Err(PipelineError::parse(format!("Invalid error kind: {}", s))),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
