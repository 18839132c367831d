//! Stage capabilities
//!
//! Each processing stage is reached through a trait so the orchestrator can
//! be driven by real tools in production and by in-process fakes in tests.

pub mod conversion_stage;
pub mod download_stage;
pub mod mixing_stage;
pub mod separation_stage;

use crate::config::PipelineConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use conversion_stage::RvcConverter;
pub use download_stage::{source_extension, HttpSourceFetcher};
pub use mixing_stage::FfmpegMixer;
pub use separation_stage::AudioSeparator;

/// Brings the song into the job directory
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Store `reference` inside `dest_dir` under its canonical name
    async fn fetch(&self, reference: &str, dest_dir: &Path) -> Result<PathBuf>;
}

/// What a stage produced plus what its tool printed on the way
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport<T> {
    pub output: T,
    /// Captured tool output, kept for the job's diagnostic log
    pub log: String,
}

impl<T> StageReport<T> {
    pub fn new(output: T) -> Self {
        Self {
            output,
            log: String::new(),
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }
}

/// Splits a mixed track into stems
#[async_trait]
pub trait Separator: Send + Sync {
    /// Returns the unordered set of stem files written into `out_dir`
    async fn separate(&self, audio: &Path, out_dir: &Path) -> Result<StageReport<Vec<PathBuf>>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub vocal: PathBuf,
    pub weights: PathBuf,
    pub index: PathBuf,
    pub codebase: PathBuf,
    /// Semitones, passed through unchanged
    pub pitch_shift: i32,
    pub output: PathBuf,
}

/// Re-sings the isolated vocal with the target voice
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, request: &ConversionRequest) -> Result<StageReport<PathBuf>>;
}

/// Length of the mix relative to its inputs. The mix never truncates
/// either input, so the longest input is the only policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurationPolicy {
    #[default]
    Longest,
}

impl DurationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationPolicy::Longest => "longest",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixRequest {
    pub vocal: PathBuf,
    pub backing: PathBuf,
    pub vocal_gain: f32,
    pub backing_gain: f32,
    pub duration: DurationPolicy,
    pub output: PathBuf,
}

/// Combines converted vocal and instrumental into the final track
#[async_trait]
pub trait Mixer: Send + Sync {
    async fn mix(&self, request: &MixRequest) -> Result<StageReport<PathBuf>>;
}

/// The set of stage implementations a pipeline runs with
#[derive(Clone)]
pub struct Capabilities {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub separator: Arc<dyn Separator>,
    pub converter: Arc<dyn Converter>,
    pub mixer: Arc<dyn Mixer>,
}

impl Capabilities {
    /// Real tools as described by the configuration
    pub fn production(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            fetcher: Arc::new(HttpSourceFetcher::new()?.allow_local_files(config.allow_local_sources)),
            separator: Arc::new(AudioSeparator::from_config(config)),
            converter: Arc::new(RvcConverter::from_config(config)),
            mixer: Arc::new(FfmpegMixer::from_config(config)),
        })
    }
}
