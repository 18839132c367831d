/*
 * Voicecover Orchestration - AI cover pipeline
 *
 * Turns a song reference and a pitch shift into a re-sung cover and a
 * download link.
 *
 * Architecture:
 * - Asset Provisioner (model weights, index file, inference codebase)
 * - Stage Executor (external tools as isolated subprocesses)
 * - Pipeline Orchestrator (forward-only job state machine)
 * - Publisher (prioritized upload backends with fallback)
 */

// Public modules
pub mod assets;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod job;
pub mod orchestrator;
pub mod publisher;
pub mod stages;
pub mod stems;

// Re-exports
pub use assets::{
    AssetFetcher, AssetHandle, AssetKey, AssetKind, AssetProvisioner, AssetSource, AssetSpec,
    AssetStatus, NetworkFetcher,
};
pub use config::PipelineConfig;
pub use context::{DiagnosticEntry, JobContext};
pub use error::{ErrorKind, PipelineError, Result};
pub use executor::{CommandSpec, FailureKind, StageExecutor, StageFailure, StageOutcome};
pub use job::{Job, JobRequest, JobResult, JobState, JobStateMachine, JobStatus, StageId};
pub use orchestrator::PipelineOrchestrator;
pub use publisher::{
    HttpUploadBackend, PublishedLink, Publisher, ResponseFormat, UploadBackend, UploadMethod,
    UploadResponse,
};
pub use stages::{
    Capabilities, ConversionRequest, Converter, DurationPolicy, MixRequest, Mixer, Separator,
    SourceFetcher, StageReport,
};
pub use stems::{assign_stems, classify_stem, StemAssignment, StemRole};
