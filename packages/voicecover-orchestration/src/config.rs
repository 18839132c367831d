//! Pipeline configuration
//!
//! Built once at startup (YAML file + `VOICECOVER_*` environment overrides),
//! validated, then shared read-only as `Arc<PipelineConfig>`.

use crate::assets::{AssetKind, AssetSource, AssetSpec};
use crate::error::{PipelineError, Result};
use crate::job::StageId;
use crate::publisher::{ResponseFormat, UploadMethod};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BASE_DIR: &str = "/app";
const DEFAULT_MODEL_URL: &str = "https://www.toponedumps.com/wukong_v2.pth";
const DEFAULT_MODEL_NAME: &str = "wukong_v2.pth";
const DEFAULT_INDEX_NAME: &str = "trained_IVF3062_Flat_nprobe_1_wukong_v2_v2.index";
const DEFAULT_RVC_REPO: &str =
    "https://github.com/RVC-Project/Retrieval-based-Voice-Conversion-WebUI.git";
const DEFAULT_RVC_ENTRY_POINT: &str = "tools/infer_cli.py";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Parent directory of per-job working directories
    pub work_root: PathBuf,
    /// Keep job directories after completion (debugging)
    pub keep_work_dirs: bool,
    /// Accept `file://` song references. Off by default: a request could
    /// otherwise make the worker read and publish any local file.
    pub allow_local_sources: bool,
    /// Upper bound on jobs processed at the same time by the worker
    pub max_concurrent_jobs: usize,
    pub assets: AssetsConfig,
    pub tools: ToolsConfig,
    pub timeouts: StageTimeouts,
    pub mix: MixConfig,
    pub stems: StemConfig,
    pub publisher: PublisherConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from(DEFAULT_BASE_DIR).join("output"),
            keep_work_dirs: false,
            allow_local_sources: false,
            max_concurrent_jobs: (num_cpus::get() / 2).max(1),
            assets: AssetsConfig::default(),
            tools: ToolsConfig::default(),
            timeouts: StageTimeouts::default(),
            mix: MixConfig::default(),
            stems: StemConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

/// Assets required before a job may run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetsConfig {
    pub weights: AssetSpec,
    pub index: AssetSpec,
    /// Voice-conversion tool checkout (entry point = inference CLI script)
    pub codebase: AssetSpec,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        let base = PathBuf::from(DEFAULT_BASE_DIR);
        Self {
            weights: AssetSpec {
                kind: AssetKind::ModelWeights,
                name: DEFAULT_MODEL_NAME.to_string(),
                path: base.join(DEFAULT_MODEL_NAME),
                source: AssetSource::Http {
                    url: DEFAULT_MODEL_URL.to_string(),
                },
                entry_point: None,
                sha256: None,
            },
            index: AssetSpec {
                kind: AssetKind::IndexFile,
                name: DEFAULT_INDEX_NAME.to_string(),
                path: base.join(DEFAULT_INDEX_NAME),
                source: AssetSource::PreStaged,
                entry_point: None,
                sha256: None,
            },
            codebase: AssetSpec {
                kind: AssetKind::ToolCodebase,
                name: "rvc".to_string(),
                path: base.join("rvc"),
                source: AssetSource::Git {
                    url: DEFAULT_RVC_REPO.to_string(),
                    rev: None,
                },
                entry_point: Some(PathBuf::from(DEFAULT_RVC_ENTRY_POINT)),
                sha256: None,
            },
        }
    }
}

impl AssetsConfig {
    /// All assets in provisioning order
    pub fn all(&self) -> Vec<AssetSpec> {
        vec![
            self.weights.clone(),
            self.index.clone(),
            self.codebase.clone(),
        ]
    }
}

/// External tool invocations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub separation: SeparationToolConfig,
    pub conversion: ConversionToolConfig,
    pub mixing: MixingToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeparationToolConfig {
    pub program: String,
    pub model_filename: String,
    pub extra_args: Vec<String>,
}

impl Default for SeparationToolConfig {
    fn default() -> Self {
        Self {
            program: "audio-separator".to_string(),
            model_filename: "UVR-MDX-NET-Inst_HQ_3.onnx".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConversionToolConfig {
    pub program: String,
    /// Inference script, relative to the codebase asset
    pub script: PathBuf,
    pub extra_args: Vec<String>,
}

impl Default for ConversionToolConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            script: PathBuf::from(DEFAULT_RVC_ENTRY_POINT),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MixingToolConfig {
    pub program: String,
    /// File name of the final mix inside the job directory
    pub output_name: String,
}

impl Default for MixingToolConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            output_name: "final_result.mp3".to_string(),
        }
    }
}

/// Per-stage deadlines in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageTimeouts {
    pub assets_ms: u64,
    pub download_ms: u64,
    pub separation_ms: u64,
    pub conversion_ms: u64,
    pub mixing_ms: u64,
    pub publish_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            assets_ms: 30 * 60 * 1000,
            download_ms: 5 * 60 * 1000,
            separation_ms: 30 * 60 * 1000,
            conversion_ms: 60 * 60 * 1000,
            mixing_ms: 10 * 60 * 1000,
            publish_ms: 10 * 60 * 1000,
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: StageId) -> Duration {
        let ms = match stage {
            StageId::Request => 0,
            StageId::Assets => self.assets_ms,
            StageId::Download => self.download_ms,
            StageId::Separation => self.separation_ms,
            StageId::Conversion => self.conversion_ms,
            StageId::Mixing => self.mixing_ms,
            StageId::Publish => self.publish_ms,
        };
        Duration::from_millis(ms)
    }

    fn all(&self) -> [(&'static str, u64); 6] {
        [
            ("assets_ms", self.assets_ms),
            ("download_ms", self.download_ms),
            ("separation_ms", self.separation_ms),
            ("conversion_ms", self.conversion_ms),
            ("mixing_ms", self.mixing_ms),
            ("publish_ms", self.publish_ms),
        ]
    }
}

/// Mixer gains
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MixConfig {
    pub vocal_gain: f32,
    pub backing_gain: f32,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            vocal_gain: 1.5,
            backing_gain: 1.0,
        }
    }
}

/// Stem classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StemConfig {
    /// Substring that marks the instrumental/backing stem file
    pub instrumental_marker: String,
}

impl Default for StemConfig {
    fn default() -> Self {
        Self {
            instrumental_marker: "Instrumental".to_string(),
        }
    }
}

/// Upload backends in priority order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    /// Try the remaining backends when one fails
    pub fallback: bool,
    pub backends: Vec<BackendConfig>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            fallback: true,
            backends: vec![
                BackendConfig {
                    name: "transfer.sh".to_string(),
                    url: "https://transfer.sh".to_string(),
                    method: UploadMethod::Put,
                    response: ResponseFormat::BareUrl {
                        prefix: "https://".to_string(),
                    },
                    retention_note: Some("transfer.sh keeps uploads for 14 days".to_string()),
                },
                BackendConfig {
                    name: "file.io".to_string(),
                    url: "https://file.io".to_string(),
                    method: UploadMethod::Multipart {
                        field: "file".to_string(),
                    },
                    response: ResponseFormat::JsonFlag {
                        success_field: "success".to_string(),
                        link_field: "link".to_string(),
                    },
                    retention_note: Some(
                        "file.io links are deleted after the first download".to_string(),
                    ),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub name: String,
    pub url: String,
    pub method: UploadMethod,
    pub response: ResponseFormat,
    #[serde(default)]
    pub retention_note: Option<String>,
}

impl PipelineConfig {
    /// Load from a YAML file and validate
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Apply `VOICECOVER_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VOICECOVER_WORK_ROOT") {
            self.work_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("VOICECOVER_MODEL_URL") {
            self.assets.weights.source = AssetSource::Http { url: v };
        }
        if let Some(v) = lookup("VOICECOVER_MODEL_PATH") {
            self.assets.weights.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VOICECOVER_INDEX_PATH") {
            self.assets.index.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VOICECOVER_RVC_DIR") {
            self.assets.codebase.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VOICECOVER_MAX_CONCURRENT_JOBS").and_then(|v| v.parse().ok()) {
            self.max_concurrent_jobs = v;
        }
        if let Some(v) = lookup("VOICECOVER_ALLOW_LOCAL_SOURCES").and_then(|v| v.parse().ok()) {
            self.allow_local_sources = v;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(PipelineError::config("max_concurrent_jobs must be at least 1"));
        }

        for (expected, spec) in [
            (AssetKind::ModelWeights, &self.assets.weights),
            (AssetKind::IndexFile, &self.assets.index),
            (AssetKind::ToolCodebase, &self.assets.codebase),
        ] {
            if spec.kind != expected {
                return Err(PipelineError::config(format!(
                    "asset '{}' declared as {} but used as {}",
                    spec.name, spec.kind, expected
                )));
            }
            spec.validate()?;
        }

        for (field, ms) in self.timeouts.all() {
            if ms == 0 {
                return Err(PipelineError::config(format!(
                    "timeouts.{} must be greater than 0",
                    field
                )));
            }
        }

        for (field, gain) in [
            ("vocal_gain", self.mix.vocal_gain),
            ("backing_gain", self.mix.backing_gain),
        ] {
            if !gain.is_finite() || gain <= 0.0 {
                return Err(PipelineError::config(format!(
                    "mix.{} must be a positive number, got {}",
                    field, gain
                )));
            }
        }

        if self.stems.instrumental_marker.is_empty() {
            return Err(PipelineError::config("stems.instrumental_marker is empty"));
        }

        if self.publisher.backends.is_empty() {
            return Err(PipelineError::config(
                "publisher.backends must declare at least one backend",
            ));
        }
        for backend in &self.publisher.backends {
            reqwest::Url::parse(&backend.url).map_err(|e| {
                PipelineError::config(format!("backend '{}' url: {}", backend.name, e))
            })?;
        }

        Ok(())
    }

    /// Model identifier reported in job results
    pub fn model_name(&self) -> &str {
        &self.assets.weights.name
    }
}
