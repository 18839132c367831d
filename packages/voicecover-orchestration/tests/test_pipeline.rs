//! End-to-end pipeline tests with in-process capabilities
//!
//! Every external tool is replaced by a fake that records its calls, so the
//! tests can assert which stages ran, with which inputs, and how failures
//! surface in the job result.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use voicecover_orchestration::{
    AssetFetcher, AssetKind, AssetProvisioner, AssetSource, AssetSpec, Capabilities,
    ConversionRequest, Converter, DurationPolicy, ErrorKind, JobRequest, JobStatus, MixRequest,
    Mixer, PipelineConfig, PipelineError, PipelineOrchestrator, Publisher, ResponseFormat,
    Result, Separator, SourceFetcher, StageId, StageReport, UploadBackend, UploadResponse,
};

const INSTRUMENTAL: &str = "input_song_(Instrumental)_UVR-MDX-NET-Inst_HQ_3.wav";
const VOCALS: &str = "input_song_(Vocals)_UVR-MDX-NET-Inst_HQ_3.wav";
const SEPARATOR_LOG: &str = "Loading model UVR-MDX-NET-Inst_HQ_3.onnx\n100%|##########| 12/12";

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct Calls {
    asset_files: AtomicUsize,
    asset_clones: AtomicUsize,
    fetches: AtomicUsize,
    separations: AtomicUsize,
    conversions: AtomicUsize,
    mixes: AtomicUsize,
    uploads: AtomicUsize,
    pitches: Mutex<Vec<i32>>,
    converted_inputs: Mutex<Vec<PathBuf>>,
    mix_requests: Mutex<Vec<MixRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Calls {
    fn stage_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
            + self.separations.load(Ordering::SeqCst)
            + self.conversions.load(Ordering::SeqCst)
            + self.mixes.load(Ordering::SeqCst)
            + self.uploads.load(Ordering::SeqCst)
    }

    fn asset_calls(&self) -> usize {
        self.asset_files.load(Ordering::SeqCst) + self.asset_clones.load(Ordering::SeqCst)
    }
}

struct FakeAssets(Arc<Calls>);

#[async_trait]
impl AssetFetcher for FakeAssets {
    async fn fetch_file(&self, _url: &str, dest: &Path) -> Result<u64> {
        self.0.asset_files.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::fs::write(dest, b"weights").await?;
        Ok(7)
    }

    async fn clone_repo(&self, _url: &str, _rev: Option<&str>, dest: &Path) -> Result<()> {
        self.0.asset_clones.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(dest.join("tools")).await?;
        tokio::fs::write(dest.join("tools/infer_cli.py"), b"# cli").await?;
        Ok(())
    }
}

struct FakeFetcher(Arc<Calls>);

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, _reference: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        let path = dest_dir.join("input_song.mp3");
        tokio::fs::write(&path, b"ID3 song").await?;
        Ok(path)
    }
}

enum SeparatorMode {
    /// Write these stem names and report them in this order
    Stems(Vec<&'static str>),
    Hang,
}

struct FakeSeparator {
    calls: Arc<Calls>,
    mode: SeparatorMode,
}

#[async_trait]
impl Separator for FakeSeparator {
    async fn separate(&self, _audio: &Path, out_dir: &Path) -> Result<StageReport<Vec<PathBuf>>> {
        self.calls.separations.fetch_add(1, Ordering::SeqCst);
        let now = self.calls.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.calls.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &self.mode {
            SeparatorMode::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(StageReport::new(Vec::new()))
            }
            SeparatorMode::Stems(names) => {
                let mut paths = Vec::new();
                for name in names {
                    let path = out_dir.join(name);
                    tokio::fs::write(&path, b"RIFF stem").await?;
                    paths.push(path);
                }
                Ok(StageReport::new(paths).with_log(SEPARATOR_LOG))
            }
        }
    }
}

enum ConverterMode {
    Writes,
    /// Exits non-zero with this stderr
    Crashes(&'static str),
    /// Exits cleanly with this stderr but writes nothing
    WritesNothing(&'static str),
}

struct FakeConverter {
    calls: Arc<Calls>,
    mode: ConverterMode,
}

#[async_trait]
impl Converter for FakeConverter {
    async fn convert(&self, request: &ConversionRequest) -> Result<StageReport<PathBuf>> {
        self.calls.conversions.fetch_add(1, Ordering::SeqCst);
        self.calls.pitches.lock().push(request.pitch_shift);
        self.calls.converted_inputs.lock().push(request.vocal.clone());
        match self.mode {
            ConverterMode::Crashes(stderr) => Err(PipelineError::ToolInvocation {
                stage: StageId::Conversion,
                diagnostic: format!("voice conversion failed: {}", stderr),
            }),
            ConverterMode::WritesNothing(stderr) => Err(PipelineError::MissingOutput {
                stage: StageId::Conversion,
                path: request.output.display().to_string(),
                diagnostic: format!("{} does not exist\n{}", request.output.display(), stderr),
            }),
            ConverterMode::Writes => {
                tokio::fs::write(&request.output, b"RIFF converted").await?;
                Ok(StageReport::new(request.output.clone()).with_log("conversion done"))
            }
        }
    }
}

struct FakeMixer {
    calls: Arc<Calls>,
    explode: bool,
}

#[async_trait]
impl Mixer for FakeMixer {
    async fn mix(&self, request: &MixRequest) -> Result<StageReport<PathBuf>> {
        self.calls.mixes.fetch_add(1, Ordering::SeqCst);
        self.calls.mix_requests.lock().push(request.clone());
        if self.explode {
            panic!("mixer exploded");
        }
        tokio::fs::write(&request.output, b"ID3 mix").await?;
        Ok(StageReport::new(request.output.clone()))
    }
}

struct FakeBackend {
    calls: Arc<Calls>,
    status: u16,
    body: &'static str,
}

#[async_trait]
impl UploadBackend for FakeBackend {
    async fn upload(&self, _path: &Path) -> Result<UploadResponse> {
        self.calls.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(UploadResponse {
            status: self.status,
            body: self.body.to_string(),
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    root: TempDir,
    calls: Arc<Calls>,
    config: PipelineConfig,
    separator: SeparatorMode,
    converter: ConverterMode,
    mixer_explodes: bool,
    backends: Vec<(u16, &'static str)>,
}

impl Harness {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let assets = root.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("wukong.index"), b"faiss index").unwrap();

        let mut config = PipelineConfig::default();
        config.work_root = root.path().join("work");
        config.max_concurrent_jobs = 2;
        config.assets.weights = AssetSpec {
            kind: AssetKind::ModelWeights,
            name: "wukong_v2.pth".to_string(),
            path: assets.join("wukong_v2.pth"),
            source: AssetSource::Http {
                url: "https://models.invalid/wukong_v2.pth".to_string(),
            },
            entry_point: None,
            sha256: None,
        };
        config.assets.index = AssetSpec {
            kind: AssetKind::IndexFile,
            name: "wukong.index".to_string(),
            path: assets.join("wukong.index"),
            source: AssetSource::PreStaged,
            entry_point: None,
            sha256: None,
        };
        config.assets.codebase = AssetSpec {
            kind: AssetKind::ToolCodebase,
            name: "rvc".to_string(),
            path: root.path().join("rvc"),
            source: AssetSource::Git {
                url: "https://git.invalid/rvc.git".to_string(),
                rev: None,
            },
            entry_point: Some(PathBuf::from("tools/infer_cli.py")),
            sha256: None,
        };

        Self {
            root,
            calls: Arc::new(Calls::default()),
            config,
            separator: SeparatorMode::Stems(vec![INSTRUMENTAL, VOCALS]),
            converter: ConverterMode::Writes,
            mixer_explodes: false,
            backends: vec![(200, "https://transfer.sh/abc/final_result.mp3")],
        }
    }

    fn build(self) -> (PipelineOrchestrator, Arc<Calls>, TempDir) {
        let calls = self.calls.clone();
        let provisioner = Arc::new(AssetProvisioner::new(Arc::new(FakeAssets(calls.clone()))));
        let capabilities = Capabilities {
            fetcher: Arc::new(FakeFetcher(calls.clone())),
            separator: Arc::new(FakeSeparator {
                calls: calls.clone(),
                mode: self.separator,
            }),
            converter: Arc::new(FakeConverter {
                calls: calls.clone(),
                mode: self.converter,
            }),
            mixer: Arc::new(FakeMixer {
                calls: calls.clone(),
                explode: self.mixer_explodes,
            }),
        };

        let mut publisher = Publisher::new(true);
        for (i, (status, body)) in self.backends.into_iter().enumerate() {
            let format = if body.starts_with('{') {
                ResponseFormat::JsonFlag {
                    success_field: "success".to_string(),
                    link_field: "link".to_string(),
                }
            } else {
                ResponseFormat::BareUrl {
                    prefix: "https://".to_string(),
                }
            };
            publisher = publisher.with_backend(
                format!("backend-{}", i),
                format,
                Some(format!("backend-{} keeps files for 14 days", i)),
                Arc::new(FakeBackend {
                    calls: calls.clone(),
                    status,
                    body,
                }),
            );
        }

        let orchestrator = PipelineOrchestrator::new(
            Arc::new(self.config),
            provisioner,
            capabilities,
            Arc::new(publisher),
        );
        (orchestrator, calls, self.root)
    }
}

fn request(pitch_shift: i32) -> JobRequest {
    JobRequest::new("https://cdn.invalid/songs/track.mp3", pitch_shift)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_happy_path_publishes_with_retention_note() {
    let (orch, calls, root) = Harness::new().build();

    let result = orch.execute_job(request(3)).await;

    assert_eq!(result.status, JobStatus::Success, "{:?}", result);
    assert_eq!(
        result.download_url.as_deref(),
        Some("https://transfer.sh/abc/final_result.mp3")
    );
    assert_eq!(result.note.as_deref(), Some("backend-0 keeps files for 14 days"));
    assert_eq!(result.model_used.as_deref(), Some("wukong_v2.pth"));
    assert!(result.message.is_none());
    assert_eq!(calls.stage_calls(), 5);

    // Job directory is gone once the job is over
    let leftovers = std::fs::read_dir(root.path().join("work")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_empty_reference_runs_nothing() {
    for reference in ["", "   \t"] {
        let (orch, calls, _root) = Harness::new().build();

        let result = orch.execute_job(JobRequest::new(reference, 0)).await;

        assert_eq!(result.status, JobStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::RequestValidation));
        assert_eq!(result.failed_stage, Some(StageId::Request));
        assert!(result.message.is_some());
        assert!(result.download_url.is_none());
        assert_eq!(calls.stage_calls(), 0);
        assert_eq!(calls.asset_calls(), 0);
    }
}

#[tokio::test]
async fn test_stem_roles_independent_of_listing_order() {
    for order in [vec![INSTRUMENTAL, VOCALS], vec![VOCALS, INSTRUMENTAL]] {
        let mut harness = Harness::new();
        harness.separator = SeparatorMode::Stems(order);
        let (orch, calls, _root) = harness.build();

        let result = orch.execute_job(request(0)).await;
        assert!(result.is_success(), "{:?}", result);

        let converted = calls.converted_inputs.lock().clone();
        assert_eq!(converted.len(), 1);
        assert!(converted[0].ends_with(VOCALS));

        let mixes = calls.mix_requests.lock().clone();
        assert!(mixes[0].backing.ends_with(INSTRUMENTAL));
    }
}

#[tokio::test]
async fn test_no_vocal_stem_is_data_quality_and_skips_conversion() {
    let mut harness = Harness::new();
    harness.separator = SeparatorMode::Stems(vec![INSTRUMENTAL]);
    let (orch, calls, _root) = harness.build();

    let result = orch.execute_job(request(0)).await;

    assert_eq!(result.status, JobStatus::Error);
    assert_eq!(result.error_kind, Some(ErrorKind::DataQuality));
    assert_eq!(result.failed_stage, Some(StageId::Separation));
    assert_eq!(calls.conversions.load(Ordering::SeqCst), 0);
    assert_eq!(calls.mixes.load(Ordering::SeqCst), 0);
    assert!(result.diagnostics.iter().any(|d| d.contains(INSTRUMENTAL)));
    // What the separator printed is kept even though it exited cleanly
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.starts_with("[separation]") && d.contains("Loading model UVR-MDX-NET-Inst_HQ_3.onnx")));
}

#[tokio::test]
async fn test_mix_keeps_longest_input_with_configured_gains() {
    let (orch, calls, _root) = Harness::new().build();

    assert!(orch.execute_job(request(0)).await.is_success());

    let mixes = calls.mix_requests.lock().clone();
    assert_eq!(mixes.len(), 1);
    assert_eq!(mixes[0].duration, DurationPolicy::Longest);
    assert_eq!(mixes[0].vocal_gain, 1.5);
    assert_eq!(mixes[0].backing_gain, 1.0);
    assert!(mixes[0].vocal.ends_with("converted_vocal.wav"));
    assert!(mixes[0].output.ends_with("final_result.mp3"));
}

#[tokio::test]
async fn test_publish_fallback_and_exhaustion() {
    // Primary down, secondary answers
    let mut harness = Harness::new();
    harness.backends = vec![
        (503, "Service Unavailable"),
        (200, r#"{"success":true,"link":"https://file.io/xyz"}"#),
    ];
    let (orch, calls, _root) = harness.build();
    let result = orch.execute_job(request(0)).await;
    assert_eq!(result.download_url.as_deref(), Some("https://file.io/xyz"));
    assert_eq!(result.note.as_deref(), Some("backend-1 keeps files for 14 days"));
    assert_eq!(calls.uploads.load(Ordering::SeqCst), 2);

    // Everything down
    let mut harness = Harness::new();
    harness.backends = vec![
        (503, "Service Unavailable"),
        (200, r#"{"success":false,"error":"quota exceeded"}"#),
    ];
    let (orch, _calls, _root) = harness.build();
    let result = orch.execute_job(request(0)).await;

    assert_eq!(result.error_kind, Some(ErrorKind::Publish));
    assert_eq!(result.failed_stage, Some(StageId::Publish));
    let message = result.message.unwrap();
    assert!(message.contains("backend-0: HTTP 503: Service Unavailable"));
    assert!(message.contains("quota exceeded"));
    assert!(result.diagnostics.iter().any(|d| d.starts_with("backend-0:")));
    assert!(result.diagnostics.iter().any(|d| d.starts_with("backend-1:")));
}

#[tokio::test]
async fn test_zero_pitch_still_converts() {
    let (orch, calls, _root) = Harness::new().build();

    assert!(orch.execute_job(request(0)).await.is_success());
    assert_eq!(*calls.pitches.lock(), vec![0]);
}

#[tokio::test]
async fn test_assets_provisioned_once_across_jobs() {
    let (orch, calls, _root) = Harness::new().build();

    assert!(orch.execute_job(request(0)).await.is_success());
    assert!(orch.execute_job(request(1)).await.is_success());

    assert_eq!(calls.asset_files.load(Ordering::SeqCst), 1);
    assert_eq!(calls.asset_clones.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_codebase_without_entry_point_is_reprovisioned() {
    let harness = Harness::new();
    let codebase = harness.config.assets.codebase.path.clone();
    std::fs::create_dir_all(codebase.join("tools")).unwrap();
    std::fs::write(codebase.join("stale.txt"), b"half a clone").unwrap();
    let (orch, calls, _root) = harness.build();

    assert!(orch.execute_job(request(0)).await.is_success());

    assert_eq!(calls.asset_clones.load(Ordering::SeqCst), 1);
    assert!(codebase.join("tools/infer_cli.py").is_file());
    assert!(!codebase.join("stale.txt").exists());
}

#[tokio::test]
async fn test_conversion_failure_keeps_stderr() {
    let mut harness = Harness::new();
    harness.converter = ConverterMode::Crashes("RuntimeError: CUDA out of memory");
    let (orch, calls, _root) = harness.build();

    let result = orch.execute_job(request(-2)).await;

    assert_eq!(result.error_kind, Some(ErrorKind::ToolInvocation));
    assert_eq!(result.failed_stage, Some(StageId::Conversion));
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.contains("RuntimeError: CUDA out of memory")));
    assert_eq!(calls.mixes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_conversion_without_output_keeps_stderr() {
    let mut harness = Harness::new();
    harness.converter = ConverterMode::WritesNothing("Warning: f0 extraction produced NaN, skipping write");
    let (orch, calls, _root) = harness.build();

    let result = orch.execute_job(request(0)).await;

    assert_eq!(result.error_kind, Some(ErrorKind::ToolInvocation));
    assert_eq!(result.failed_stage, Some(StageId::Conversion));
    assert!(result.message.as_deref().unwrap().contains("f0 extraction produced NaN"));
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.contains("f0 extraction produced NaN")));
    assert_eq!(calls.mixes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_local_file_reference_needs_opt_in() {
    let (orch, calls, _root) = Harness::new().build();
    let result = orch.execute_job(JobRequest::new("file:///etc/passwd", 0)).await;

    assert_eq!(result.error_kind, Some(ErrorKind::RequestValidation));
    assert_eq!(result.failed_stage, Some(StageId::Request));
    assert_eq!(calls.stage_calls(), 0);
    assert_eq!(calls.asset_calls(), 0);

    let mut harness = Harness::new();
    harness.config.allow_local_sources = true;
    let (orch, calls, _root) = harness.build();
    let result = orch.execute_job(JobRequest::new("file:///srv/songs/track.wav", 0)).await;

    assert!(result.is_success(), "{:?}", result);
    assert_eq!(calls.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_stage_becomes_failure() {
    let mut harness = Harness::new();
    harness.mixer_explodes = true;
    let (orch, calls, _root) = harness.build();

    let result = orch.execute_job(request(0)).await;

    assert_eq!(result.status, JobStatus::Error);
    assert_eq!(result.failed_stage, Some(StageId::Mixing));
    assert!(result.message.unwrap().contains("mixer exploded"));
    assert_eq!(calls.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stage_deadline_reports_timeout() {
    let mut harness = Harness::new();
    harness.separator = SeparatorMode::Hang;
    harness.config.timeouts.separation_ms = 100;
    let (orch, calls, _root) = harness.build();

    let result = tokio::time::timeout(Duration::from_secs(20), orch.execute_job(request(0)))
        .await
        .expect("job did not honour its deadline");

    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(result.failed_stage, Some(StageId::Separation));
    assert_eq!(calls.conversions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_jobs_bounded_and_share_assets() {
    let (orch, calls, _root) = Harness::new().build();

    let results = orch.execute_batch((0..4).map(request).collect()).await;

    assert!(results.iter().all(|r| r.is_success()), "{:?}", results);
    let urls: std::collections::HashSet<_> = results.iter().map(|r| r.job_id).collect();
    assert_eq!(urls.len(), 4);
    assert!(calls.peak_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(calls.asset_files.load(Ordering::SeqCst), 1);
    assert_eq!(calls.asset_clones.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_result_wire_format() {
    let (orch, _calls, _root) = Harness::new().build();

    let ok = serde_json::to_value(orch.execute_job(request(0)).await).unwrap();
    assert_eq!(ok["status"], "success");
    assert!(ok.get("message").is_none());
    assert!(ok["download_url"].is_string());

    let err = serde_json::to_value(orch.execute_job(JobRequest::new("", 0)).await).unwrap();
    assert_eq!(err["status"], "error");
    assert_eq!(err["error_kind"], "request_validation");
    assert!(err["message"].is_string());
    assert!(err.get("download_url").is_none());
}

#[test]
fn test_legacy_request_shape_accepted() {
    let request: JobRequest =
        serde_json::from_str(r#"{"song_url":"https://cdn.invalid/a.mp3","pitch":-4}"#).unwrap();
    assert_eq!(request.source_audio_reference, "https://cdn.invalid/a.mp3");
    assert_eq!(request.pitch_shift, -4);

    let request: JobRequest = serde_json::from_str(r#"{"source_audio_reference":"file:///a.wav"}"#).unwrap();
    assert_eq!(request.pitch_shift, 0);
}
