use crate::assets::AssetProvisioner;
use crate::config::PipelineConfig;
use crate::context::JobContext;
use crate::error::{PipelineError, Result};
use crate::executor::verify_artifact;
use crate::job::{Job, JobRequest, JobResult, JobStateMachine, StageId};
use crate::publisher::{PublishedLink, Publisher};
use crate::stages::{Capabilities, ConversionRequest, DurationPolicy, MixRequest};
use crate::stems::assign_stems;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Slack on top of the configured stage deadline. Subprocess stages enforce
/// their own deadline first and report partial stderr; this only catches
/// capabilities that never return.
const STAGE_GRACE: Duration = Duration::from_secs(2);

/// Sequences one job through assets → download → separation → conversion →
/// mixing → publish. Each stage is attempted exactly once.
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    provisioner: Arc<AssetProvisioner>,
    capabilities: Capabilities,
    publisher: Arc<Publisher>,
    permits: Arc<Semaphore>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        provisioner: Arc<AssetProvisioner>,
        capabilities: Capabilities,
        publisher: Arc<Publisher>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            config,
            provisioner,
            capabilities,
            publisher,
            permits,
        }
    }

    /// Network fetcher, real tools and HTTP upload backends
    pub fn production(config: Arc<PipelineConfig>) -> Result<Self> {
        let provisioner = Arc::new(AssetProvisioner::with_network()?);
        let capabilities = Capabilities::production(&config)?;
        let publisher = Arc::new(Publisher::from_config(
            &config.publisher,
            config.timeouts.for_stage(StageId::Publish),
        )?);
        Ok(Self::new(config, provisioner, capabilities, publisher))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Provision every asset ahead of the first job
    pub async fn warm_up(&self) -> Result<()> {
        let specs = self.config.assets.all();
        for spec in &specs {
            match self.provisioner.status(spec).await {
                Ok(status) => info!("Asset {} at {}: {:?}", spec.key(), spec.path.display(), status),
                Err(e) => warn!("Asset {} status unavailable: {}", spec.key(), e),
            }
        }
        self.provisioner.ensure_all(&specs).await?;
        Ok(())
    }

    /// Run several jobs concurrently, bounded by `max_concurrent_jobs`
    pub async fn execute_batch(&self, requests: Vec<JobRequest>) -> Vec<JobResult> {
        let jobs = requests.into_iter().map(|request| self.execute_job(request));
        futures::future::join_all(jobs).await
    }

    /// Main entry point. Never fails: every outcome is a [`JobResult`].
    pub async fn execute_job(&self, request: JobRequest) -> JobResult {
        let start = Instant::now();
        let job = Job::new(request);
        let job_id = job.id;
        let mut sm = JobStateMachine::new(job);

        if let Err(e) = sm.job().request.validate(self.config.allow_local_sources) {
            warn!("Job {} rejected: {}", job_id, e);
            return self.fail(&mut sm, None, StageId::Request, e, start);
        }

        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                let err = PipelineError::config(format!("job queue closed: {}", e));
                return self.fail(&mut sm, None, StageId::Request, err, start);
            }
        };

        info!(
            "Starting job {} for {} (pitch shift {})",
            job_id,
            sm.job().request.source_audio_reference,
            sm.job().request.pitch_shift
        );

        let mut ctx = match JobContext::create(job_id, &self.config.work_root, self.config.keep_work_dirs) {
            Ok(ctx) => ctx,
            Err(e) => return self.fail(&mut sm, None, StageId::Request, e, start),
        };

        match self.run_stages(&mut sm, &mut ctx).await {
            Ok(link) => {
                if let Err(e) = sm.publish(link.url.clone()) {
                    return self.fail(&mut sm, Some(&ctx), StageId::Publish, e, start);
                }
                let duration_ms = start.elapsed().as_millis() as u64;
                info!(
                    "Job {} published to {} via {} in {}ms",
                    job_id, link.url, link.backend, duration_ms
                );
                JobResult::success(
                    job_id,
                    link.url,
                    link.note,
                    Some(self.config.model_name().to_string()),
                    duration_ms,
                )
            }
            Err(e) => {
                let stage = e
                    .stage()
                    .or_else(|| sm.job().state.next_stage())
                    .unwrap_or(StageId::Request);
                self.fail(&mut sm, Some(&ctx), stage, e, start)
            }
        }
    }

    async fn run_stages(&self, sm: &mut JobStateMachine, ctx: &mut JobContext) -> Result<PublishedLink> {
        let job_id = ctx.job_id();
        let request = sm.job().request.clone();

        // RECEIVED → ASSETS_READY
        let provisioner = self.provisioner.clone();
        let specs = self.config.assets.all();
        self.run_stage(job_id, StageId::Assets, async move {
            provisioner.ensure_all(&specs).await
        })
        .await?;
        sm.advance(StageId::Assets)?;

        // ASSETS_READY → DOWNLOADED
        let fetcher = self.capabilities.fetcher.clone();
        let reference = request.source_audio_reference.clone();
        let work_dir = ctx.work_dir().to_path_buf();
        let source = self
            .run_stage(job_id, StageId::Download, async move {
                fetcher.fetch(&reference, &work_dir).await
            })
            .await?;
        verify_artifact(StageId::Download, &source).await?;
        ctx.artifacts.source_audio = Some(source.clone());
        sm.advance(StageId::Download)?;

        // DOWNLOADED → SEPARATED
        let separator = self.capabilities.separator.clone();
        let out_dir = ctx.separation_dir();
        let separated = self
            .run_stage(job_id, StageId::Separation, async move {
                separator.separate(&source, &out_dir).await
            })
            .await?;
        ctx.record(StageId::Separation, separated.log);
        let stems = separated.output;
        ctx.record(StageId::Separation, format!("separator output: {}", file_names(&stems)));
        for stem in &stems {
            verify_artifact(StageId::Separation, stem).await?;
        }
        let assignment = assign_stems(&stems, &self.config.stems.instrumental_marker)?;
        info!(
            "Job {}: vocal stem {}, instrumental stem {}",
            job_id,
            assignment.vocal.display(),
            assignment.instrumental.display()
        );
        ctx.artifacts.vocal_stem = Some(assignment.vocal.clone());
        ctx.artifacts.instrumental_stem = Some(assignment.instrumental.clone());
        sm.advance(StageId::Separation)?;

        // SEPARATED → CONVERTED
        let converter = self.capabilities.converter.clone();
        let conversion = ConversionRequest {
            vocal: assignment.vocal,
            weights: self.config.assets.weights.path.clone(),
            index: self.config.assets.index.path.clone(),
            codebase: self.config.assets.codebase.path.clone(),
            pitch_shift: request.pitch_shift,
            output: ctx.converted_vocal_path(),
        };
        let converted = self
            .run_stage(job_id, StageId::Conversion, async move {
                converter.convert(&conversion).await
            })
            .await?;
        ctx.record(StageId::Conversion, converted.log);
        let converted = converted.output;
        verify_artifact(StageId::Conversion, &converted).await?;
        ctx.artifacts.converted_vocal = Some(converted.clone());
        sm.advance(StageId::Conversion)?;

        // CONVERTED → MIXED
        let mixer = self.capabilities.mixer.clone();
        let mix = MixRequest {
            vocal: converted,
            backing: assignment.instrumental,
            vocal_gain: self.config.mix.vocal_gain,
            backing_gain: self.config.mix.backing_gain,
            duration: DurationPolicy::Longest,
            output: ctx.final_mix_path(&self.config.tools.mixing.output_name),
        };
        let mixed = self
            .run_stage(job_id, StageId::Mixing, async move { mixer.mix(&mix).await })
            .await?;
        ctx.record(StageId::Mixing, mixed.log);
        let final_mix = mixed.output;
        verify_artifact(StageId::Mixing, &final_mix).await?;
        ctx.artifacts.final_mix = Some(final_mix.clone());
        sm.advance(StageId::Mixing)?;

        // MIXED → PUBLISHED
        let publisher = self.publisher.clone();
        let link = self
            .run_stage(job_id, StageId::Publish, async move {
                publisher.publish(&final_mix).await
            })
            .await?;
        if let Some(note) = &link.note {
            ctx.record(StageId::Publish, format!("{}: {}", link.backend, note));
        }
        Ok(link)
    }

    /// Run one stage as its own task: a panic becomes a stage failure and a
    /// capability that overruns its deadline is aborted.
    async fn run_stage<T, F>(&self, job_id: Uuid, stage: StageId, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = self.config.timeouts.for_stage(stage);
        let stage_start = Instant::now();
        info!("Job {}: stage {} started", job_id, stage);

        let mut handle = tokio::spawn(fut);
        let result = match tokio::time::timeout(deadline + STAGE_GRACE, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                error!("Job {}: stage {} panicked: {}", job_id, stage, join_err);
                Err(PipelineError::ToolInvocation {
                    stage,
                    diagnostic: format!("stage task panicked: {}", panic_message(join_err)),
                })
            }
            Err(_) => {
                handle.abort();
                Err(PipelineError::Timeout {
                    stage,
                    timeout_ms: deadline.as_millis() as u64,
                    diagnostic: String::new(),
                })
            }
        };

        match &result {
            Ok(_) => info!(
                "Job {}: stage {} completed in {}ms",
                job_id,
                stage,
                stage_start.elapsed().as_millis()
            ),
            Err(e) => error!("Job {}: stage {} failed: {}", job_id, stage, e),
        }
        result
    }

    fn fail(
        &self,
        sm: &mut JobStateMachine,
        ctx: Option<&JobContext>,
        stage: StageId,
        err: PipelineError,
        start: Instant,
    ) -> JobResult {
        let job_id = sm.job().id;
        let kind = err.kind();
        let message = err.to_string();

        if let Err(e) = sm.fail(stage, kind, message.clone()) {
            warn!("Job {}: {}", job_id, e);
        }

        let mut diagnostics: Vec<String> = ctx
            .map(|ctx| ctx.diagnostics().iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        match &err {
            PipelineError::Publish { diagnostics: backends } => diagnostics.extend(backends.iter().cloned()),
            PipelineError::ToolInvocation { diagnostic, .. }
            | PipelineError::Timeout { diagnostic, .. }
            | PipelineError::MissingOutput { diagnostic, .. }
                if !diagnostic.trim().is_empty() =>
            {
                diagnostics.push(diagnostic.clone())
            }
            _ => {}
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        error!(
            "Job {} failed at {} ({}) after {}ms: {}",
            job_id, stage, kind, duration_ms, message
        );
        JobResult::error(job_id, stage, kind, message, diagnostics, duration_ms)
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
        Err(err) => err.to_string(),
    }
}

fn file_names(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}
