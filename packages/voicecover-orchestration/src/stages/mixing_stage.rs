use super::{MixRequest, Mixer, StageReport};
use crate::config::{MixingToolConfig, PipelineConfig};
use crate::error::Result;
use crate::executor::{CommandSpec, StageExecutor, StageOutcome};
use crate::job::StageId;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Two-input mix through ffmpeg's `amix` filter
pub struct FfmpegMixer {
    executor: StageExecutor,
    tool: MixingToolConfig,
    timeout: Duration,
}

impl FfmpegMixer {
    pub fn new(tool: MixingToolConfig, timeout: Duration) -> Self {
        Self {
            executor: StageExecutor::new(),
            tool,
            timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.tools.mixing.clone(),
            config.timeouts.for_stage(StageId::Mixing),
        )
    }

    pub fn filter_graph(request: &MixRequest) -> String {
        format!(
            "[0:a]volume={}[a1];[1:a]volume={}[a2];[a1][a2]amix=inputs=2:duration={}",
            request.vocal_gain,
            request.backing_gain,
            request.duration.as_str()
        )
    }

    pub fn command(&self, request: &MixRequest) -> CommandSpec {
        CommandSpec::new(&self.tool.program)
            .arg("-y")
            .arg("-i")
            .arg(&request.vocal)
            .arg("-i")
            .arg(&request.backing)
            .arg("-filter_complex")
            .arg(Self::filter_graph(request))
            .arg(&request.output)
    }
}

#[async_trait]
impl Mixer for FfmpegMixer {
    async fn mix(&self, request: &MixRequest) -> Result<StageReport<PathBuf>> {
        let spec = self.command(request);
        let work_dir = request
            .output
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        info!("Mixing {} over {}", request.vocal.display(), request.backing.display());

        match self
            .executor
            .run_expecting(
                StageId::Mixing,
                &spec,
                &work_dir,
                self.timeout,
                std::slice::from_ref(&request.output),
            )
            .await
        {
            StageOutcome::Success(run) => {
                Ok(StageReport::new(request.output.clone()).with_log(run.transcript()))
            }
            StageOutcome::Failure(failure) => Err(failure.into_error()),
        }
    }
}
