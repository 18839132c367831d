use super::{ConversionRequest, Converter, StageReport};
use crate::config::{ConversionToolConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::executor::{CommandSpec, FailureKind, StageExecutor, StageOutcome};
use crate::job::StageId;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Voice conversion through the RVC inference CLI.
///
/// The model is looked up by file name inside `weight_root`, so the weights
/// directory is passed through the environment and the script runs from the
/// codebase root.
pub struct RvcConverter {
    executor: StageExecutor,
    tool: ConversionToolConfig,
    timeout: Duration,
}

impl RvcConverter {
    pub fn new(tool: ConversionToolConfig, timeout: Duration) -> Self {
        Self {
            executor: StageExecutor::new(),
            tool,
            timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.tools.conversion.clone(),
            config.timeouts.for_stage(StageId::Conversion),
        )
    }

    pub fn command(&self, request: &ConversionRequest) -> Result<CommandSpec> {
        let model_name = request
            .weights
            .file_name()
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "weights path has no file name: {}",
                    request.weights.display()
                ))
            })?
            .to_os_string();
        let weight_root = request
            .weights
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default();

        Ok(CommandSpec::new(&self.tool.program)
            .arg(request.codebase.join(&self.tool.script))
            .arg("--f0up_key")
            .arg(request.pitch_shift.to_string())
            .arg("--input_path")
            .arg(&request.vocal)
            .arg("--index_path")
            .arg(&request.index)
            .arg("--opt_path")
            .arg(&request.output)
            .arg("--model_name")
            .arg(model_name)
            .args(&self.tool.extra_args)
            .env("weight_root", weight_root))
    }
}

#[async_trait]
impl Converter for RvcConverter {
    async fn convert(&self, request: &ConversionRequest) -> Result<StageReport<PathBuf>> {
        let spec = self.command(request)?;
        info!(
            "Converting {} with pitch shift {}",
            request.vocal.display(),
            request.pitch_shift
        );

        let outcome = self
            .executor
            .run_expecting(
                StageId::Conversion,
                &spec,
                &request.codebase,
                self.timeout,
                std::slice::from_ref(&request.output),
            )
            .await;

        match outcome {
            StageOutcome::Success(run) => {
                Ok(StageReport::new(request.output.clone()).with_log(run.transcript()))
            }
            StageOutcome::Failure(failure) => match failure.kind {
                FailureKind::Launch | FailureKind::Exit(_) => Err(PipelineError::ToolInvocation {
                    stage: StageId::Conversion,
                    diagnostic: format!("voice conversion failed: {}", failure.diagnostic),
                }),
                _ => Err(failure.into_error()),
            },
        }
    }
}
