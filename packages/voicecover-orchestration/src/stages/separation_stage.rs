use super::{Separator, StageReport};
use crate::config::{PipelineConfig, SeparationToolConfig};
use crate::error::{PipelineError, Result};
use crate::executor::{CommandSpec, StageExecutor, StageOutcome};
use crate::job::StageId;
use crate::stems::is_audio_file;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Source separation through the `audio-separator` CLI
pub struct AudioSeparator {
    executor: StageExecutor,
    tool: SeparationToolConfig,
    timeout: Duration,
}

impl AudioSeparator {
    pub fn new(tool: SeparationToolConfig, timeout: Duration) -> Self {
        Self {
            executor: StageExecutor::new(),
            tool,
            timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.tools.separation.clone(),
            config.timeouts.for_stage(StageId::Separation),
        )
    }

    pub fn command(&self, audio: &Path, out_dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.tool.program)
            .arg(audio)
            .arg("--model_filename")
            .arg(&self.tool.model_filename)
            .arg("--output_dir")
            .arg(out_dir)
            .args(&self.tool.extra_args)
    }
}

#[async_trait]
impl Separator for AudioSeparator {
    async fn separate(&self, audio: &Path, out_dir: &Path) -> Result<StageReport<Vec<PathBuf>>> {
        tokio::fs::create_dir_all(out_dir).await?;
        let before = list_audio(out_dir).await?;

        let spec = self.command(audio, out_dir);
        let outcome = self
            .executor
            .run(StageId::Separation, &spec, out_dir, self.timeout)
            .await;
        let run = match outcome {
            StageOutcome::Success(run) => run,
            StageOutcome::Failure(failure) => return Err(failure.into_error()),
        };
        let log = run.transcript();

        let before: HashSet<PathBuf> = before.into_iter().collect();
        let mut stems = Vec::new();
        for path in list_audio(out_dir).await? {
            if before.contains(&path) {
                continue;
            }
            let len = tokio::fs::metadata(&path).await?.len();
            if len == 0 {
                warn!("Separator wrote empty stem {}, ignoring", path.display());
                continue;
            }
            stems.push(path);
        }

        if stems.is_empty() {
            return Err(PipelineError::MissingOutput {
                stage: StageId::Separation,
                path: out_dir.display().to_string(),
                diagnostic: format!("no stems written to {}\n{}", out_dir.display(), log),
            });
        }

        info!("Separator produced {} stems", stems.len());
        Ok(StageReport::new(stems).with_log(log))
    }
}

async fn list_audio(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_audio_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
