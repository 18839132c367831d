/*
 * voicecover-worker
 *
 * Reads one JSON job request per stdin line and writes one JSON job result
 * per stdout line. Logs go to stderr.
 *
 * Usage:
 *   voicecover-worker --config pipeline.yaml < requests.jsonl
 *   voicecover-worker --request '{"source_audio_reference":"https://...","pitch_shift":2}'
 */

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;
use voicecover_orchestration::{
    ErrorKind, JobRequest, JobResult, PipelineConfig, PipelineOrchestrator, StageId,
};

#[derive(Parser, Debug)]
#[clap(name = "voicecover-worker")]
#[clap(about = "Run AI cover jobs: separation, voice conversion, mixing and upload")]
struct Args {
    /// Pipeline configuration (YAML); built-in defaults when omitted
    #[clap(long, env = "VOICECOVER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Process a single request instead of reading stdin
    #[clap(long, value_name = "JSON")]
    request: Option<String>,

    /// Do not provision assets before the first job
    #[clap(long)]
    skip_warm_up: bool,

    /// Print the effective configuration as YAML and exit
    #[clap(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::from_yaml(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();
    config.validate().context("invalid configuration")?;

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    let orchestrator = Arc::new(
        PipelineOrchestrator::production(Arc::new(config))
            .context("building pipeline")?,
    );

    if !args.skip_warm_up {
        // Jobs provision lazily, so a failed warm-up only delays the error
        if let Err(e) = orchestrator.warm_up().await {
            warn!("Asset warm-up failed: {}", e);
        }
    }

    if let Some(line) = args.request {
        let result = handle_line(&orchestrator, &line).await;
        write_result(&mut tokio::io::stdout(), &result).await?;
        return Ok(());
    }

    info!(
        "Accepting requests on stdin (max {} concurrent jobs)",
        orchestrator.config().max_concurrent_jobs
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<JobResult>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(result) = rx.recv().await {
            if let Err(e) = write_result(&mut stdout, &result).await {
                error!("Failed to write result for job {}: {}", result.job_id, e);
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut jobs = JoinSet::new();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let orchestrator = orchestrator.clone();
                    let tx = tx.clone();
                    jobs.spawn(async move {
                        let result = handle_line(&orchestrator, &line).await;
                        let _ = tx.send(result);
                    });
                }
                None => stdin_open = false,
            },
            Some(finished) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(e) = finished {
                    error!("Job task aborted: {}", e);
                }
            }
            else => break,
        }
    }
    drop(tx);

    writer.await?;
    Ok(())
}

async fn handle_line(orchestrator: &PipelineOrchestrator, line: &str) -> JobResult {
    match serde_json::from_str::<JobRequest>(line) {
        Ok(request) => orchestrator.execute_job(request).await,
        Err(e) => {
            warn!("Unparseable request: {}", e);
            JobResult::error(
                Uuid::new_v4(),
                StageId::Request,
                ErrorKind::RequestValidation,
                format!("Invalid request: {}", e),
                Vec::new(),
                0,
            )
        }
    }
}

async fn write_result(stdout: &mut tokio::io::Stdout, result: &JobResult) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(result)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}
