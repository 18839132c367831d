use super::SourceFetcher;
use crate::error::{PipelineError, Result};
use crate::job::StageId;
use async_trait::async_trait;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const SOURCE_STEM: &str = "input_song";
const DEFAULT_EXTENSION: &str = "mp3";

/// Download stage: http(s) via reqwest, file:// via copy when allowed
pub struct HttpSourceFetcher {
    http: reqwest::Client,
    allow_local: bool,
}

impl HttpSourceFetcher {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("voicecover/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            allow_local: false,
        }
    }

    pub fn allow_local_files(mut self, allow: bool) -> Self {
        self.allow_local = allow;
        self
    }

    async fn download(&self, url: &Url, dest: &Path) -> Result<u64> {
        let mut response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| failure(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failure(format!("HTTP {} from {}: {}", status, url, body.trim())));
        }

        let expected = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| failure(format!("download of {} interrupted: {}", url, e)))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(failure(format!(
                    "download of {} incomplete: expected {} bytes, got {}",
                    url, expected, written
                )));
            }
        }
        Ok(written)
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, reference: &str, dest_dir: &Path) -> Result<PathBuf> {
        let url = Url::parse(reference.trim()).map_err(|e| {
            PipelineError::RequestValidation(format!("invalid source reference {}: {}", reference, e))
        })?;
        let dest = dest_dir.join(format!("{}.{}", SOURCE_STEM, source_extension(&url)));
        info!("Fetching source audio {} into {}", url, dest.display());

        let bytes = match url.scheme() {
            "file" if !self.allow_local => {
                return Err(PipelineError::RequestValidation(format!(
                    "local file sources are disabled: {}",
                    url
                )))
            }
            "file" => {
                let src = url
                    .to_file_path()
                    .map_err(|_| failure(format!("not a local path: {}", url)))?;
                tokio::fs::copy(&src, &dest)
                    .await
                    .map_err(|e| failure(format!("cannot read {}: {}", src.display(), e)))?
            }
            "http" | "https" => self.download(&url, &dest).await?,
            other => {
                return Err(PipelineError::RequestValidation(format!(
                    "unsupported source scheme: {}",
                    other
                )))
            }
        };

        if bytes == 0 {
            return Err(failure(format!("source audio {} is empty", url)));
        }
        debug!("Fetched {} bytes", bytes);
        Ok(dest)
    }
}

/// Audio extension from the URI path, `mp3` when absent or unusable
pub fn source_extension(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

fn failure(diagnostic: String) -> PipelineError {
    PipelineError::ToolInvocation {
        stage: StageId::Download,
        diagnostic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_source_extension() {
        let ext = |s: &str| source_extension(&Url::parse(s).unwrap());
        assert_eq!(ext("https://cdn.example.com/track.WAV"), "wav");
        assert_eq!(ext("https://cdn.example.com/track.flac?sig=abc"), "flac");
        assert_eq!(ext("https://cdn.example.com/stream"), "mp3");
        assert_eq!(ext("https://cdn.example.com/"), "mp3");
        assert_eq!(ext("https://cdn.example.com/a.b.c-d%20e"), "mp3");
    }

    #[tokio::test]
    async fn test_file_reference_copied_under_canonical_name() {
        let src_dir = TempDir::new().unwrap();
        let job_dir = TempDir::new().unwrap();
        let src = src_dir.path().join("My Song.wav");
        std::fs::write(&src, b"RIFF....WAVE").unwrap();
        let reference = Url::from_file_path(&src).unwrap().to_string();

        let fetcher = HttpSourceFetcher::with_client(reqwest::Client::new()).allow_local_files(true);
        let path = fetcher.fetch(&reference, job_dir.path()).await.unwrap();

        assert_eq!(path, job_dir.path().join("input_song.wav"));
        assert_eq!(std::fs::read(&path).unwrap(), b"RIFF....WAVE");
    }

    #[tokio::test]
    async fn test_missing_file_is_download_failure() {
        let job_dir = TempDir::new().unwrap();
        let fetcher = HttpSourceFetcher::with_client(reqwest::Client::new()).allow_local_files(true);
        let err = fetcher
            .fetch("file:///nonexistent/voicecover/song.mp3", job_dir.path())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ToolInvocation);
        assert_eq!(err.stage(), Some(StageId::Download));
    }

    #[tokio::test]
    async fn test_empty_source_rejected() {
        let src_dir = TempDir::new().unwrap();
        let job_dir = TempDir::new().unwrap();
        let src = src_dir.path().join("silence.mp3");
        std::fs::write(&src, b"").unwrap();
        let reference = Url::from_file_path(&src).unwrap().to_string();

        let fetcher = HttpSourceFetcher::with_client(reqwest::Client::new()).allow_local_files(true);
        assert!(fetcher.fetch(&reference, job_dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_local_file_refused_by_default() {
        let src_dir = TempDir::new().unwrap();
        let job_dir = TempDir::new().unwrap();
        let src = src_dir.path().join("secrets.mp3");
        std::fs::write(&src, b"private").unwrap();
        let reference = Url::from_file_path(&src).unwrap().to_string();

        let fetcher = HttpSourceFetcher::with_client(reqwest::Client::new());
        let err = fetcher.fetch(&reference, job_dir.path()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RequestValidation);
        assert!(!job_dir.path().join("input_song.mp3").exists());
    }
}
