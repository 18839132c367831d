//! Asset provisioning (model weights, index files, tool codebases)
//!
//! An asset is either absent or present-and-verified. Presence is proven by a
//! canonical marker: a non-empty file (optionally matching a SHA-256 digest)
//! for weights/index, or a known entry-point file inside the directory for a
//! codebase. Anything else at the canonical path is treated as corrupt, removed
//! and provisioned again.
//!
//! Acquisition always lands in a sibling `*.partial-<uuid>` path first and is
//! renamed into place once complete, so readers never observe a half-written
//! asset. Provisioning of one asset is serialized by a per-asset async mutex.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Asset kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    ModelWeights,
    IndexFile,
    ToolCodebase,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::ModelWeights => "model_weights",
            AssetKind::IndexFile => "index_file",
            AssetKind::ToolCodebase => "tool_codebase",
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, AssetKind::ToolCodebase)
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an asset comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetSource {
    /// Remote file fetched over HTTP(S)
    Http { url: String },
    /// Source-control clone, optionally pinned to a revision
    Git {
        url: String,
        #[serde(default)]
        rev: Option<String>,
    },
    /// Shipped alongside the deployment; never fetched
    PreStaged,
}

/// Declared asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetSpec {
    pub kind: AssetKind,
    /// Logical name (cache key together with `kind`)
    pub name: String,
    /// Canonical on-disk location
    pub path: PathBuf,
    pub source: AssetSource,
    /// Codebase marker, relative to `path`
    #[serde(default)]
    pub entry_point: Option<PathBuf>,
    /// Expected hex digest for file assets
    #[serde(default)]
    pub sha256: Option<String>,
}

impl AssetSpec {
    pub fn key(&self) -> AssetKey {
        AssetKey {
            kind: self.kind,
            name: self.name.clone(),
        }
    }

    /// Path whose presence proves a completed provisioning
    pub fn marker_path(&self) -> PathBuf {
        match (&self.entry_point, self.kind.is_directory()) {
            (Some(entry), true) => self.path.join(entry),
            _ => self.path.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PipelineError::config("asset name must not be empty"));
        }

        match (self.kind.is_directory(), &self.source) {
            (true, AssetSource::Http { .. }) => {
                return Err(PipelineError::config(format!(
                    "codebase '{}' must come from git or be pre-staged",
                    self.name
                )))
            }
            (false, AssetSource::Git { .. }) => {
                return Err(PipelineError::config(format!(
                    "file asset '{}' cannot be cloned from git",
                    self.name
                )))
            }
            _ => {}
        }

        if self.kind.is_directory() {
            match &self.entry_point {
                Some(entry) if !entry.as_os_str().is_empty() && entry.is_relative() => {}
                _ => {
                    return Err(PipelineError::config(format!(
                        "codebase '{}' needs a relative entry_point marker",
                        self.name
                    )))
                }
            }
        }

        if let Some(digest) = &self.sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(PipelineError::config(format!(
                    "asset '{}' sha256 must be 64 hex characters",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Cache key: (kind, logical name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetKey {
    pub kind: AssetKind,
    pub name: String,
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// What the canonical path currently holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetStatus {
    Present,
    Absent,
    Corrupt(String),
}

/// Proof that an asset is usable at `path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    pub key: AssetKey,
    pub path: PathBuf,
    /// False when the asset was already cached
    pub provisioned: bool,
}

/// Network side of provisioning
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Download `url` into `dest` (a fresh file), returning the byte count
    async fn fetch_file(&self, url: &str, dest: &Path) -> Result<u64>;

    /// Clone `url` into `dest` (a fresh directory)
    async fn clone_repo(&self, url: &str, rev: Option<&str>, dest: &Path) -> Result<()>;
}

/// HTTP (reqwest) + git (git2) fetcher
#[derive(Clone)]
pub struct NetworkFetcher {
    http: reqwest::Client,
}

impl NetworkFetcher {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("voicecover/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl AssetFetcher for NetworkFetcher {
    async fn fetch_file(&self, url: &str, dest: &Path) -> Result<u64> {
        info!("Downloading {} to {}", url, dest.display());

        let mut response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::asset(
                url,
                format!("HTTP {}: {}", status, body.trim()),
            ));
        }

        let content_length = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = content_length {
            if downloaded != expected {
                return Err(PipelineError::asset(
                    url,
                    format!(
                        "download incomplete: expected {} bytes, got {}",
                        expected, downloaded
                    ),
                ));
            }
        }

        debug!("Downloaded {} bytes from {}", downloaded, url);
        Ok(downloaded)
    }

    async fn clone_repo(&self, url: &str, rev: Option<&str>, dest: &Path) -> Result<()> {
        info!("Cloning {} into {}", url, dest.display());

        let url = url.to_string();
        let rev = rev.map(str::to_string);
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = git2::build::RepoBuilder::new().clone(&url, &dest)?;
            if let Some(rev) = rev {
                let target = repo.revparse_single(&rev)?;
                repo.checkout_tree(&target, None)?;
                repo.set_head_detached(target.peel_to_commit()?.id())?;
            }
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::asset("git clone", format!("clone task panicked: {}", e)))?
    }
}

/// Removes a partial acquisition unless it was moved into place
struct PartialPath {
    path: PathBuf,
    armed: bool,
}

impl PartialPath {
    fn new(canonical: &Path) -> Self {
        let file_name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "asset".to_string());
        let path = canonical.with_file_name(format!(".{}.partial-{}", file_name, Uuid::new_v4()));
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialPath {
    fn drop(&mut self) {
        if self.armed {
            remove_path_sync(&self.path);
        }
    }
}

fn remove_path_sync(path: &Path) {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            let _ = std::fs::remove_dir_all(path);
        }
        Ok(_) => {
            let _ = std::fs::remove_file(path);
        }
        Err(_) => {}
    }
}

/// Process-wide asset cache
pub struct AssetProvisioner {
    fetcher: Arc<dyn AssetFetcher>,
    locks: DashMap<AssetKey, Arc<tokio::sync::Mutex<()>>>,
}

impl AssetProvisioner {
    pub fn new(fetcher: Arc<dyn AssetFetcher>) -> Self {
        Self {
            fetcher,
            locks: DashMap::new(),
        }
    }

    pub fn with_network() -> Result<Self> {
        Ok(Self::new(Arc::new(NetworkFetcher::new()?)))
    }

    fn lock_for(&self, key: &AssetKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Make sure every asset is usable, in order; the first failure aborts
    pub async fn ensure_all(&self, specs: &[AssetSpec]) -> Result<Vec<AssetHandle>> {
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            handles.push(self.ensure(spec).await?);
        }
        Ok(handles)
    }

    /// Idempotent: a verified asset is returned without touching the network
    pub async fn ensure(&self, spec: &AssetSpec) -> Result<AssetHandle> {
        spec.validate()?;
        let key = spec.key();
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        match Self::inspect(spec).await? {
            AssetStatus::Present => {
                debug!("Asset {} present at {}", key, spec.path.display());
                return Ok(AssetHandle {
                    key,
                    path: spec.path.clone(),
                    provisioned: false,
                });
            }
            AssetStatus::Corrupt(reason) => {
                if spec.source == AssetSource::PreStaged {
                    return Err(PipelineError::asset(
                        &key,
                        format!(
                            "pre-staged asset at {} is unusable: {}",
                            spec.path.display(),
                            reason
                        ),
                    ));
                }
                warn!(
                    "Asset {} at {} is corrupt ({}), re-provisioning",
                    key,
                    spec.path.display(),
                    reason
                );
                Self::remove_path(&spec.path).await?;
            }
            AssetStatus::Absent => {
                if spec.source == AssetSource::PreStaged {
                    return Err(PipelineError::asset(
                        &key,
                        format!("pre-staged asset missing at {}", spec.path.display()),
                    ));
                }
                info!("Asset {} not cached, provisioning", key);
            }
        }

        self.acquire(spec).await.map_err(|e| match e {
            PipelineError::AssetProvisioning { .. } => e,
            other => PipelineError::asset(&key, other),
        })?;

        info!("Asset {} ready at {}", key, spec.path.display());
        Ok(AssetHandle {
            key,
            path: spec.path.clone(),
            provisioned: true,
        })
    }

    /// Check the canonical marker without modifying anything
    pub async fn status(&self, spec: &AssetSpec) -> Result<AssetStatus> {
        Self::inspect(spec).await
    }

    async fn inspect(spec: &AssetSpec) -> Result<AssetStatus> {
        let meta = match tokio::fs::symlink_metadata(&spec.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AssetStatus::Absent),
            Err(e) => return Err(e.into()),
        };

        if spec.kind.is_directory() {
            if !meta.is_dir() {
                return Ok(AssetStatus::Corrupt("expected a directory".to_string()));
            }
            let marker = spec.marker_path();
            return Ok(match tokio::fs::metadata(&marker).await {
                Ok(m) if m.is_file() => AssetStatus::Present,
                _ => AssetStatus::Corrupt(format!("entry point {} missing", marker.display())),
            });
        }

        if !meta.is_file() {
            return Ok(AssetStatus::Corrupt("expected a regular file".to_string()));
        }
        if meta.len() == 0 {
            return Ok(AssetStatus::Corrupt("file is empty".to_string()));
        }

        if let Some(expected) = &spec.sha256 {
            let actual = sha256_file(&spec.path).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Ok(AssetStatus::Corrupt(format!(
                    "sha256 mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        Ok(AssetStatus::Present)
    }

    async fn acquire(&self, spec: &AssetSpec) -> Result<()> {
        let key = spec.key();
        if let Some(parent) = spec.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut partial = PartialPath::new(&spec.path);

        match &spec.source {
            AssetSource::Http { url } => {
                let bytes = self.fetcher.fetch_file(url, &partial.path).await?;
                if bytes == 0 {
                    return Err(PipelineError::asset(&key, format!("{} returned no data", url)));
                }
                if let Some(expected) = &spec.sha256 {
                    let actual = sha256_file(&partial.path).await?;
                    if !actual.eq_ignore_ascii_case(expected) {
                        return Err(PipelineError::asset(
                            &key,
                            format!("sha256 mismatch: expected {}, got {}", expected, actual),
                        ));
                    }
                }
            }
            AssetSource::Git { url, rev } => {
                self.fetcher
                    .clone_repo(url, rev.as_deref(), &partial.path)
                    .await?;
                if let Some(entry) = &spec.entry_point {
                    if !partial.path.join(entry).is_file() {
                        return Err(PipelineError::asset(
                            &key,
                            format!("clone of {} has no {}", url, entry.display()),
                        ));
                    }
                }
            }
            AssetSource::PreStaged => {
                return Err(PipelineError::asset(&key, "pre-staged assets cannot be fetched"));
            }
        }

        tokio::fs::rename(&partial.path, &spec.path).await?;
        partial.disarm();
        Ok(())
    }

    async fn remove_path(path: &Path) -> Result<()> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect())
    })
    .await
    .map_err(|e| PipelineError::asset("sha256", e))?
}
