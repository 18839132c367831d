//! Result publication
//!
//! Uploads the final mix to a prioritized list of hosting backends. Each
//! backend declares how its response body carries the link; a 2xx response
//! without a usable link counts as a failure. With fallback enabled the
//! next backend is tried, and when every backend fails the error lists
//! each attempt's diagnostic.

use crate::config::{BackendConfig, PublisherConfig};
use crate::error::{PipelineError, Result};
use crate::executor::verify_artifact;
use crate::job::StageId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How a file is sent to a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadMethod {
    /// Raw body to `<url>/<file name>` (transfer.sh style)
    Put,
    /// multipart/form-data POST with the file under `field`
    Multipart { field: String },
}

/// How a backend reports the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Whole body (trimmed) is the link
    BareUrl { prefix: String },
    /// JSON object with a boolean success flag and a link field
    JsonFlag {
        success_field: String,
        link_field: String,
    },
}

impl ResponseFormat {
    /// Extract the link, or explain why the body is unusable
    pub fn extract_link(&self, body: &str) -> std::result::Result<String, String> {
        match self {
            ResponseFormat::BareUrl { prefix } => {
                let link = body.trim();
                if link.is_empty() {
                    return Err("empty response body".to_string());
                }
                if !link.starts_with(prefix.as_str()) || link.contains(char::is_whitespace) {
                    return Err(format!("response is not a link starting with {:?}", prefix));
                }
                Ok(link.to_string())
            }
            ResponseFormat::JsonFlag {
                success_field,
                link_field,
            } => {
                let value: serde_json::Value = serde_json::from_str(body)
                    .map_err(|e| format!("malformed JSON response: {}", e))?;
                let object = value
                    .as_object()
                    .ok_or_else(|| "JSON response is not an object".to_string())?;

                match object.get(success_field) {
                    Some(serde_json::Value::Bool(true)) => {}
                    other => {
                        return Err(format!(
                            "{} is {}",
                            success_field,
                            other.map(|v| v.to_string()).unwrap_or_else(|| "missing".to_string())
                        ))
                    }
                }

                match object.get(link_field).and_then(|v| v.as_str()) {
                    Some(link) if !link.trim().is_empty() => Ok(link.trim().to_string()),
                    _ => Err(format!("success reported without a usable {}", link_field)),
                }
            }
        }
    }
}

/// Raw backend response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: u16,
    pub body: String,
}

impl UploadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait UploadBackend: Send + Sync {
    async fn upload(&self, path: &Path) -> Result<UploadResponse>;
}

/// reqwest-backed upload
pub struct HttpUploadBackend {
    http: reqwest::Client,
    url: String,
    method: UploadMethod,
}

impl HttpUploadBackend {
    pub fn new(http: reqwest::Client, url: impl Into<String>, method: UploadMethod) -> Self {
        Self {
            http,
            url: url.into(),
            method,
        }
    }
}

#[async_trait]
impl UploadBackend for HttpUploadBackend {
    async fn upload(&self, path: &Path) -> Result<UploadResponse> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::config(format!("no file name in {}", path.display())))?;
        let data = tokio::fs::read(path).await?;

        let request = match &self.method {
            UploadMethod::Put => {
                let target = format!("{}/{}", self.url.trim_end_matches('/'), file_name);
                self.http.put(target).body(data)
            }
            UploadMethod::Multipart { field } => {
                let part = reqwest::multipart::Part::bytes(data).file_name(file_name);
                let form = reqwest::multipart::Form::new().part(field.clone(), part);
                self.http.post(&self.url).multipart(form)
            }
        };

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(UploadResponse { status, body })
    }
}

/// Hosted location of the final mix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedLink {
    pub url: String,
    pub backend: String,
    /// Retention caveat (expiry, single download)
    pub note: Option<String>,
}

struct BackendSlot {
    name: String,
    response: ResponseFormat,
    retention_note: Option<String>,
    backend: Arc<dyn UploadBackend>,
}

pub struct Publisher {
    slots: Vec<BackendSlot>,
    fallback: bool,
}

impl Publisher {
    pub fn new(fallback: bool) -> Self {
        Self {
            slots: Vec::new(),
            fallback,
        }
    }

    /// Append a backend; order of registration is priority order
    pub fn with_backend(
        mut self,
        name: impl Into<String>,
        response: ResponseFormat,
        retention_note: Option<String>,
        backend: Arc<dyn UploadBackend>,
    ) -> Self {
        self.slots.push(BackendSlot {
            name: name.into(),
            response,
            retention_note,
            backend,
        });
        self
    }

    /// HTTP backends from configuration
    pub fn from_config(config: &PublisherConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("voicecover/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        let mut publisher = Self::new(config.fallback);
        for BackendConfig {
            name,
            url,
            method,
            response,
            retention_note,
        } in &config.backends
        {
            let backend = HttpUploadBackend::new(http.clone(), url.clone(), method.clone());
            publisher = publisher.with_backend(
                name.clone(),
                response.clone(),
                retention_note.clone(),
                Arc::new(backend),
            );
        }
        Ok(publisher)
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    pub async fn publish(&self, path: &Path) -> Result<PublishedLink> {
        verify_artifact(StageId::Publish, path).await?;

        if self.slots.is_empty() {
            return Err(PipelineError::Publish {
                diagnostics: vec!["no upload backends configured".to_string()],
            });
        }

        let mut diagnostics = Vec::new();
        for slot in &self.slots {
            info!("Uploading {} to {}", path.display(), slot.name);

            match self.attempt(slot, path).await {
                Ok(url) => {
                    info!("Published to {}: {}", slot.name, url);
                    return Ok(PublishedLink {
                        url,
                        backend: slot.name.clone(),
                        note: slot.retention_note.clone(),
                    });
                }
                Err(diagnostic) => {
                    warn!("Upload to {} failed: {}", slot.name, diagnostic);
                    diagnostics.push(format!("{}: {}", slot.name, diagnostic));
                    if !self.fallback {
                        break;
                    }
                }
            }
        }

        Err(PipelineError::Publish { diagnostics })
    }

    async fn attempt(&self, slot: &BackendSlot, path: &Path) -> std::result::Result<String, String> {
        let response = slot.backend.upload(path).await.map_err(|e| e.to_string())?;
        if !response.is_success() {
            return Err(format!("HTTP {}: {}", response.status, response.body.trim()));
        }
        slot.response
            .extract_link(&response.body)
            .map_err(|reason| format!("{}: {}", reason, response.body.trim()))
    }
}
