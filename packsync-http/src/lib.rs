//! Packsync HTTP/JSON binding
//!
//! Exposes the repository operations (list refs, upload/download pack,
//! submit ref updates, resolve delta chain, read the update log) over
//! HTTP/1.1 via hyper.

pub mod handlers;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::{Request, Response};
use packsync_core::{RepositoryRegistry, StorageBackend};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory holding one sub-directory per repository
    pub data_dir: PathBuf,
    /// Keep all state in memory (nothing survives restart)
    pub in_memory: bool,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            in_memory: false,
            max_body_size: 100 * 1024 * 1024, // 100 MB
        }
    }
}

impl Config {
    /// Load configuration from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: Config =
            toml::from_str(&data).with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    pub fn storage_backend(&self) -> StorageBackend {
        if self.in_memory {
            StorageBackend::Memory
        } else {
            StorageBackend::Disk(self.data_dir.clone())
        }
    }
}

/// Request handler shared by every connection
pub struct SyncHandler {
    config: Config,
    registry: Arc<RepositoryRegistry>,
}

impl SyncHandler {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(RepositoryRegistry::new(config.storage_backend()));
        Self { config, registry }
    }

    pub fn with_registry(config: Config, registry: Arc<RepositoryRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RepositoryRegistry> {
        &self.registry
    }

    /// Handle an incoming HTTP request
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, HttpError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().unwrap_or("").to_string();

        tracing::debug!("request: {} {}", parts.method, parts.uri);

        let declared = parts
            .headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.config.max_body_size) {
            return Ok(handlers::payload_too_large(self.config.max_body_size));
        }

        let body = match Limited::new(body, self.config.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                if e.is::<http_body_util::LengthLimitError>() {
                    return Ok(handlers::payload_too_large(self.config.max_body_size));
                }
                return Err(HttpError::Body(e.to_string()));
            }
        };

        Ok(handlers::dispatch(&self.registry, &parts.method, &path, &query, body).await)
    }
}

/// Transport-level errors (domain errors become JSON responses instead)
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Failed to read request body: {0}")]
    Body(String),
}
