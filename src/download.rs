//! Weight downloading from `HuggingFace` repositories
//!
//! [`ModelDownloader`] resolves a descriptor's weight source to a local file,
//! downloading it into the [`ModelCache`] on first use. Files are streamed
//! into a temporary file inside the entry directory, hashed on the fly and
//! atomically renamed into place before the digest sidecar is written.

use crate::cache::ModelCache;
use crate::config::Precision;
use crate::error::{BgServeError, Result};
use crate::models::ModelDescriptor;
use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

/// Default hub endpoint
pub const HUGGINGFACE_BASE_URL: &str = "https://huggingface.co";

/// Weights resolved to a local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWeights {
    pub path: PathBuf,
    /// Precision of the file actually resolved (may differ from the request)
    pub precision: Precision,
}

/// Resolves model weights to local files
///
/// Consulted by adapters while staging, before any accelerator work.
#[async_trait]
pub trait WeightProvider: Send + Sync + std::fmt::Debug {
    /// Return a local weight file for `descriptor` at (or below) `precision`
    ///
    /// # Errors
    /// - Descriptor has no weight source
    /// - Network or HTTP failures while downloading
    /// - File system errors while caching
    async fn fetch(
        &self,
        descriptor: &ModelDescriptor,
        precision: Precision,
    ) -> Result<ResolvedWeights>;
}

/// Model downloader backed by the on-disk cache
#[derive(Debug, Clone)]
pub struct ModelDownloader {
    client: Client,
    cache: ModelCache,
    base_url: String,
    verify_cached: bool,
}

impl ModelDownloader {
    /// Create a new model downloader
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new(cache: ModelCache) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(1800)) // multi-GB weights
            .build()
            .map_err(|e| BgServeError::network_error("Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            cache,
            base_url: HUGGINGFACE_BASE_URL.to_string(),
            verify_cached: false,
        })
    }

    /// Use a different hub endpoint (mirrors, tests)
    #[must_use]
    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Re-hash cached weights before every use
    #[must_use]
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_cached = verify;
        self
    }

    /// Get the model cache for other operations
    #[must_use]
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Download URL for a file in a repository
    #[must_use]
    pub fn file_url(&self, repo: &str, file: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, repo, file)
    }

    /// Download one file into the cache entry and record its digest
    async fn download_weights(
        &self,
        url: &str,
        model_id: &str,
        precision: Precision,
    ) -> Result<PathBuf> {
        let entry_dir = self.cache.entry_dir(model_id, precision);
        tokio::fs::create_dir_all(&entry_dir)
            .await
            .map_err(|e| BgServeError::file_io_error("create directory", &entry_dir, &e))?;
        let final_path = self.cache.model_path(model_id, precision);

        log::info!("Downloading {} weights ({}) from {}", model_id, precision, url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BgServeError::network_error(format!("Failed to download {url}"), e))?;

        if !response.status().is_success() {
            return Err(BgServeError::network_error(
                format!("HTTP error for {url}"),
                response.status(),
            ));
        }
        let total_size = response.content_length();

        // Removed automatically unless persisted
        let temp = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".part")
            .tempfile_in(&entry_dir)
            .map_err(|e| BgServeError::file_io_error("create temp file", &entry_dir, &e))?;
        let (std_file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;
        let mut buffer = vec![0; 64 * 1024];

        loop {
            let bytes_read = stream
                .read(&mut buffer)
                .await
                .map_err(|e| BgServeError::network_error("Failed to read download stream", e))?;

            if bytes_read == 0 {
                break; // EOF
            }

            let chunk = buffer.get(..bytes_read).unwrap_or(&[]);
            hasher.update(chunk);
            file.write_all(chunk)
                .await
                .map_err(|e| BgServeError::file_io_error("write to file", &temp_path, &e))?;
            downloaded += bytes_read as u64;
        }

        if let Some(total) = total_size {
            if downloaded != total {
                return Err(BgServeError::network_error(
                    format!("Truncated download from {url}"),
                    format!("expected {total} bytes, received {downloaded}"),
                ));
            }
        }

        file.flush()
            .await
            .map_err(|e| BgServeError::file_io_error("flush file", &temp_path, &e))?;
        file.sync_all()
            .await
            .map_err(|e| BgServeError::file_io_error("sync file", &temp_path, &e))?;
        drop(file);

        temp_path.persist(&final_path).map_err(|e| {
            BgServeError::file_io_error("move downloaded weights into cache", &final_path, &e.error)
        })?;

        let digest = format!("{:x}", hasher.finalize());
        self.cache.store_digest(model_id, precision, &digest)?;

        log::info!(
            "Downloaded {} ({}) to {}",
            model_id,
            crate::cache::format_size(downloaded),
            final_path.display()
        );
        Ok(final_path)
    }

    async fn cached_weights(&self, model_id: &str, precision: Precision) -> Result<Option<PathBuf>> {
        if !self.cache.is_cached(model_id, precision) {
            return Ok(None);
        }

        if self.verify_cached {
            let cache = self.cache.clone();
            let id = model_id.to_string();
            let valid = tokio::task::spawn_blocking(move || cache.verify(&id, precision))
                .await
                .map_err(|e| BgServeError::internal(format!("verification task failed: {e}")))??;
            if !valid {
                log::warn!("Cached weights for {} failed verification, re-downloading", model_id);
                self.cache.clear_model(model_id)?;
                return Ok(None);
            }
        }

        Ok(Some(self.cache.model_path(model_id, precision)))
    }
}

#[async_trait]
impl WeightProvider for ModelDownloader {
    async fn fetch(
        &self,
        descriptor: &ModelDescriptor,
        precision: Precision,
    ) -> Result<ResolvedWeights> {
        let source = descriptor.weights.as_ref().ok_or_else(|| {
            BgServeError::model_load_failed(&descriptor.id, "no weight source configured")
        })?;
        let (file, precision) = source.file_for(precision);

        if let Some(path) = self.cached_weights(&descriptor.id, precision).await? {
            log::debug!("Using cached weights: {}", path.display());
            return Ok(ResolvedWeights { path, precision });
        }

        let url = self.file_url(&source.repo, file);
        let path = self.download_weights(&url, &descriptor.id, precision).await?;
        Ok(ResolvedWeights { path, precision })
    }
}

/// Serves weights from fixed local files, for tests and air-gapped deployments
#[derive(Debug, Clone, Default)]
pub struct LocalWeights {
    files: std::collections::HashMap<String, PathBuf>,
}

impl LocalWeights {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a model id to a weight file
    #[must_use]
    pub fn with_file<S: Into<String>, P: AsRef<Path>>(mut self, model_id: S, path: P) -> Self {
        self.files.insert(model_id.into(), path.as_ref().to_path_buf());
        self
    }
}

#[async_trait]
impl WeightProvider for LocalWeights {
    async fn fetch(
        &self,
        descriptor: &ModelDescriptor,
        precision: Precision,
    ) -> Result<ResolvedWeights> {
        let path = self.files.get(&descriptor.id).ok_or_else(|| {
            BgServeError::model_load_failed(&descriptor.id, "no local weight file configured")
        })?;
        Ok(ResolvedWeights {
            path: path.clone(),
            precision: descriptor.variant.effective_precision(precision),
        })
    }
}
