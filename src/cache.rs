//! On-disk weight cache for downloaded models
//!
//! Layout, keyed by model id and precision:
//!
//! ```text
//! <cache_dir>/<model_id>/<fp32|fp16>/model.onnx
//! <cache_dir>/<model_id>/<fp32|fp16>/model.sha256
//! ```
//!
//! The sidecar records the SHA-256 digest of the stored weights. An entry only
//! counts as cached when both files are present.

use crate::config::Precision;
use crate::error::{BgServeError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "BGREMOVE_CACHE_DIR";

/// Weight file name inside an entry
pub const WEIGHTS_FILE: &str = "model.onnx";

/// Digest sidecar name inside an entry
pub const DIGEST_FILE: &str = "model.sha256";

/// Information about a cached model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedModelInfo {
    pub model_id: String,
    pub path: PathBuf,
    /// Precisions with complete entries
    pub precisions: Vec<Precision>,
    /// Total size of the model directory in bytes
    pub size_bytes: u64,
}

/// Model cache manager
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a cache at the default location
    ///
    /// # Errors
    /// - Failed to determine cache directory
    /// - Failed to create cache directory
    pub fn new() -> Result<Self> {
        Self::with_cache_dir(&Self::default_cache_dir()?)
    }

    /// Create a cache rooted at `cache_dir`, creating it if needed
    ///
    /// # Errors
    /// - Failed to create cache directory
    pub fn with_cache_dir(cache_dir: &Path) -> Result<Self> {
        if !cache_dir.exists() {
            fs::create_dir_all(cache_dir).map_err(|e| {
                BgServeError::file_io_error("create cache directory", cache_dir, &e)
            })?;
        }
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    /// Default cache root
    ///
    /// `$BGREMOVE_CACHE_DIR` when set, otherwise the XDG cache directory:
    /// - Linux: `~/.cache/bgremove-serve/models/`
    /// - macOS: `~/Library/Caches/bgremove-serve/models/`
    /// - Windows: `%LOCALAPPDATA%/bgremove-serve/models/`
    ///
    /// # Errors
    /// - Failed to determine user cache directory
    pub fn default_cache_dir() -> Result<PathBuf> {
        if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
            if !cache_override.trim().is_empty() {
                return Ok(PathBuf::from(cache_override));
            }
        }

        Ok(dirs::cache_dir()
            .ok_or_else(|| {
                BgServeError::invalid_config(format!(
                    "Failed to determine cache directory. Set {CACHE_DIR_ENV} environment variable."
                ))
            })?
            .join("bgremove-serve")
            .join("models"))
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory holding one model at one precision
    #[must_use]
    pub fn entry_dir(&self, model_id: &str, precision: Precision) -> PathBuf {
        self.cache_dir.join(model_id).join(precision.as_str())
    }

    /// Path of the weight file for an entry (may not exist)
    #[must_use]
    pub fn model_path(&self, model_id: &str, precision: Precision) -> PathBuf {
        self.entry_dir(model_id, precision).join(WEIGHTS_FILE)
    }

    fn digest_path(&self, model_id: &str, precision: Precision) -> PathBuf {
        self.entry_dir(model_id, precision).join(DIGEST_FILE)
    }

    /// Whether both the weights and their digest are present
    #[must_use]
    pub fn is_cached(&self, model_id: &str, precision: Precision) -> bool {
        self.model_path(model_id, precision).is_file()
            && self.digest_path(model_id, precision).is_file()
    }

    /// Record the digest of freshly stored weights
    ///
    /// # Errors
    /// - Failed to write the sidecar file
    pub fn store_digest(&self, model_id: &str, precision: Precision, digest: &str) -> Result<()> {
        let path = self.digest_path(model_id, precision);
        fs::write(&path, format!("{digest}\n"))
            .map_err(|e| BgServeError::file_io_error("write digest file", &path, &e))
    }

    /// Digest recorded for an entry, if any
    ///
    /// # Errors
    /// - Sidecar exists but cannot be read
    pub fn recorded_digest(&self, model_id: &str, precision: Precision) -> Result<Option<String>> {
        let path = self.digest_path(model_id, precision);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| BgServeError::file_io_error("read digest file", &path, &e))?;
        Ok(Some(content.trim().to_string()))
    }

    /// Re-hash stored weights and compare against the recorded digest
    ///
    /// Returns `false` for missing entries and digest mismatches.
    ///
    /// # Errors
    /// - I/O errors while reading the weights
    pub fn verify(&self, model_id: &str, precision: Precision) -> Result<bool> {
        let Some(expected) = self.recorded_digest(model_id, precision)? else {
            return Ok(false);
        };
        let weights = self.model_path(model_id, precision);
        if !weights.is_file() {
            return Ok(false);
        }

        let actual = sha256_file(&weights)?;
        if actual == expected {
            Ok(true)
        } else {
            log::warn!(
                "File integrity check failed for {}: expected {}, got {}",
                weights.display(),
                expected,
                actual
            );
            Ok(false)
        }
    }

    /// Remove every cached precision of a model
    ///
    /// Returns `true` if anything was removed.
    ///
    /// # Errors
    /// - Failed to remove model directory
    pub fn clear_model(&self, model_id: &str) -> Result<bool> {
        let model_dir = self.cache_dir.join(model_id);
        if !model_dir.exists() {
            return Ok(false);
        }

        log::info!("Removing cached model: {}", model_id);
        fs::remove_dir_all(&model_dir).map_err(|e| {
            BgServeError::file_io_error("remove cached model directory", &model_dir, &e)
        })?;
        Ok(true)
    }

    /// Scan the cache and describe every model with at least one complete entry
    ///
    /// # Errors
    /// - Failed to read cache directory
    pub fn scan(&self) -> Result<Vec<CachedModelInfo>> {
        let mut models = Vec::new();

        if !self.cache_dir.exists() {
            return Ok(models);
        }

        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            BgServeError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(model_id) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            let precisions: Vec<Precision> = [Precision::Full, Precision::Half]
                .into_iter()
                .filter(|precision| self.is_cached(model_id, *precision))
                .collect();
            if precisions.is_empty() {
                log::debug!("Skipping incomplete model directory: {}", path.display());
                continue;
            }

            models.push(CachedModelInfo {
                model_id: model_id.to_string(),
                size_bytes: Self::calculate_directory_size(&path).unwrap_or(0),
                path,
                precisions,
            });
        }

        // Sort by model ID for consistent output
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    /// Calculate the total size of a directory
    fn calculate_directory_size(dir_path: &Path) -> Result<u64> {
        let mut total_size = 0;

        Self::visit_dir(dir_path, &mut total_size)
            .map_err(|e| BgServeError::file_io_error("calculate directory size", dir_path, &e))?;

        Ok(total_size)
    }

    /// Recursively visit directory and accumulate file sizes
    fn visit_dir(dir: &Path, total: &mut u64) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::visit_dir(&path, total)?;
            } else {
                *total += entry.metadata()?.len();
            }
        }
        Ok(())
    }
}

/// Hex-encoded SHA-256 of a file, read in chunks
///
/// # Errors
/// - Failed to open or read the file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| BgServeError::file_io_error("open file for verification", path, &e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| BgServeError::file_io_error("read file for verification", path, &e))?;
        if read == 0 {
            break;
        }
        hasher.update(buffer.get(..read).unwrap_or(&[]));
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Format file size in human-readable format
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS.get(unit_index).unwrap_or(&"B"))
    } else {
        format!("{:.1} {}", size, UNITS.get(unit_index).unwrap_or(&"B"))
    }
}
