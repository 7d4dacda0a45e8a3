//! Version manifest and its storage.
//!
//! The manifest records which model version is enabled and every version
//! that training has produced. Writers rewrite it wholesale inside the
//! critical section; readers load it without locking.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Result type for manifest operations.
pub type Result<T> = std::result::Result<T, ManifestError>;

/// Errors that can occur reading or writing the manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Evaluation scores attached to a trained version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub precision: f64,
    pub recall: f64,
}

/// Identifies a model version and how well it scored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version: Option<String>,
    pub scores: Option<Scores>,
}

impl VersionDescriptor {
    /// Descriptor carrying only a version id.
    pub fn named(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            scores: None,
        }
    }

    pub fn with_scores(mut self, precision: f64, recall: f64) -> Self {
        self.scores = Some(Scores { precision, recall });
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// Enabled version plus every available version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub enabled: VersionDescriptor,
    pub availables: Vec<VersionDescriptor>,
}

impl Manifest {
    /// Manifest whose only available version is also the enabled one.
    pub fn with_enabled(enabled: VersionDescriptor) -> Self {
        Self {
            availables: vec![enabled.clone()],
            enabled,
        }
    }

    pub fn find(&self, version: &str) -> Option<&VersionDescriptor> {
        self.availables.iter().find(|v| v.id() == Some(version))
    }

    /// Switch the enabled version. Returns the stored descriptor, or `None`
    /// (leaving the manifest untouched) if the version is not available.
    pub fn enable(&mut self, version: &str) -> Option<VersionDescriptor> {
        let target = self.find(version)?.clone();
        self.enabled = target.clone();
        Some(target)
    }
}

/// Durable home of the manifest.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn load(&self) -> Result<Manifest>;

    /// Replace the whole manifest.
    async fn store(&self, manifest: &Manifest) -> Result<()>;
}

/// Manifest kept as a pretty-printed JSON file.
///
/// Writes go to a sibling temp file that is renamed over the manifest, so
/// lock-free readers never observe a half-written file.
#[derive(Debug, Clone)]
pub struct FileManifestStore {
    path: PathBuf,
}

impl FileManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ManifestError {
        ManifestError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl ManifestStore for FileManifestStore {
    async fn load(&self) -> Result<Manifest> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn store(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        let staging = self.path.with_extension("json.tmp");

        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        debug!(
            path = %self.path.display(),
            availables = manifest.availables.len(),
            "Manifest written"
        );
        Ok(())
    }
}

/// In-process manifest shared by clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryManifestStore {
    manifest: Arc<RwLock<Manifest>>,
}

impl MemoryManifestStore {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest: Arc::new(RwLock::new(manifest)),
        }
    }
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn load(&self) -> Result<Manifest> {
        Ok(self.manifest.read().await.clone())
    }

    async fn store(&self, manifest: &Manifest) -> Result<()> {
        *self.manifest.write().await = manifest.clone();
        Ok(())
    }
}
