//! Model artifact acquisition: a zipped model directory fetched by file id
//! and unpacked under the model directory. A directory already on disk is
//! trusted as-is.

pub mod archive;
pub mod gdrive;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServeError;

pub use gdrive::DriveFetcher;

/// File every loadable model directory carries at its root.
pub const MODEL_MARKER_FILE: &str = "config.json";

/// Fetches the archive identified by `file_id` into `dest`.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, file_id: &str, dest: &Path) -> Result<u64>;
}

pub struct ArtifactStore {
    model_dir: PathBuf,
    model_name: String,
    file_id: Option<String>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl ArtifactStore {
    pub fn new(
        model_dir: impl Into<PathBuf>,
        model_name: impl Into<String>,
        file_id: Option<String>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            model_dir: model_dir.into(),
            model_name: model_name.into(),
            file_id,
            fetcher,
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_name)
    }

    pub fn is_present(&self) -> bool {
        self.model_path().exists()
    }

    /// Returns the directory to load from, downloading and unpacking the
    /// archive first when nothing is on disk yet.
    pub async fn ensure_present(&self) -> Result<PathBuf, ServeError> {
        let target = self.model_path();
        if self.is_present() {
            info!(path = %target.display(), "model found locally, skipping download");
            return Ok(resolve_model_root(&target));
        }

        let file_id = self.file_id.as_deref().ok_or(ServeError::ArtifactIdMissing)?;
        info!(path = %target.display(), "model not found locally, downloading");

        fs::create_dir_all(&self.model_dir).map_err(|e| {
            ServeError::Download(format!("cannot create {}: {e}", self.model_dir.display()))
        })?;

        let archive = self.model_dir.join(format!("{}.zip", self.model_name));
        let fetched = self.fetcher.fetch(file_id, &archive).await;
        if let Err(err) = fetched {
            remove_quietly(&archive);
            return Err(ServeError::Download(format!("{err:#}")));
        }

        let staging = self
            .model_dir
            .join(format!(".{}.{}.partial", self.model_name, Uuid::new_v4()));
        let unpacked = {
            let archive = archive.clone();
            let staging = staging.clone();
            let target = target.clone();
            tokio::task::spawn_blocking(move || unpack_into(&archive, &staging, &target))
                .await
                .map_err(|e| ServeError::Download(format!("extraction task failed: {e}")))?
        };

        remove_quietly(&archive);
        if let Err(err) = unpacked {
            let _ = fs::remove_dir_all(&staging);
            return Err(ServeError::Download(format!("{err:#}")));
        }

        info!(path = %target.display(), "model downloaded and extracted");
        Ok(resolve_model_root(&target))
    }
}

/// Extracts into a staging directory and renames it into place, so an
/// interrupted extraction never leaves a half-filled model directory.
fn unpack_into(archive: &Path, staging: &Path, target: &Path) -> Result<()> {
    let files = archive::extract_zip(archive, staging)?;
    info!(files, "extracting model files");
    fs::rename(staging, target).with_context(|| {
        format!("failed to move {} to {}", staging.display(), target.display())
    })?;
    Ok(())
}

/// Archives made by zipping a folder nest everything one level down.
/// Picks the directory that actually holds the model config.
pub fn resolve_model_root(dir: &Path) -> PathBuf {
    if dir.join(MODEL_MARKER_FILE).exists() {
        return dir.to_path_buf();
    }

    let subdirs = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    match subdirs.as_slice() {
        [only] if only.join(MODEL_MARKER_FILE).exists() => only.clone(),
        _ => dir.to_path_buf(),
    }
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(err) = fs::remove_file(path) {
            warn!(path = %path.display(), %err, "failed to remove archive");
        }
    }
}
