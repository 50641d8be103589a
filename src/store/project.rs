/*!
Project sources.

`DirProjectStore` layout under its root:
- `archives/<project_id>.zip`: uploaded submission
- `extracted/<project_id>/`: unpacked tree, bound into the container at the mount point

Extraction happens at most once per project; a `.sandterm-extracted` marker records
completion. A directory provisioned without an archive is used as-is.
*/

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::util::validate_resource_id;

const MARKER: &str = ".sandterm-extracted";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("invalid project id: {0}")]
    InvalidId(String),
    #[error("project {0} has no uploaded archive")]
    ArchiveMissing(String),
    #[error("failed to extract project archive: {0}")]
    Archive(String),
    #[error("project io: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Host directory that holds (or will hold) the project's extracted tree.
    fn source_path(&self, project_id: &str) -> Result<PathBuf, ProjectError>;

    /// Make sure the tree exists on disk; returns the absolute host path to bind.
    async fn ensure_extracted(&self, project_id: &str) -> Result<PathBuf, ProjectError>;
}

#[derive(Debug)]
pub struct DirProjectStore {
    root: PathBuf,
    extracting: tokio::sync::Mutex<()>,
}

impl DirProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirProjectStore {
            root: root.into(),
            extracting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn archive_path(&self, project_id: &str) -> PathBuf {
        self.root.join("archives").join(format!("{project_id}.zip"))
    }

    fn check_id(project_id: &str) -> Result<(), ProjectError> {
        validate_resource_id(project_id, "project id").map_err(ProjectError::InvalidId)
    }
}

#[async_trait]
impl ProjectStore for DirProjectStore {
    fn source_path(&self, project_id: &str) -> Result<PathBuf, ProjectError> {
        Self::check_id(project_id)?;
        let p = self.root.join("extracted").join(project_id);
        if p.is_absolute() {
            Ok(p)
        } else {
            Ok(std::env::current_dir()?.join(p))
        }
    }

    async fn ensure_extracted(&self, project_id: &str) -> Result<PathBuf, ProjectError> {
        let target = self.source_path(project_id)?;
        if target.join(MARKER).is_file() {
            return Ok(target);
        }
        let _guard = self.extracting.lock().await;
        // Re-check: a concurrent caller may have finished while we waited.
        if target.join(MARKER).is_file() {
            return Ok(target);
        }
        let archive = self.archive_path(project_id);
        if !archive.is_file() {
            if target.is_dir() {
                return Ok(target);
            }
            return Err(ProjectError::ArchiveMissing(project_id.to_string()));
        }
        let t = target.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &t))
            .await
            .map_err(|e| ProjectError::Archive(format!("extraction task failed: {e}")))??;
        tracing::info!(project_id, path = %target.display(), "project extracted");
        Ok(target)
    }
}

/// Unpack into a sibling temp dir, then rename over `target` so a crash never leaves a
/// half-extracted tree with a marker.
fn extract_archive(archive: &Path, target: &Path) -> Result<(), ProjectError> {
    let parent = target
        .parent()
        .ok_or_else(|| ProjectError::Archive(format!("bad target {}", target.display())))?;
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)?;
    let file = fs::File::open(archive)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| ProjectError::Archive(e.to_string()))?;
    zip.extract(staging.path())
        .map_err(|e| ProjectError::Archive(e.to_string()))?;
    fs::write(staging.path().join(MARKER), b"")?;
    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    let staged = staging.into_path();
    fs::rename(&staged, target)?;
    Ok(())
}
