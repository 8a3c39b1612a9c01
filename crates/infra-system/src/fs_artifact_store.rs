// Local filesystem ArtifactStore
//
// Layout under the root:
//   sources/<clip>/source
//   staging/<clip>.<attempt>.<uuid>/
//   outputs/<clip>/{manifest.mpd, init-*.m4s, chunk-*.m4s, thumbnail.jpg, artifacts.json}
//
// A staged directory becomes visible with a single rename into outputs/.

use async_trait::async_trait;
use clipcast_core::domain::{ArtifactSet, ClipId, TranscodeOutput};
use clipcast_core::port::{ArtifactStore, StagedEntry, StorageError};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

const SOURCES_DIR: &str = "sources";
const STAGING_DIR: &str = "staging";
const OUTPUTS_DIR: &str = "outputs";
const SOURCE_FILE: &str = "source";
pub const INDEX_FILE: &str = "artifacts.json";

/// Attempt number given to a replaced output set awaiting removal
const REPLACED_ATTEMPT: i32 = 0;

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (and create if needed) an artifact root
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [SOURCES_DIR, STAGING_DIR, OUTPUTS_DIR] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| StorageError::io(&path, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn source_dir(&self, clip_id: &str) -> PathBuf {
        self.root.join(SOURCES_DIR).join(clip_id)
    }

    fn output_dir(&self, clip_id: &str) -> PathBuf {
        self.root.join(OUTPUTS_DIR).join(clip_id)
    }

    fn staging_dir(&self, clip_id: &str, attempt: i32) -> PathBuf {
        self.root
            .join(STAGING_DIR)
            .join(format!("{}.{}.{}", clip_id, attempt, Uuid::new_v4().simple()))
    }

    /// Staged paths must live directly under staging/
    fn check_staged(&self, staged: &Path) -> Result<(), StorageError> {
        if staged.parent() == Some(self.root.join(STAGING_DIR).as_path()) {
            Ok(())
        } else {
            Err(StorageError::Incomplete(format!(
                "{} is not a staging directory",
                staged.display()
            )))
        }
    }
}

/// `<clip>.<attempt>.<uuid>` -> (clip, attempt)
fn parse_staging_name(name: &str) -> Option<(ClipId, i32)> {
    let mut parts = name.split('.');
    let clip_id = parts.next()?;
    let attempt = parts.next()?.parse().ok()?;
    let _uuid = parts.next()?;
    if parts.next().is_some() || clip_id.is_empty() {
        return None;
    }
    Some((clip_id.to_string(), attempt))
}

/// A file name the engine may legitimately produce
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(&['/', '\\'][..])
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

async fn sync_file(path: &Path) -> Result<(), StorageError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    file.sync_all().await.map_err(|e| StorageError::io(path, e))
}

/// Persist directory entries (renames, new files)
async fn sync_dir(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        sync_file(path).await
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn import_source(&self, clip_id: &ClipId, from: &Path) -> Result<PathBuf, StorageError> {
        let dir = self.source_dir(clip_id);
        let dest = dir.join(SOURCE_FILE);
        if from == dest {
            return Ok(dest);
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;

        let partial = dir.join(format!("{}.partial", SOURCE_FILE));
        tokio::fs::copy(from, &partial)
            .await
            .map_err(|e| StorageError::io(from, e))?;
        sync_file(&partial).await?;
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| StorageError::io(&dest, e))?;

        info!(clip_id = %clip_id, from = %from.display(), "Source imported");
        Ok(dest)
    }

    async fn source_path(&self, clip_id: &ClipId) -> Result<PathBuf, StorageError> {
        let path = self.source_dir(clip_id).join(SOURCE_FILE);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(StorageError::SourceMissing(clip_id.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::SourceMissing(clip_id.clone()))
            }
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn delete_source(&self, clip_id: &ClipId) -> Result<(), StorageError> {
        remove_dir_if_exists(&self.source_dir(clip_id)).await
    }

    async fn stage_output(&self, clip_id: &ClipId, attempt: i32) -> Result<PathBuf, StorageError> {
        let dir = self.staging_dir(clip_id, attempt);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        Ok(dir)
    }

    async fn publish(
        &self,
        clip_id: &ClipId,
        staged: &Path,
        output: &TranscodeOutput,
        now: i64,
    ) -> Result<ArtifactSet, StorageError> {
        self.check_staged(staged)?;

        for name in output.files() {
            if !is_plain_file_name(name) {
                return Err(StorageError::Incomplete(format!("invalid file name {:?}", name)));
            }
            let path = staged.join(name);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => sync_file(&path).await?,
                Ok(_) => return Err(StorageError::Incomplete(format!("{} is not a file", name))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StorageError::Incomplete(format!("{} is missing", name)))
                }
                Err(e) => return Err(StorageError::io(&path, e)),
            }
        }

        let set = ArtifactSet::from_output(clip_id.clone(), output.clone(), now);
        let index = staged.join(INDEX_FILE);
        tokio::fs::write(&index, serde_json::to_vec_pretty(&set)?)
            .await
            .map_err(|e| StorageError::io(&index, e))?;
        sync_file(&index).await?;
        sync_dir(staged).await?;

        let target = self.output_dir(clip_id);
        let outputs = self.root.join(OUTPUTS_DIR);

        // Move a previous set aside; it becomes a sweepable staging entry
        let replaced = match tokio::fs::metadata(&target).await {
            Ok(_) => {
                let aside = self.staging_dir(clip_id, REPLACED_ATTEMPT);
                tokio::fs::rename(&target, &aside)
                    .await
                    .map_err(|e| StorageError::io(&target, e))?;
                Some(aside)
            }
            Err(_) => None,
        };

        if let Err(e) = tokio::fs::rename(staged, &target).await {
            if let Some(aside) = &replaced {
                if let Err(restore) = tokio::fs::rename(aside, &target).await {
                    warn!(clip_id = %clip_id, error = %restore, "Failed to restore previous outputs");
                }
            }
            return Err(StorageError::io(&target, e));
        }
        sync_dir(&outputs).await?;

        if let Some(aside) = replaced {
            if let Err(e) = remove_dir_if_exists(&aside).await {
                warn!(path = %aside.display(), error = %e, "Failed to remove replaced outputs");
            }
        }

        info!(
            clip_id = %clip_id,
            renditions = set.renditions.len(),
            "Artifacts published"
        );
        Ok(set)
    }

    async fn discard_staged(&self, staged: &Path) -> Result<(), StorageError> {
        self.check_staged(staged)?;
        remove_dir_if_exists(staged).await
    }

    async fn load_artifacts(&self, clip_id: &ClipId) -> Result<Option<ArtifactSet>, StorageError> {
        let index = self.output_dir(clip_id).join(INDEX_FILE);
        match tokio::fs::read(&index).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&index, e)),
        }
    }

    async fn delete_outputs(&self, clip_id: &ClipId) -> Result<(), StorageError> {
        remove_dir_if_exists(&self.output_dir(clip_id)).await
    }

    async fn list_staged(&self) -> Result<Vec<StagedEntry>, StorageError> {
        let staging = self.root.join(STAGING_DIR);
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&staging)
            .await
            .map_err(|e| StorageError::io(&staging, e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&staging, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            match parse_staging_name(&name) {
                Some((clip_id, attempt)) => entries.push(StagedEntry {
                    clip_id,
                    attempt,
                    dir: entry.path(),
                }),
                None => warn!(name = %name, "Ignoring unexpected entry in staging"),
            }
        }
        Ok(entries)
    }
}
