// Artifact Store Port
//
// Owns the on-disk layout for sources, staged outputs and published outputs.
// Publication is all-or-nothing: readers see either the previous artifact set
// or the complete new one.

use crate::domain::{ArtifactSet, ClipId, TranscodeOutput};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Source for clip {0} is missing")]
    SourceMissing(ClipId),

    #[error("Staged output incomplete: {0}")]
    Incomplete(String),

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact index error: {0}")]
    Index(#[from] serde_json::Error),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A staging directory found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    pub clip_id: ClipId,
    pub attempt: i32,
    pub dir: PathBuf,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Copy an uploaded file in as the clip's source
    async fn import_source(&self, clip_id: &ClipId, from: &Path) -> Result<PathBuf, StorageError>;

    /// Resolve the clip's source file
    ///
    /// # Errors
    /// `StorageError::SourceMissing` if no source exists
    async fn source_path(&self, clip_id: &ClipId) -> Result<PathBuf, StorageError>;

    /// Remove the source. Missing sources are not an error.
    async fn delete_source(&self, clip_id: &ClipId) -> Result<(), StorageError>;

    /// Create a fresh, empty staging directory for one attempt
    async fn stage_output(&self, clip_id: &ClipId, attempt: i32) -> Result<PathBuf, StorageError>;

    /// Verify the staged files, write the artifact index and atomically move
    /// the staged directory into place as the clip's published outputs.
    async fn publish(
        &self,
        clip_id: &ClipId,
        staged: &Path,
        output: &TranscodeOutput,
        now: i64,
    ) -> Result<ArtifactSet, StorageError>;

    /// Remove a staging directory. Missing directories are not an error.
    async fn discard_staged(&self, staged: &Path) -> Result<(), StorageError>;

    /// Read the published artifact set of a clip
    async fn load_artifacts(&self, clip_id: &ClipId) -> Result<Option<ArtifactSet>, StorageError>;

    /// Remove published outputs. Missing outputs are not an error.
    async fn delete_outputs(&self, clip_id: &ClipId) -> Result<(), StorageError>;

    /// All staging directories currently on disk
    async fn list_staged(&self) -> Result<Vec<StagedEntry>, StorageError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Bookkeeping-only artifact store. Nothing touches the filesystem.
    #[derive(Default)]
    pub struct InMemoryArtifactStore {
        sources: Mutex<HashSet<ClipId>>,
        staged: Mutex<Vec<StagedEntry>>,
        published: Mutex<HashMap<ClipId, ArtifactSet>>,
    }

    impl InMemoryArtifactStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_source(&self, clip_id: &str) {
            self.sources.lock().unwrap().insert(clip_id.to_string());
        }

        pub fn has_source(&self, clip_id: &str) -> bool {
            self.sources.lock().unwrap().contains(clip_id)
        }

        pub fn staged(&self) -> Vec<StagedEntry> {
            self.staged.lock().unwrap().clone()
        }

        fn root() -> PathBuf {
            PathBuf::from("/mem")
        }
    }

    #[async_trait]
    impl ArtifactStore for InMemoryArtifactStore {
        async fn import_source(&self, clip_id: &ClipId, _from: &Path) -> Result<PathBuf, StorageError> {
            self.add_source(clip_id);
            Ok(Self::root().join("sources").join(clip_id))
        }

        async fn source_path(&self, clip_id: &ClipId) -> Result<PathBuf, StorageError> {
            if self.has_source(clip_id) {
                Ok(Self::root().join("sources").join(clip_id))
            } else {
                Err(StorageError::SourceMissing(clip_id.clone()))
            }
        }

        async fn delete_source(&self, clip_id: &ClipId) -> Result<(), StorageError> {
            self.sources.lock().unwrap().remove(clip_id);
            Ok(())
        }

        async fn stage_output(&self, clip_id: &ClipId, attempt: i32) -> Result<PathBuf, StorageError> {
            let dir = Self::root()
                .join("staging")
                .join(format!("{}.{}", clip_id, attempt));
            self.staged.lock().unwrap().push(StagedEntry {
                clip_id: clip_id.clone(),
                attempt,
                dir: dir.clone(),
            });
            Ok(dir)
        }

        async fn publish(
            &self,
            clip_id: &ClipId,
            staged: &Path,
            output: &TranscodeOutput,
            now: i64,
        ) -> Result<ArtifactSet, StorageError> {
            self.staged.lock().unwrap().retain(|e| e.dir != staged);
            let set = ArtifactSet::from_output(clip_id.clone(), output.clone(), now);
            self.published
                .lock()
                .unwrap()
                .insert(clip_id.clone(), set.clone());
            Ok(set)
        }

        async fn discard_staged(&self, staged: &Path) -> Result<(), StorageError> {
            self.staged.lock().unwrap().retain(|e| e.dir != staged);
            Ok(())
        }

        async fn load_artifacts(&self, clip_id: &ClipId) -> Result<Option<ArtifactSet>, StorageError> {
            Ok(self.published.lock().unwrap().get(clip_id).cloned())
        }

        async fn delete_outputs(&self, clip_id: &ClipId) -> Result<(), StorageError> {
            self.published.lock().unwrap().remove(clip_id);
            Ok(())
        }

        async fn list_staged(&self) -> Result<Vec<StagedEntry>, StorageError> {
            Ok(self.staged())
        }
    }
}
