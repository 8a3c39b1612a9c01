// Clip Metadata Port
//
// The pipeline only ever reads and writes the encoding state of a clip.
// Everything else about a clip belongs to the hosting application.

use crate::domain::{ClipId, ClipState};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ClipStore: Send + Sync {
    /// Register a clip in `Queued` unless it already exists.
    ///
    /// Returns the state the clip is in afterwards.
    async fn create_if_absent(&self, clip_id: &ClipId, now: i64) -> Result<ClipState>;

    /// `None` means the clip does not exist (never created, or deleted)
    async fn get_state(&self, clip_id: &ClipId) -> Result<Option<ClipState>>;

    /// Overwrite the state of a clip that has not settled yet.
    /// Forward-only ordering among live states is up to the caller.
    ///
    /// # Errors
    /// - `AppError::NotFound` if the clip does not exist
    /// - `AppError::ClipSettled` if the clip is already Ready or Failed
    async fn set_state(&self, clip_id: &ClipId, state: ClipState, now: i64) -> Result<()>;

    /// Delete the clip record. Returns `false` if it did not exist.
    async fn delete(&self, clip_id: &ClipId) -> Result<bool>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory clip store
    #[derive(Default)]
    pub struct InMemoryClipStore {
        clips: Mutex<HashMap<ClipId, ClipState>>,
        history: Mutex<Vec<(ClipId, ClipState)>>,
    }

    impl InMemoryClipStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every state written through `set_state`, in order
        pub fn history(&self, clip_id: &str) -> Vec<ClipState> {
            self.history
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == clip_id)
                .map(|(_, state)| *state)
                .collect()
        }
    }

    #[async_trait]
    impl ClipStore for InMemoryClipStore {
        async fn create_if_absent(&self, clip_id: &ClipId, _now: i64) -> Result<ClipState> {
            let mut clips = self.clips.lock().unwrap();
            Ok(*clips.entry(clip_id.clone()).or_insert(ClipState::Queued))
        }

        async fn get_state(&self, clip_id: &ClipId) -> Result<Option<ClipState>> {
            Ok(self.clips.lock().unwrap().get(clip_id).copied())
        }

        async fn set_state(&self, clip_id: &ClipId, state: ClipState, _now: i64) -> Result<()> {
            let mut clips = self.clips.lock().unwrap();
            match clips.get_mut(clip_id) {
                Some(current) if current.is_terminal() => Err(AppError::ClipSettled {
                    clip_id: clip_id.clone(),
                    state: *current,
                }),
                Some(current) => {
                    *current = state;
                    self.history.lock().unwrap().push((clip_id.clone(), state));
                    Ok(())
                }
                None => Err(AppError::NotFound(format!("Clip {} not found", clip_id))),
            }
        }

        async fn delete(&self, clip_id: &ClipId) -> Result<bool> {
            Ok(self.clips.lock().unwrap().remove(clip_id).is_some())
        }
    }
}
