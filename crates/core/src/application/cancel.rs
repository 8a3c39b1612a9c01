// Per-clip abort signals for in-flight encodes

use crate::domain::ClipId;
use crate::port::{AbortReason, AbortSignal};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::info;

/// One registration of a clip; a later registration of the same clip gets a new id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationId(u64);

/// Registry of abort senders, one per clip currently being worked on
#[derive(Default)]
pub struct CancellationRegistry {
    senders: DashMap<ClipId, (RegistrationId, watch::Sender<Option<AbortReason>>)>,
    next_id: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight encode and get its abort signal.
    ///
    /// A previous registration for the same clip is replaced.
    pub fn register(&self, clip_id: &str) -> (RegistrationId, AbortSignal) {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = watch::channel(None);
        self.senders.insert(clip_id.to_string(), (id, tx));
        (id, rx)
    }

    /// Remove the clip's sender if it still belongs to registration `id`
    pub fn unregister(&self, clip_id: &str, id: RegistrationId) -> bool {
        self.senders
            .remove_if(clip_id, |_, (current, _)| *current == id)
            .is_some()
    }

    /// Signal one clip. Returns `false` if nothing is in flight for it.
    ///
    /// The first reason wins; later aborts do not overwrite it.
    pub fn abort(&self, clip_id: &str, reason: AbortReason) -> bool {
        match self.senders.get(clip_id) {
            Some(entry) => {
                let (_, tx) = entry.value();
                tx.send_if_modified(|current| {
                    if current.is_none() {
                        *current = Some(reason);
                        true
                    } else {
                        false
                    }
                });
                info!(clip_id = %clip_id, reason = %reason, "Abort requested");
                true
            }
            None => false,
        }
    }

    /// Signal every in-flight encode
    pub fn abort_all(&self, reason: AbortReason) -> usize {
        let clip_ids: Vec<ClipId> = self.senders.iter().map(|e| e.key().clone()).collect();
        clip_ids
            .iter()
            .filter(|clip_id| self.abort(clip_id, reason))
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_unknown_clip() {
        let registry = CancellationRegistry::new();
        assert!(!registry.abort("missing", AbortReason::ClipDeleted));
    }

    #[test]
    fn test_first_reason_wins() {
        let registry = CancellationRegistry::new();
        let (_, rx) = registry.register("a");

        assert!(registry.abort("a", AbortReason::ClaimLost));
        assert!(registry.abort("a", AbortReason::Shutdown));
        assert_eq!(*rx.borrow(), Some(AbortReason::ClaimLost));
    }

    #[test]
    fn test_abort_all() {
        let registry = CancellationRegistry::new();
        let (a_id, a) = registry.register("a");
        let (_, b) = registry.register("b");

        assert_eq!(registry.abort_all(AbortReason::Shutdown), 2);
        assert_eq!(*a.borrow(), Some(AbortReason::Shutdown));
        assert_eq!(*b.borrow(), Some(AbortReason::Shutdown));

        assert!(registry.unregister("a", a_id));
        assert_eq!(registry.in_flight(), 1);
    }

    #[test]
    fn test_stale_unregister_keeps_newer_registration() {
        let registry = CancellationRegistry::new();
        let (old_id, old) = registry.register("a");
        let (new_id, new) = registry.register("a");

        // The settled job's cleanup runs after the clip was claimed again
        assert!(!registry.unregister("a", old_id));
        assert_eq!(registry.in_flight(), 1);

        assert!(registry.abort("a", AbortReason::ClipDeleted));
        assert_eq!(*new.borrow(), Some(AbortReason::ClipDeleted));
        assert_eq!(*old.borrow(), None);

        assert!(registry.unregister("a", new_id));
        assert!(!registry.abort("a", AbortReason::ClipDeleted));
    }
}
