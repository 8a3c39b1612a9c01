// Clip Domain Model
//
// The clip record itself (title, creator, views) lives outside the pipeline.
// Only the encoding state machine is modelled here.

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Opaque clip identifier, also used as a path component in the artifact store
pub type ClipId = String;

/// Longest clip id accepted at enqueue time
pub const MAX_CLIP_ID_LEN: usize = 128;

/// Encoding state of a clip.
///
/// Transitions only move forward:
///
/// ```text
/// Queued ──► Encoding ──► Ready
///   │           │
///   └───────────┴───────► Failed
/// ```
///
/// `Encoding -> Encoding` is accepted as a no-op so a retried attempt can
/// re-announce itself. `Ready` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClipState {
    Queued,
    Encoding,
    Ready,
    Failed,
}

impl ClipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipState::Queued => "QUEUED",
            ClipState::Encoding => "ENCODING",
            ClipState::Ready => "READY",
            ClipState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ClipState::Ready | ClipState::Failed)
    }

    pub fn can_transition_to(&self, next: ClipState) -> bool {
        use ClipState::*;
        matches!(
            (self, next),
            (Queued, Encoding)
                | (Encoding, Encoding)
                | (Encoding, Ready)
                | (Queued, Failed)
                | (Encoding, Failed)
        )
    }

    /// Validate a transition and return the next state
    pub fn transition(self, next: ClipState) -> Result<ClipState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidClipTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ClipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClipState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(ClipState::Queued),
            "ENCODING" => Ok(ClipState::Encoding),
            "READY" => Ok(ClipState::Ready),
            "FAILED" => Ok(ClipState::Failed),
            other => Err(DomainError::UnknownVariant {
                kind: "clip state",
                value: other.to_string(),
            }),
        }
    }
}

/// Validate a clip id.
///
/// Ids are restricted to `[A-Za-z0-9_-]` so they can be used verbatim as
/// directory names.
pub fn validate_clip_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(DomainError::InvalidClipId("clip id cannot be empty".to_string()));
    }
    if id.len() > MAX_CLIP_ID_LEN {
        return Err(DomainError::InvalidClipId(format!(
            "clip id too long: {} chars (max {})",
            id.len(),
            MAX_CLIP_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DomainError::InvalidClipId(format!(
            "clip id must be alphanumeric, '-' or '_': {}",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(ClipState::Queued.can_transition_to(ClipState::Encoding));
        assert!(ClipState::Encoding.can_transition_to(ClipState::Ready));
        assert!(ClipState::Encoding.can_transition_to(ClipState::Failed));
        assert!(ClipState::Queued.can_transition_to(ClipState::Failed));
    }

    #[test]
    fn test_encoding_reentry_is_noop() {
        assert_eq!(
            ClipState::Encoding.transition(ClipState::Encoding).unwrap(),
            ClipState::Encoding
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [ClipState::Ready, ClipState::Failed] {
            assert!(terminal.is_terminal());
            for next in [
                ClipState::Queued,
                ClipState::Encoding,
                ClipState::Ready,
                ClipState::Failed,
            ] {
                assert!(terminal.transition(next).is_err());
            }
        }
    }

    #[test]
    fn test_no_backwards_transition() {
        assert!(ClipState::Encoding.transition(ClipState::Queued).is_err());
        assert!(ClipState::Queued.transition(ClipState::Ready).is_err());
    }

    #[test]
    fn test_state_roundtrip_through_str() {
        assert_eq!("ENCODING".parse::<ClipState>().unwrap(), ClipState::Encoding);
        assert!("encoding".parse::<ClipState>().is_err());
    }

    #[test]
    fn test_validate_clip_id() {
        assert!(validate_clip_id("clip_01-abc").is_ok());
        assert!(validate_clip_id("").is_err());
        assert!(validate_clip_id("../etc").is_err());
        assert!(validate_clip_id("a/b").is_err());
        assert!(validate_clip_id(&"x".repeat(MAX_CLIP_ID_LEN + 1)).is_err());
    }
}
