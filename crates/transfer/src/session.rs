use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use multipush_protocol::UploadTarget;
use tracing::debug;

use crate::TransferError;

/// Lifecycle of a multipart session.
///
/// ```text
/// Open ──► Finalizing ──► Completed
///   │          │
///   └──────────┴──► Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Finalizing,
    Completed,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Open => "open",
            SessionState::Finalizing => "finalizing",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProgress {
    pub upload_id: String,
    pub key: String,
    pub state: SessionState,
    pub parts_planned: usize,
    pub parts_stored: usize,
    pub bytes_stored: u64,
    pub elapsed: Duration,
    pub error: String,
}

/// One multipart upload against the store (thread-safe).
///
/// The target is fixed at creation; state changes go through guarded
/// transitions so a session is aborted or completed at most once.
pub struct TransferSession {
    target: UploadTarget,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: SessionState,
    parts_planned: usize,
    parts_stored: usize,
    bytes_stored: u64,
    created_at: Instant,
    closed_at: Option<Instant>,
    error: String,
}

impl TransferSession {
    /// Creates an open session for a target returned by the store.
    pub fn new(target: UploadTarget, parts_planned: usize) -> Self {
        Self {
            target,
            inner: Mutex::new(SessionInner {
                state: SessionState::Open,
                parts_planned,
                parts_stored: 0,
                bytes_stored: 0,
                created_at: Instant::now(),
                closed_at: None,
                error: String::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a part the store confirmed.
    pub fn record_part(&self, bytes: u64) {
        let mut s = self.lock();
        s.parts_stored += 1;
        s.bytes_stored += bytes;
    }

    /// Moves `Open` to `Finalizing`.
    pub fn begin_finalize(&self) -> Result<(), TransferError> {
        self.transition(SessionState::Open, SessionState::Finalizing)
    }

    /// Moves `Finalizing` to `Completed`.
    pub fn complete(&self) -> Result<(), TransferError> {
        self.transition(SessionState::Finalizing, SessionState::Completed)
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), TransferError> {
        let mut s = self.lock();
        if s.state != from {
            return Err(TransferError::InvalidTransition { from: s.state, to });
        }
        s.state = to;
        if to == SessionState::Completed {
            s.closed_at = Some(Instant::now());
        }
        debug!(upload_id = %self.target.upload_id, %from, %to, "session transition");
        Ok(())
    }

    /// Marks the session aborted.
    ///
    /// Returns `true` only for the call that performed the transition; the
    /// caller holding `true` owns the store-side abort. Later calls, and
    /// calls on a completed session, return `false`.
    pub fn try_abort(&self, reason: &str) -> bool {
        let mut s = self.lock();
        match s.state {
            SessionState::Open | SessionState::Finalizing => {
                let from = s.state;
                s.state = SessionState::Aborted;
                s.error = reason.to_string();
                s.closed_at = Some(Instant::now());
                debug!(upload_id = %self.target.upload_id, %from, reason, "session aborted");
                true
            }
            SessionState::Completed | SessionState::Aborted => false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Returns `true` once the session is completed or aborted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Completed | SessionState::Aborted
        )
    }

    pub fn target(&self) -> &UploadTarget {
        &self.target
    }

    pub fn upload_id(&self) -> &str {
        &self.target.upload_id
    }

    pub fn key(&self) -> &str {
        &self.target.key
    }

    /// Returns a snapshot of the session's bookkeeping.
    pub fn progress(&self) -> SessionProgress {
        let s = self.lock();
        let end = s.closed_at.unwrap_or_else(Instant::now);
        SessionProgress {
            upload_id: self.target.upload_id.clone(),
            key: self.target.key.clone(),
            state: s.state,
            parts_planned: s.parts_planned,
            parts_stored: s.parts_stored,
            bytes_stored: s.bytes_stored,
            elapsed: end.duration_since(s.created_at),
            error: s.error.clone(),
        }
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TransferSession {
        TransferSession::new(UploadTarget::new("u1", "recordings/test.mp4"), 3)
    }

    #[test]
    fn new_session_is_open() {
        let s = session();
        assert_eq!(s.state(), SessionState::Open);
        assert!(!s.is_terminal());
        assert_eq!(s.upload_id(), "u1");
        assert_eq!(s.key(), "recordings/test.mp4");
    }

    #[test]
    fn finalize_then_complete() {
        let s = session();
        s.begin_finalize().unwrap();
        assert_eq!(s.state(), SessionState::Finalizing);
        s.complete().unwrap();
        assert_eq!(s.state(), SessionState::Completed);
        assert!(s.is_terminal());
    }

    #[test]
    fn complete_requires_finalizing() {
        let s = session();
        let err = s.complete().unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidTransition {
                from: SessionState::Open,
                to: SessionState::Completed
            }
        ));
    }

    #[test]
    fn abort_happens_once() {
        let s = session();
        assert!(s.try_abort("part 2 failed"));
        assert!(!s.try_abort("part 3 failed"));
        assert_eq!(s.state(), SessionState::Aborted);
        assert_eq!(s.progress().error, "part 2 failed");
    }

    #[test]
    fn abort_from_finalizing() {
        let s = session();
        s.begin_finalize().unwrap();
        assert!(s.try_abort("complete rejected"));
        assert_eq!(s.state(), SessionState::Aborted);
    }

    #[test]
    fn completed_session_cannot_abort() {
        let s = session();
        s.begin_finalize().unwrap();
        s.complete().unwrap();
        assert!(!s.try_abort("late"));
        assert_eq!(s.state(), SessionState::Completed);
    }

    #[test]
    fn aborted_session_cannot_finalize() {
        let s = session();
        s.try_abort("boom");
        assert!(s.begin_finalize().is_err());
    }

    #[test]
    fn progress_counts_parts() {
        let s = session();
        s.record_part(50);
        s.record_part(20);
        let p = s.progress();
        assert_eq!(p.parts_planned, 3);
        assert_eq!(p.parts_stored, 2);
        assert_eq!(p.bytes_stored, 70);
        assert_eq!(p.state, SessionState::Open);
    }

    #[test]
    fn concurrent_abort_has_single_winner() {
        use std::sync::Arc;
        use std::thread;

        let s = Arc::new(session());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let s = Arc::clone(&s);
                thread::spawn(move || s.try_abort(&format!("part {i} failed")))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(s.state(), SessionState::Aborted);
    }
}
