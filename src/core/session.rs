/// Snapshot session state tracking

use super::target::BackupTarget;
use std::fmt;
use std::time::{Duration, Instant};

/// Coordinator state for one backup run
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Unlocked,
    LockRequested,
    Locked,
    SnapshotRunning,
    Unlocking,
    Done,
    Failed { reason: String },
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unlocked => write!(f, "Unlocked"),
            SessionState::LockRequested => write!(f, "LockRequested"),
            SessionState::Locked => write!(f, "Locked"),
            SessionState::SnapshotRunning => write!(f, "SnapshotRunning"),
            SessionState::Unlocking => write!(f, "Unlocking"),
            SessionState::Done => write!(f, "Done"),
            SessionState::Failed { reason } => write!(f, "Failed: {}", reason),
        }
    }
}

impl SessionState {
    /// Whether the node may be holding an fsync lock taken by this run
    pub fn owes_unlock(&self) -> bool {
        matches!(
            self,
            SessionState::Locked | SessionState::SnapshotRunning | SessionState::Unlocking
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed { .. })
    }
}

/// Transient state carried through one lock/snapshot/unlock sequence
#[derive(Debug)]
pub struct SnapshotSession {
    target: BackupTarget,
    state: SessionState,
    started_at: Instant,
}

impl SnapshotSession {
    pub fn new(target: BackupTarget) -> Self {
        Self {
            target,
            state: SessionState::Unlocked,
            started_at: Instant::now(),
        }
    }

    pub fn target(&self) -> &BackupTarget {
        &self.target
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Move to `next`, logging the transition
    pub fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            "Session for {}: {} -> {}",
            self.target.host_port(),
            self.state,
            next
        );
        self.state = next;
    }

    pub fn fail<S: Into<String>>(&mut self, reason: S) {
        self.transition(SessionState::Failed {
            reason: reason.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConnectionDescriptor;

    fn test_target() -> BackupTarget {
        let descriptor: ConnectionDescriptor = "mongodb://u:p@h1:27017,h2:27017/db?replicaSet=rs0"
            .parse()
            .unwrap();
        BackupTarget::new(&descriptor, "h2:27017")
    }

    #[test]
    fn test_session_starts_unlocked() {
        let session = SnapshotSession::new(test_target());
        assert_eq!(session.state(), &SessionState::Unlocked);
        assert!(!session.state().owes_unlock());
        assert_eq!(session.target().host_port(), "h2:27017");
    }

    #[test]
    fn test_owes_unlock_between_lock_and_release() {
        let mut session = SnapshotSession::new(test_target());
        session.transition(SessionState::LockRequested);
        assert!(!session.state().owes_unlock());
        session.transition(SessionState::Locked);
        assert!(session.state().owes_unlock());
        session.transition(SessionState::SnapshotRunning);
        assert!(session.state().owes_unlock());
        session.transition(SessionState::Unlocking);
        assert!(session.state().owes_unlock());
        session.transition(SessionState::Done);
        assert!(!session.state().owes_unlock());
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_failed_state_display() {
        let mut session = SnapshotSession::new(test_target());
        session.fail("SnapshotError");
        assert_eq!(session.state().to_string(), "Failed: SnapshotError");
        assert!(session.state().is_terminal());
    }
}
