//! Lifecycle of one endpoint.
//!
//! ```text
//!   Connected ──login──▶ Validated ──session──▶ InSession
//!       │                   ▲  │                   │
//!       │                   │  └───────────────────┤ end session / peer gone
//!       │                   └──────────────────────┘
//!       └──────────── any live state ─────────────▶ Disconnected (terminal)
//! ```
//!
//! `Disconnected` never transitions back.  Reconnecting requires a new
//! connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a connection or server-side endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Disconnected,
    Connected,
    Validated,
    InSession,
}

/// Returned when a requested transition is not part of the state machine.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid status transition {from:?} -> {to:?}")]
pub struct StatusError {
    pub from: Status,
    pub to: Status,
}

impl Status {
    /// Whether `self -> next` is allowed.  Staying in the same live state is
    /// always allowed.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (Disconnected, _) => false,
            (from, to) if from == to => true,
            (_, Disconnected) => true,
            (Connected, Validated) => true,
            (Validated, InSession) => true,
            (InSession, Validated) => true,
            _ => false,
        }
    }

    /// Returns `next` if the transition is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError`] for transitions outside the state machine.
    pub fn transition(self, next: Status) -> Result<Status, StatusError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StatusError {
                from: self,
                to: next,
            })
        }
    }

    /// Logged in, whether or not currently paired.
    pub fn is_validated(self) -> bool {
        matches!(self, Status::Validated | Status::InSession)
    }

    pub fn is_live(self) -> bool {
        self != Status::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::Status::*;
    use super::*;

    #[test]
    fn test_login_then_session_then_end_session() {
        let s = Connected.transition(Validated).expect("login");
        let s = s.transition(InSession).expect("pair");
        let s = s.transition(Validated).expect("unpair");
        assert_eq!(s, Validated);
    }

    #[test]
    fn test_cannot_skip_login() {
        assert_eq!(
            Connected.transition(InSession),
            Err(StatusError {
                from: Connected,
                to: InSession
            })
        );
    }

    #[test]
    fn test_cannot_log_out_without_disconnecting() {
        assert!(!Validated.can_transition_to(Connected));
        assert!(!InSession.can_transition_to(Connected));
    }

    #[test]
    fn test_every_live_state_can_disconnect() {
        for s in [Connected, Validated, InSession] {
            assert!(s.can_transition_to(Disconnected), "{s:?} must be able to disconnect");
        }
    }

    #[test]
    fn test_disconnected_is_terminal() {
        for s in [Disconnected, Connected, Validated, InSession] {
            assert!(!Disconnected.can_transition_to(s), "Disconnected -> {s:?} must fail");
        }
    }

    #[test]
    fn test_same_state_is_a_no_op() {
        assert_eq!(Validated.transition(Validated), Ok(Validated));
    }

    #[test]
    fn test_is_validated() {
        assert!(!Connected.is_validated());
        assert!(Validated.is_validated());
        assert!(InSession.is_validated());
        assert!(!Disconnected.is_live());
    }
}
