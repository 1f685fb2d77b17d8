//! The session lifecycle state machine.

use std::fmt;

/// Where a session is in its lifecycle.
///
/// ```text
/// Initializing ──→ Active ⇄ Warning
///      │             │        │
///      │             └──→ Ending ←┘ ──→ Ended
///      │             │        │
///      └─────────────┴────────┴──→ Error
/// ```
///
/// `Warning` goes back to `Active` when an extension lifts the remaining
/// time above the warning threshold again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Active,
    Warning,
    Ending,
    Ended,
    Error,
}

impl SessionState {
    /// `Active` or `Warning`: the countdown is meaningful and operations
    /// like extending are allowed.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Warning)
    }

    /// `Ended` or `Error`: nothing happens any more.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }

    /// Returns `true` if moving to `target` is allowed.
    pub fn can_transition_to(self, target: Self) -> bool {
        use SessionState::*;
        matches!(
            (self, target),
            (Initializing, Active | Error)
                | (Active, Warning | Ending | Error)
                | (Warning, Active | Ending | Error)
                | (Ending, Ended)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Warning => "warning",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}
