//! Session lifecycle states.

use std::fmt;

/// Lifecycle state of the session.
///
/// `Empty -> Attaching -> Attached -> ScriptLoaded -> Empty`, with a failed
/// attach returning straight to `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Empty,
    Attaching,
    Attached,
    ScriptLoaded,
}

impl SessionState {
    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Empty, Self::Attaching)
                | (Self::Attaching, Self::Attached | Self::Empty)
                | (Self::Attached, Self::ScriptLoaded | Self::Empty)
                | (Self::ScriptLoaded, Self::Empty)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "EMPTY",
            Self::Attaching => "ATTACHING",
            Self::Attached => "ATTACHED",
            Self::ScriptLoaded => "SCRIPT_LOADED",
        };
        f.write_str(name)
    }
}
