//! Severity module.
//!
//! Every error raised by the synchronization engine carries an
//! explicit severity. Each layer only swallows the errors whose
//! severity is at or below the level it owns: a folder pass owns
//! [`Severity::Message`] and [`Severity::Folder`], the account owns
//! [`Severity::Store`], and nothing owns [`Severity::Fatal`].

use serde::Serialize;
use std::fmt;

/// Represents the severity of an error, ordered from the least to
/// the most severe.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Severity {
    /// Skip the current message, continue the pass.
    Message,
    /// Skip the remaining passes of the current folder, continue
    /// with other folders.
    Folder,
    /// Abort the current account cycle. The cycle may be retried.
    Store,
    /// Stop everything.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Folder => write!(f, "folder"),
            Self::Store => write!(f, "store"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Exposes the severity of an error.
pub trait HasSeverity {
    fn severity(&self) -> Severity;

    /// Returns `true` if a handler owning the given level is allowed
    /// to swallow this error.
    fn is_owned_by(&self, level: Severity) -> bool {
        self.severity() <= level
    }
}
