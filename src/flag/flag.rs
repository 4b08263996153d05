use serde::Serialize;
use std::fmt;

/// Represents the flag variants.
///
/// Every flag is identified by a single character code, following
/// the Maildir info convention. Keywords are mapped to lowercase
/// letters by the store that supports them.
#[derive(Debug, Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Flag {
    Draft,
    Flagged,
    Passed,
    Replied,
    Seen,
    Trashed,
    Keyword(char),
}

impl Flag {
    /// Parses a flag from its character code. Returns `None` for
    /// characters that are not flag codes.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'D' => Some(Self::Draft),
            'F' => Some(Self::Flagged),
            'P' => Some(Self::Passed),
            'R' => Some(Self::Replied),
            'S' => Some(Self::Seen),
            'T' => Some(Self::Trashed),
            'a'..='z' => Some(Self::Keyword(c)),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Self::Draft => 'D',
            Self::Flagged => 'F',
            Self::Passed => 'P',
            Self::Replied => 'R',
            Self::Seen => 'S',
            Self::Trashed => 'T',
            Self::Keyword(c) => *c,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}
