use serde::Serialize;
use std::{collections::BTreeSet, fmt, ops};

use crate::Flag;

/// Represents the set of flags of a message.
///
/// The set is ordered, so its string representation is stable: the
/// standard flags come first in alphabetical order, then keywords.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize)]
pub struct Flags(pub BTreeSet<Flag>);

impl Flags {
    /// Returns the flags of `self` that are not in `other`.
    pub fn diff(&self, other: &Flags) -> Flags {
        self.0.difference(&other.0).cloned().collect()
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for flag in &self.0 {
            write!(f, "{}", flag)?;
        }
        Ok(())
    }
}

impl ops::Deref for Flags {
    type Target = BTreeSet<Flag>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ops::DerefMut for Flags {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<&str> for Flags {
    fn from(flags: &str) -> Self {
        flags.chars().filter_map(Flag::from_char).collect()
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<T: IntoIterator<Item = Flag>>(iter: T) -> Self {
        let mut flags = Flags::default();
        flags.extend(iter);
        flags
    }
}
