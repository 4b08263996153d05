use serde::Serialize;
use std::{collections::BTreeSet, fmt, ops};

/// Represents the free-form labels of a message (Gmail labels, or
/// the content of a keywords header on the local side).
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize)]
pub struct Labels(pub BTreeSet<String>);

impl Labels {
    pub fn diff(&self, other: &Labels) -> Labels {
        self.0.difference(&other.0).cloned().collect()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut glue = "";
        for label in &self.0 {
            write!(f, "{}{}", glue, label)?;
            glue = ",";
        }
        Ok(())
    }
}

impl ops::Deref for Labels {
    type Target = BTreeSet<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ops::DerefMut for Labels {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Parses a comma-separated list of labels. Empty entries are
/// ignored.
impl From<&str> for Labels {
    fn from(labels: &str) -> Self {
        labels
            .split(',')
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    }
}

impl FromIterator<String> for Labels {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        let mut labels = Labels::default();
        labels.extend(iter);
        labels
    }
}

impl<'a> FromIterator<&'a str> for Labels {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        iter.into_iter().map(ToOwned::to_owned).collect()
    }
}
