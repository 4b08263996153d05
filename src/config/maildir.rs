use serde::Deserialize;
use std::path::PathBuf;

/// Represents the Maildir store config.
#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MaildirConfig {
    /// Represents the Maildir root directory.
    pub root_dir: PathBuf,
    /// Represents the hierarchy separator of folder names.
    pub sep: Option<char>,
    /// Represents the header holding the labels of a message, for
    /// instance `X-Keywords`. Labels are not synchronized when
    /// unset.
    pub labels_header: Option<String>,
}

impl MaildirConfig {
    pub const DEFAULT_SEP: char = '.';

    pub fn sep(&self) -> char {
        self.sep.unwrap_or(Self::DEFAULT_SEP)
    }
}
