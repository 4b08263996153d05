//! Folder filter and name translation module.

use log::trace;
use regex::Regex;
use std::result;
use thiserror::Error;

use crate::{HasSeverity, Severity};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot parse folder pattern {1}")]
    ParsePatternError(#[source] regex::Error, String),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        Severity::Fatal
    }
}

pub type Result<T> = result::Result<T, Error>;

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|err| Error::ParsePatternError(err, pattern.to_owned()))
}

/// Represents the filter deciding which folders of a store are
/// synchronized.
///
/// A folder is accepted when it matches one of the include patterns
/// (or when there is none) and none of the exclude patterns. Patterns
/// are regular expressions matching the whole folder name.
#[derive(Debug, Clone, Default)]
pub struct FolderFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl FolderFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            include: include
                .into_iter()
                .map(|p| compile(p.as_ref()))
                .collect::<Result<_>>()?,
            exclude: exclude
                .into_iter()
                .map(|p| compile(p.as_ref()))
                .collect::<Result<_>>()?,
        })
    }

    pub fn accepts<F: AsRef<str>>(&self, folder: F) -> bool {
        let folder = folder.as_ref();
        let included =
            self.include.is_empty() || self.include.iter().any(|re| re.is_match(folder));
        let excluded = self.exclude.iter().any(|re| re.is_match(folder));
        trace!("folder {folder}: included={included} excluded={excluded}");
        included && !excluded
    }
}

/// Represents the translation of folder names from one store to the
/// other.
///
/// Rules are applied in order, each one replacing all the matches of
/// its pattern. An empty translation is the identity.
#[derive(Debug, Clone, Default)]
pub struct NameTrans {
    rules: Vec<(Regex, String)>,
}

impl NameTrans {
    pub fn new<P, R, T>(rules: T) -> Result<Self>
    where
        P: AsRef<str>,
        R: ToString,
        T: IntoIterator<Item = (P, R)>,
    {
        Ok(Self {
            rules: rules
                .into_iter()
                .map(|(pattern, replacement)| -> Result<(Regex, String)> {
                    let re = Regex::new(pattern.as_ref()).map_err(|err| {
                        Error::ParsePatternError(err, pattern.as_ref().to_owned())
                    })?;
                    Ok((re, replacement.to_string()))
                })
                .collect::<Result<_>>()?,
        })
    }

    pub fn apply<F: AsRef<str>>(&self, folder: F) -> String {
        self.rules
            .iter()
            .fold(folder.as_ref().to_owned(), |name, (re, replacement)| {
                re.replace_all(&name, replacement.as_str()).into_owned()
            })
    }
}
