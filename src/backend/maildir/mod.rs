//! Maildir backend module.
//!
//! This module contains the local side of the synchronization: a
//! hierarchy of Maildir folders whose messages carry their uid and
//! flags in their filename.

pub mod filename;
pub mod folder;
pub mod store;

pub use self::filename::MaildirFilename;
pub use self::folder::MaildirFolder;
pub use self::store::MaildirStore;

use std::{io, path::PathBuf, result};
use thiserror::Error;

use crate::{HasSeverity, Severity};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read maildir directory {1}")]
    ReadDirError(#[source] io::Error, PathBuf),
    #[error("cannot create maildir directory {1}")]
    CreateDirError(#[source] io::Error, PathBuf),
    #[error("cannot find maildir folder {0} at {1}")]
    FolderNotFoundError(String, PathBuf),
    #[error("cannot save message to read-only maildir folder {0}")]
    ReadOnlyFolderError(String),

    #[error("cannot find message {0} in maildir folder {1}")]
    FindMessageError(i64, String),
    #[error("cannot read message {1}")]
    ReadMessageError(#[source] io::Error, PathBuf),
    #[error("cannot write message {1}")]
    WriteMessageError(#[source] io::Error, PathBuf),
    #[error("cannot move message {1} to {2}")]
    RenameMessageError(#[source] io::Error, PathBuf, PathBuf),
    #[error("cannot delete message {1}")]
    DeleteMessageError(#[source] io::Error, PathBuf),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        match self {
            Self::ReadDirError(..) => Severity::Folder,
            Self::CreateDirError(..) => Severity::Folder,
            Self::FolderNotFoundError(..) => Severity::Folder,
            Self::ReadOnlyFolderError(_) => Severity::Folder,
            Self::FindMessageError(..)
            | Self::ReadMessageError(..)
            | Self::WriteMessageError(..)
            | Self::RenameMessageError(..)
            | Self::DeleteMessageError(..) => Severity::Message,
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
