//! Folder module.
//!
//! This module exposes the folder trait, implemented by every kind of
//! mailbox taking part in a synchronization: remote IMAP folders,
//! local Maildir folders and UID-mapped folders.

pub mod message;
pub use message::*;

pub mod uid_map;
pub use uid_map::{MappedFolder, UidMapTable};

use chrono::{DateTime, Utc};
use std::{fmt, result};
use thiserror::Error;

use crate::{Flags, HasSeverity, Labels, Severity};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot restrict message list of folder {0} by both min uid and min date")]
    BothRestrictionsError(String),
    #[error("folder {0} does not support labels")]
    LabelsNotSupportedError(String),
    #[error("cannot find message {1} in folder {0}")]
    FindMessageError(String, i64),

    #[cfg(feature = "imap-backend")]
    #[error(transparent)]
    ImapError(#[from] crate::backend::imap::Error),
    #[cfg(feature = "maildir-backend")]
    #[error(transparent)]
    MaildirError(#[from] crate::backend::maildir::Error),
    #[error(transparent)]
    UidMapError(#[from] uid_map::Error),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        match self {
            Self::BothRestrictionsError(_) => Severity::Fatal,
            Self::LabelsNotSupportedError(_) => Severity::Folder,
            Self::FindMessageError(..) => Severity::Message,
            #[cfg(feature = "imap-backend")]
            Self::ImapError(err) => err.severity(),
            #[cfg(feature = "maildir-backend")]
            Self::MaildirError(err) => err.severity(),
            Self::UidMapError(err) => err.severity(),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the kind of a folder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FolderKind {
    Remote,
    Local,
    Mapped,
}

/// Checks that at most one restriction is given to
/// [`Folder::cache_message_list`].
pub fn check_restrictions(
    folder: &str,
    min_uid: Option<i64>,
    min_date: Option<DateTime<Utc>>,
) -> Result<()> {
    if min_uid.is_some() && min_date.is_some() {
        return Err(Error::BothRestrictionsError(folder.to_owned()));
    }
    Ok(())
}

/// Represents a folder taking part in a synchronization.
///
/// The message list is a cache: it is filled by one explicit call to
/// [`Folder::cache_message_list`] and is never refreshed implicitly.
/// Mutating operations keep it up to date.
pub trait Folder: fmt::Debug + Send + Sync {
    /// Returns the name of the folder, using the hierarchy separator
    /// of its store.
    fn name(&self) -> &str;
    /// Returns the hierarchy separator of the store of the folder.
    fn sep(&self) -> char;
    fn kind(&self) -> FolderKind;

    /// Returns `true` if messages can be copied to this folder by
    /// concurrent workers.
    fn suggests_workers(&self) -> bool {
        false
    }

    /// Blocks until the store of the folder is able to serve one
    /// more concurrent operation.
    fn wait_for_slot(&self) {}

    fn supports_labels(&self) -> bool {
        false
    }

    /// Fills the message list cache. Only messages whose uid is
    /// greater or equal to `min_uid`, or received after `min_date`,
    /// are listed. Giving both restrictions is an error.
    fn cache_message_list(
        &self,
        min_uid: Option<i64>,
        min_date: Option<DateTime<Utc>>,
    ) -> Result<()>;
    /// Invalidates the message list cache.
    fn drop_message_list(&self);
    /// Returns a snapshot of the message list cache.
    fn message_list(&self) -> MessageList;
    fn get_message(&self, uid: i64) -> Option<MessageRecord>;

    fn uid_exists(&self, uid: i64) -> bool {
        self.get_message(uid).is_some()
    }

    /// Returns the number of messages of the folder, without
    /// listing them.
    fn message_count(&self) -> Result<usize>;

    /// Returns the raw content of the given message.
    fn fetch_message(&self, uid: i64) -> Result<Vec<u8>>;

    /// Saves the given message content into the folder.
    ///
    /// The returned uid tells what happened to the message:
    ///  - `uid`: the message was stored with the given uid,
    ///  - another positive uid: the store assigned a new identity,
    ///  - `0`: the message was stored but its identity is unknown,
    ///  - a negative uid: the message was refused.
    fn save_message(
        &self,
        uid: i64,
        content: &[u8],
        flags: &Flags,
        received: Option<DateTime<Utc>>,
    ) -> Result<i64>;

    fn add_flags(&self, uids: &[i64], flags: &Flags) -> Result<()>;
    fn remove_flags(&self, uids: &[i64], flags: &Flags) -> Result<()>;

    fn add_labels(&self, _uids: &[i64], _labels: &Labels) -> Result<()> {
        Err(Error::LabelsNotSupportedError(self.name().to_owned()))
    }

    fn remove_labels(&self, _uids: &[i64], _labels: &Labels) -> Result<()> {
        Err(Error::LabelsNotSupportedError(self.name().to_owned()))
    }

    /// Deletes the given messages. Unknown uids are ignored.
    fn delete_messages(&self, uids: &[i64]) -> Result<()>;

    /// Changes the uid of a message.
    fn change_identifier(&self, old: i64, new: i64) -> Result<()>;
}

impl<F: Folder + ?Sized> Folder for Box<F> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn sep(&self) -> char {
        (**self).sep()
    }

    fn kind(&self) -> FolderKind {
        (**self).kind()
    }

    fn suggests_workers(&self) -> bool {
        (**self).suggests_workers()
    }

    fn wait_for_slot(&self) {
        (**self).wait_for_slot()
    }

    fn supports_labels(&self) -> bool {
        (**self).supports_labels()
    }

    fn cache_message_list(
        &self,
        min_uid: Option<i64>,
        min_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        (**self).cache_message_list(min_uid, min_date)
    }

    fn drop_message_list(&self) {
        (**self).drop_message_list()
    }

    fn message_list(&self) -> MessageList {
        (**self).message_list()
    }

    fn get_message(&self, uid: i64) -> Option<MessageRecord> {
        (**self).get_message(uid)
    }

    fn uid_exists(&self, uid: i64) -> bool {
        (**self).uid_exists(uid)
    }

    fn message_count(&self) -> Result<usize> {
        (**self).message_count()
    }

    fn fetch_message(&self, uid: i64) -> Result<Vec<u8>> {
        (**self).fetch_message(uid)
    }

    fn save_message(
        &self,
        uid: i64,
        content: &[u8],
        flags: &Flags,
        received: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        (**self).save_message(uid, content, flags, received)
    }

    fn add_flags(&self, uids: &[i64], flags: &Flags) -> Result<()> {
        (**self).add_flags(uids, flags)
    }

    fn remove_flags(&self, uids: &[i64], flags: &Flags) -> Result<()> {
        (**self).remove_flags(uids, flags)
    }

    fn add_labels(&self, uids: &[i64], labels: &Labels) -> Result<()> {
        (**self).add_labels(uids, labels)
    }

    fn remove_labels(&self, uids: &[i64], labels: &Labels) -> Result<()> {
        (**self).remove_labels(uids, labels)
    }

    fn delete_messages(&self, uids: &[i64]) -> Result<()> {
        (**self).delete_messages(uids)
    }

    fn change_identifier(&self, old: i64, new: i64) -> Result<()> {
        (**self).change_identifier(old, new)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{check_restrictions, Error};
    use crate::{HasSeverity, Severity};

    #[test]
    fn both_restrictions_are_fatal() {
        assert!(check_restrictions("INBOX", Some(1), None).is_ok());
        assert!(check_restrictions("INBOX", None, Some(Utc::now())).is_ok());

        let err = check_restrictions("INBOX", Some(1), Some(Utc::now())).unwrap_err();
        assert!(matches!(err, Error::BothRestrictionsError(_)));
        assert_eq!(err.severity(), Severity::Fatal);
    }
}
