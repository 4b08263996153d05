//! Status module.
//!
//! This module contains the status folder: the persisted snapshot of
//! the state both sides of a folder pair agreed on after the last
//! synchronization. It is the arbiter telling which side changed
//! since then.

pub mod plain;
pub use plain::PlainStatus;

pub mod sqlite;
pub use sqlite::SqliteStatus;

use log::{debug, trace};
use std::{
    collections::HashSet,
    fmt, io, mem,
    path::{Path, PathBuf},
    result,
};
use thiserror::Error;

use crate::{
    folder::{MessageList, MessageRecord},
    Flags, HasSeverity, Labels, Severity, StatusBackend,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot create status directory {1}")]
    CreateDirError(#[source] io::Error, PathBuf),
    #[error("cannot open status file {1}")]
    OpenFileError(#[source] io::Error, PathBuf),
    #[error("cannot read line from status file {1}")]
    ReadLineError(#[source] io::Error, PathBuf),
    #[error("cannot parse line {1:?} of status file {0}")]
    ParseLineError(PathBuf, String),
    #[error("cannot write status file {1}")]
    WriteFileError(#[source] io::Error, PathBuf),
    #[error("cannot access status database")]
    SqliteError(#[from] rusqlite::Error),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        Severity::Folder
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the persistence layer of a status folder.
pub trait StatusStore: fmt::Debug + Send {
    fn load(&mut self) -> Result<MessageList>;
    /// Persists the given new or updated records.
    fn upsert(&mut self, records: &[&MessageRecord]) -> Result<()>;
    fn delete(&mut self, uids: &[i64]) -> Result<()>;
    fn rename(&mut self, old: i64, new: i64) -> Result<()>;
    /// Persists the whole list, if the store does not persist every
    /// change as it happens.
    fn flush(&mut self, list: &MessageList) -> Result<()>;
}

/// Replaces the hierarchy separators of a folder name, so that it
/// can be used as a file name.
pub fn file_name_of(folder: &str) -> String {
    folder
        .chars()
        .map(|c| match c {
            '/' | '\\' => '.',
            c => c,
        })
        .collect()
}

/// Joins labels with `,`, escaping the characters the line format
/// relies on with a backslash.
pub(crate) fn encode_labels(labels: &Labels) -> String {
    let mut encoded = String::new();
    for (i, label) in labels.iter().enumerate() {
        if i > 0 {
            encoded.push(',');
        }
        for c in label.chars() {
            match c {
                '\\' | ',' | '|' => {
                    encoded.push('\\');
                    encoded.push(c);
                }
                '\n' => encoded.push_str("\\n"),
                c => encoded.push(c),
            }
        }
    }
    encoded
}

pub(crate) fn decode_labels(encoded: &str) -> Labels {
    let mut labels = Labels::default();
    let mut label = String::new();
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => label.push('\n'),
                Some(c) => label.push(c),
                None => label.push('\\'),
            },
            ',' => {
                if !label.is_empty() {
                    labels.insert(mem::take(&mut label));
                }
            }
            c => label.push(c),
        }
    }
    if !label.is_empty() {
        labels.insert(label);
    }
    labels
}

/// Returns the directory holding the status folders of the given
/// account.
pub fn status_dir<P: AsRef<Path>>(sync_dir: P, account: &str, backend: &StatusBackend) -> PathBuf {
    let dir = match backend {
        StatusBackend::Plain => "status",
        StatusBackend::Sqlite => "status-sqlite",
    };
    sync_dir.as_ref().join(dir).join(account)
}

/// Represents the status of a folder pair.
#[derive(Debug)]
pub struct StatusFolder {
    name: String,
    list: MessageList,
    /// Records put aside by a restriction, persisted untouched.
    hidden: MessageList,
    dirty: bool,
    store: Box<dyn StatusStore>,
}

impl StatusFolder {
    pub fn new<N: ToString>(name: N, store: Box<dyn StatusStore>) -> Self {
        Self {
            name: name.to_string(),
            list: MessageList::default(),
            hidden: MessageList::default(),
            dirty: false,
            store,
        }
    }

    /// Opens the status folder of the given folder in the given
    /// directory, using the given persistence backend.
    pub fn open<P: AsRef<Path>>(dir: P, folder: &str, backend: &StatusBackend) -> Self {
        let path = dir.as_ref().join(file_name_of(folder));
        let store: Box<dyn StatusStore> = match backend {
            StatusBackend::Plain => Box::new(PlainStatus::new(path)),
            StatusBackend::Sqlite => Box::new(SqliteStatus::new(path)),
        };
        Self::new(folder, store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load(&mut self) -> Result<()> {
        self.list = self.store.load()?;
        self.hidden = MessageList::default();
        self.dirty = false;
        debug!("loaded {} status record(s) of {}", self.list.len(), self.name);
        Ok(())
    }

    pub fn message_list(&self) -> &MessageList {
        &self.list
    }

    pub fn get_message(&self, uid: i64) -> Option<&MessageRecord> {
        self.list.get(&uid)
    }

    pub fn uid_exists(&self, uid: i64) -> bool {
        self.list.contains_key(&uid)
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Inserts or replaces the given record.
    pub fn save_record(&mut self, record: MessageRecord) -> Result<()> {
        trace!("saving status record {:?} of {}", record, self.name);
        self.store.upsert(&[&record])?;
        self.list.insert_record(record);
        self.dirty = true;
        Ok(())
    }

    pub fn delete_records(&mut self, uids: &[i64]) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.store.delete(uids)?;
        for uid in uids {
            self.list.remove(uid);
        }
        self.dirty = true;
        Ok(())
    }

    fn update<U: Fn(&mut MessageRecord)>(&mut self, uids: &[i64], update: U) -> Result<()> {
        let mut changed = vec![];
        for uid in uids {
            if let Some(record) = self.list.get_mut(uid) {
                update(record);
                changed.push(*uid);
            }
        }
        let records: Vec<&MessageRecord> = changed.iter().filter_map(|uid| self.list.get(uid)).collect();
        if !records.is_empty() {
            self.store.upsert(&records)?;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn add_flags(&mut self, uids: &[i64], flags: &Flags) -> Result<()> {
        self.update(uids, |record| record.flags.extend(flags.iter().cloned()))
    }

    pub fn remove_flags(&mut self, uids: &[i64], flags: &Flags) -> Result<()> {
        self.update(uids, |record| record.flags.retain(|flag| !flags.contains(flag)))
    }

    pub fn add_labels(&mut self, uids: &[i64], labels: &Labels) -> Result<()> {
        self.update(uids, |record| record.labels.extend(labels.iter().cloned()))
    }

    pub fn remove_labels(&mut self, uids: &[i64], labels: &Labels) -> Result<()> {
        self.update(uids, |record| record.labels.retain(|label| !labels.contains(label)))
    }

    pub fn set_mod_time(&mut self, uid: i64, mod_time: i64) -> Result<()> {
        self.update(&[uid], |record| record.mod_time = mod_time)
    }

    pub fn change_identifier(&mut self, old: i64, new: i64) -> Result<()> {
        if self.list.rename(old, new) {
            self.store.rename(old, new)?;
            self.dirty = true;
        }
        Ok(())
    }

    /// Hides the records whose uid is not in the given set. Hidden
    /// records do not take part in the synchronization but are
    /// persisted as they were loaded.
    pub fn restrict_to(&mut self, uids: &HashSet<i64>) {
        let hidden: Vec<i64> = self
            .list
            .keys()
            .filter(|uid| !uids.contains(uid))
            .cloned()
            .collect();
        for uid in hidden {
            if let Some(record) = self.list.remove(&uid) {
                self.hidden.insert_record(record);
            }
        }
        debug!(
            "restricted status of {} to {} record(s), {} hidden",
            self.name,
            self.list.len(),
            self.hidden.len()
        );
    }

    /// Persists the pending changes.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut list = self.hidden.clone();
        list.extend(self.list.iter().map(|(uid, record)| (*uid, record.clone())));
        self.store.flush(&list)?;
        self.dirty = false;
        trace!("flushed status of {}", self.name);
        Ok(())
    }
}
