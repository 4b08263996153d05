//! Message record module.
//!
//! This module contains the representation of the messages of a
//! folder, as they are compared by the synchronization passes. The
//! content of the messages is never kept in memory.

use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashSet},
    ops,
};

use crate::{Flags, Labels};

/// Represents the metadata of a message.
///
/// A negative uid means that the store has not assigned an
/// identifier to the message yet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageRecord {
    pub uid: i64,
    pub flags: Flags,
    pub labels: Labels,
    /// Represents the date the message was received by the store.
    pub received: Option<DateTime<Utc>>,
    /// Represents the last modification time of the message, in
    /// seconds since epoch. Used to detect label changes.
    pub mod_time: i64,
}

impl MessageRecord {
    pub fn new(uid: i64, flags: Flags) -> Self {
        Self {
            uid,
            flags,
            ..Self::default()
        }
    }
}

/// Represents the cached list of messages of a folder, indexed by
/// uid.
///
/// The list is ordered by uid, which makes the synchronization
/// passes deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageList(pub BTreeMap<i64, MessageRecord>);

impl MessageList {
    pub fn insert_record(&mut self, record: MessageRecord) -> Option<MessageRecord> {
        self.0.insert(record.uid, record)
    }

    pub fn uids(&self) -> Vec<i64> {
        self.0.keys().cloned().collect()
    }

    /// Returns the smallest negative uid not used yet, starting from
    /// -1.
    pub fn next_negative_uid(&self) -> i64 {
        self.0
            .keys()
            .next()
            .filter(|uid| **uid < 0)
            .map(|uid| uid - 1)
            .unwrap_or(-1)
    }

    /// Moves the record `old` to the uid `new`.
    pub fn rename(&mut self, old: i64, new: i64) -> bool {
        match self.0.remove(&old) {
            Some(mut record) => {
                record.uid = new;
                self.0.insert(new, record);
                true
            }
            None => false,
        }
    }

    /// Keeps only the records whose uid belongs to the given set.
    pub fn restrict_to(&mut self, uids: &HashSet<i64>) {
        self.0.retain(|uid, _| uids.contains(uid));
    }
}

impl ops::Deref for MessageList {
    type Target = BTreeMap<i64, MessageRecord>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ops::DerefMut for MessageList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<MessageRecord> for MessageList {
    fn from_iter<T: IntoIterator<Item = MessageRecord>>(iter: T) -> Self {
        let mut list = MessageList::default();
        for record in iter {
            list.insert_record(record);
        }
        list
    }
}
