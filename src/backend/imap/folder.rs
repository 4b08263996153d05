//! IMAP folder module.
//!
//! This module contains the folder implementation of the remote
//! side, backed by the sessions of a [`SessionPool`].

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use mail_parser::MessageParser;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError},
    thread,
};

use super::{
    flags::{from_imap_flags, into_imap_flags},
    protocol::{FetchItems, FetchedMessage, SearchCriterion, StoreItem, StoreOp, UidSet},
    Error, SessionGuard, SessionPool, WorkerId,
};
use crate::{
    folder::{self, Folder, FolderKind, MessageList, MessageRecord},
    Flags, Labels,
};

/// Represents a mailbox of an IMAP store.
#[derive(Debug)]
pub struct ImapFolder {
    pool: Arc<SessionPool>,
    name: String,
    sep: char,
    readonly: bool,
    keywords: HashMap<char, String>,
    list: RwLock<MessageList>,
}

impl ImapFolder {
    pub fn new<N: ToString>(pool: Arc<SessionPool>, name: N, sep: char, readonly: bool) -> Self {
        let keywords = pool.config().keywords();
        Self {
            pool,
            name: name.to_string(),
            sep,
            readonly,
            keywords,
            list: RwLock::default(),
        }
    }

    /// Returns the identity of the calling worker: sessions are
    /// given back to the thread that used them last on this folder,
    /// so the mailbox is most likely already selected.
    fn worker(&self) -> WorkerId {
        WorkerId::new(format!("{}@{:?}", self.name, thread::current().id()))
    }

    fn session(&self) -> folder::Result<SessionGuard<'_>> {
        Ok(self.pool.acquire(&self.worker())?)
    }

    fn list(&self) -> RwLockReadGuard<MessageList> {
        self.list.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn list_mut(&self) -> RwLockWriteGuard<MessageList> {
        self.list.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn protocol_error<C: ToString>(err: super::ProtocolError, context: C) -> folder::Error {
        folder::Error::from(Error::ProtocolError(err, context.to_string()))
    }

    fn to_record(&self, fetched: &FetchedMessage) -> MessageRecord {
        MessageRecord {
            uid: fetched.uid,
            flags: from_imap_flags(&fetched.flags, &self.keywords),
            labels: fetched.labels.iter().map(String::as_str).collect(),
            received: fetched.internal_date,
            mod_time: 0,
        }
    }

    /// Looks up the uid of a freshly appended message by its
    /// Message-ID header, for servers without `UIDPLUS`. Only uids
    /// from the UIDNEXT reported before the append are considered.
    fn find_appended_uid(
        &self,
        session: &mut SessionGuard,
        content: &[u8],
        uid_next: Option<u32>,
    ) -> i64 {
        let message_id = match MessageParser::default()
            .parse_headers(content)
            .and_then(|msg| msg.message_id().map(ToOwned::to_owned))
        {
            Some(id) => id,
            None => {
                debug!("appended message has no Message-ID, cannot find its uid");
                return 0;
            }
        };

        let criterion = SearchCriterion::Header("Message-ID".into(), message_id.clone());
        let res = session
            .ensure_selected(&self.name, true)
            .and_then(|()| session.run(|proto| proto.search(&criterion)));
        let uids = match res {
            Ok(uids) => uids,
            Err(err) => {
                warn!("cannot search message {} in {}: {}", message_id, self.name, err);
                return 0;
            }
        };

        let min = uid_next.map(i64::from).unwrap_or(1);
        let uids: Vec<i64> = uids.into_iter().filter(|uid| *uid >= min).collect();
        match uids.as_slice() {
            [uid] => *uid,
            [] => {
                debug!("appended message {} not found in {}", message_id, self.name);
                0
            }
            _ if uid_next.is_none() => uids.iter().max().copied().unwrap_or_default(),
            _ => {
                debug!("appended message {} found {} times in {}", message_id, uids.len(), self.name);
                0
            }
        }
    }

    fn store(
        &self,
        uids: &[i64],
        op: StoreOp,
        item: StoreItem,
        values: Vec<String>,
    ) -> folder::Result<Vec<FetchedMessage>> {
        let uids: Vec<i64> = uids.iter().filter(|uid| **uid > 0).cloned().collect();
        if uids.is_empty() || values.is_empty() {
            return Ok(vec![]);
        }

        let mut session = self.session()?;
        session
            .ensure_selected(&self.name, false)
            .map_err(|err| Self::protocol_error(err, format!("select {}", self.name)))?;
        let echoed = session
            .run(|proto| proto.store(&UidSet::List(uids), op, item, &values))
            .map_err(|err| Self::protocol_error(err, format!("store {:?} in {}", values, self.name)))?;
        Ok(echoed)
    }

    /// Updates the cached flags from the messages echoed by the
    /// server. The other messages are updated optimistically.
    fn update_flags<U: Fn(&mut Flags)>(&self, uids: &[i64], echoed: &[FetchedMessage], update: U) {
        let mut list = self.list_mut();
        let echoed: HashMap<i64, &FetchedMessage> = echoed.iter().map(|f| (f.uid, f)).collect();
        for uid in uids {
            if let Some(record) = list.get_mut(uid) {
                match echoed.get(uid) {
                    Some(fetched) => record.flags = from_imap_flags(&fetched.flags, &self.keywords),
                    None => update(&mut record.flags),
                }
            }
        }
    }

    fn update_labels<U: Fn(&mut Labels)>(&self, uids: &[i64], update: U) {
        let mut list = self.list_mut();
        for uid in uids {
            if let Some(record) = list.get_mut(uid) {
                update(&mut record.labels)
            }
        }
    }
}

impl Folder for ImapFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn sep(&self) -> char {
        self.sep
    }

    fn kind(&self) -> FolderKind {
        FolderKind::Remote
    }

    fn suggests_workers(&self) -> bool {
        true
    }

    fn wait_for_slot(&self) {
        self.pool.wait_for_slot()
    }

    fn supports_labels(&self) -> bool {
        self.pool.config().labels()
    }

    fn cache_message_list(
        &self,
        min_uid: Option<i64>,
        min_date: Option<DateTime<Utc>>,
    ) -> folder::Result<()> {
        folder::check_restrictions(&self.name, min_uid, min_date)?;

        let mut session = self.session()?;
        let state = session
            .select(&self.name, true)
            .map_err(|err| Self::protocol_error(err, format!("select {}", self.name)))?;

        let mut list = MessageList::default();
        if state.exists > 0 {
            let uids = match (min_uid, min_date) {
                (_, Some(date)) => {
                    let criterion = SearchCriterion::Since(date.date_naive());
                    let uids = session
                        .run(|proto| proto.search(&criterion))
                        .map_err(|err| Self::protocol_error(err, format!("search {}", self.name)))?;
                    if uids.is_empty() {
                        None
                    } else {
                        Some(UidSet::List(uids))
                    }
                }
                (Some(min_uid), None) => Some(UidSet::From(min_uid)),
                (None, None) => Some(UidSet::All),
            };

            if let Some(uids) = uids {
                let items = FetchItems::Meta {
                    labels: self.supports_labels(),
                };
                let fetched = session
                    .run(|proto| proto.fetch(&uids, items))
                    .map_err(|err| Self::protocol_error(err, format!("fetch {}", self.name)))?;
                for fetched in &fetched {
                    // `n:*` always matches the last message, even when
                    // its uid is lower than n.
                    if fetched.uid <= 0 || min_uid.map(|min| fetched.uid < min).unwrap_or_default() {
                        continue;
                    }
                    list.insert_record(self.to_record(fetched));
                }
            }
        }

        debug!("cached {} message(s) of {}", list.len(), self.name);
        *self.list_mut() = list;
        Ok(())
    }

    fn drop_message_list(&self) {
        self.list_mut().clear()
    }

    fn message_list(&self) -> MessageList {
        self.list().clone()
    }

    fn get_message(&self, uid: i64) -> Option<MessageRecord> {
        self.list().get(&uid).cloned()
    }

    fn message_count(&self) -> folder::Result<usize> {
        let mut session = self.session()?;
        let state = session
            .select(&self.name, true)
            .map_err(|err| Self::protocol_error(err, format!("select {}", self.name)))?;
        Ok(state.exists)
    }

    fn fetch_message(&self, uid: i64) -> folder::Result<Vec<u8>> {
        let mut session = self.session()?;
        session
            .ensure_selected(&self.name, true)
            .map_err(|err| Self::protocol_error(err, format!("select {}", self.name)))?;
        let fetched = session
            .run(|proto| proto.fetch(&UidSet::List(vec![uid]), FetchItems::Body))
            .map_err(|err| Error::FetchMessageError(err, uid, self.name.clone()))?;

        fetched
            .into_iter()
            .find(|fetched| fetched.uid == uid)
            .and_then(|fetched| fetched.body)
            .ok_or_else(|| Error::FindMessageError(uid, self.name.clone()).into())
    }

    fn save_message(
        &self,
        uid: i64,
        content: &[u8],
        flags: &Flags,
        received: Option<DateTime<Utc>>,
    ) -> folder::Result<i64> {
        if uid > 0 && self.uid_exists(uid) {
            debug!("message {} already in {}, updating its flags", uid, self.name);
            let current = self.get_message(uid).map(|r| r.flags).unwrap_or_default();
            self.add_flags(&[uid], &flags.diff(&current))?;
            self.remove_flags(&[uid], &current.diff(flags))?;
            return Ok(uid);
        }

        let mut session = self.session()?;
        let state = session
            .select(&self.name, false)
            .map_err(|err| Self::protocol_error(err, format!("select {}", self.name)))?;
        if self.readonly || state.read_only {
            warn!("folder {} is read-only, cannot save message {}", self.name, uid);
            return Ok(-1);
        }

        let imap_flags = into_imap_flags(flags, &self.keywords);
        trace!("appending message {} to {} with flags {:?}", uid, self.name, imap_flags);
        let appended = session
            .run(|proto| proto.append(&self.name, &imap_flags, received, content))
            .map_err(|err| Error::AppendMessageError(err, self.name.clone()))?;

        let new_uid = match appended {
            Some(new_uid) => new_uid,
            None => self.find_appended_uid(&mut session, content, state.uid_next),
        };
        drop(session);

        if new_uid > 0 {
            self.list_mut().insert_record(MessageRecord {
                uid: new_uid,
                flags: flags.clone(),
                received,
                ..MessageRecord::default()
            });
        }

        debug!("saved message {} to {} as {}", uid, self.name, new_uid);
        Ok(new_uid)
    }

    fn add_flags(&self, uids: &[i64], flags: &Flags) -> folder::Result<()> {
        let echoed = self.store(uids, StoreOp::Add, StoreItem::Flags, into_imap_flags(flags, &self.keywords))?;
        self.update_flags(uids, &echoed, |current| current.extend(flags.iter().cloned()));
        Ok(())
    }

    fn remove_flags(&self, uids: &[i64], flags: &Flags) -> folder::Result<()> {
        let echoed = self.store(uids, StoreOp::Remove, StoreItem::Flags, into_imap_flags(flags, &self.keywords))?;
        self.update_flags(uids, &echoed, |current| current.retain(|f| !flags.contains(f)));
        Ok(())
    }

    fn add_labels(&self, uids: &[i64], labels: &Labels) -> folder::Result<()> {
        if !self.supports_labels() {
            return Err(folder::Error::LabelsNotSupportedError(self.name.clone()));
        }
        self.store(uids, StoreOp::Add, StoreItem::Labels, labels.iter().cloned().collect())?;
        self.update_labels(uids, |current| current.extend(labels.iter().cloned()));
        Ok(())
    }

    fn remove_labels(&self, uids: &[i64], labels: &Labels) -> folder::Result<()> {
        if !self.supports_labels() {
            return Err(folder::Error::LabelsNotSupportedError(self.name.clone()));
        }
        self.store(uids, StoreOp::Remove, StoreItem::Labels, labels.iter().cloned().collect())?;
        self.update_labels(uids, |current| current.retain(|l| !labels.contains(l)));
        Ok(())
    }

    fn delete_messages(&self, uids: &[i64]) -> folder::Result<()> {
        let uids: Vec<i64> = {
            let list = self.list();
            uids.iter().filter(|uid| list.contains_key(uid)).cloned().collect()
        };
        if uids.is_empty() {
            return Ok(());
        }

        self.store(&uids, StoreOp::Add, StoreItem::Flags, vec!["\\Deleted".into()])?;
        if self.pool.config().expunge() {
            let mut session = self.session()?;
            session
                .ensure_selected(&self.name, false)
                .and_then(|()| session.run(|proto| proto.expunge()))
                .map_err(|err| Self::protocol_error(err, format!("expunge {}", self.name)))?;
        }

        let mut list = self.list_mut();
        for uid in &uids {
            list.remove(uid);
        }
        debug!("deleted {} message(s) from {}", uids.len(), self.name);
        Ok(())
    }

    /// Server uids cannot be changed, only the cached record is
    /// renamed.
    fn change_identifier(&self, old: i64, new: i64) -> folder::Result<()> {
        debug!("renaming cached message {} of {} to {}", old, self.name, new);
        self.list_mut().rename(old, new);
        Ok(())
    }
}
