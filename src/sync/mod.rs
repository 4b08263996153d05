//! Sync module.
//!
//! This module contains the synchronization of a folder pair. The
//! status folder records the state both sides agreed on after the
//! last synchronization, which tells which side changed since then.
//! Changes are propagated in four ordered passes per direction:
//! copy, delete, flags and labels.

pub mod report;
pub use report::{Changes, FolderReport, SyncReport};

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use std::{
    collections::{BTreeMap, HashSet},
    result,
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
};
use thiserror::Error;

use crate::{
    account::SyncSignals,
    folder::{self, Folder, FolderKind, MessageRecord},
    status::{self, StatusFolder},
    AccountConfig, Flag, Flags, HasSeverity, Labels, Semaphore, Severity,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("synchronization of folder {0} aborted")]
    AbortedError(String),
    #[error("copy worker of message {0} panicked")]
    CopyWorkerError(i64),

    #[error(transparent)]
    FolderError(#[from] folder::Error),
    #[error(transparent)]
    StatusError(#[from] status::Error),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        match self {
            Self::AbortedError(_) => Severity::Folder,
            Self::CopyWorkerError(_) => Severity::Message,
            Self::FolderError(err) => err.severity(),
            Self::StatusError(err) => err.severity(),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the options of a folder synchronization.
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Computes the changes without applying them.
    pub dry_run: bool,
    /// Propagates deletions.
    pub sync_deletes: bool,
    /// Skips the folder when no message count changed.
    pub quick: bool,
    pub min_uid: Option<i64>,
    pub min_date: Option<DateTime<Utc>>,
    pub remote_readonly: bool,
    pub local_readonly: bool,
    pub max_copy_workers: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            sync_deletes: true,
            quick: false,
            min_uid: None,
            min_date: None,
            remote_readonly: false,
            local_readonly: false,
            max_copy_workers: 1,
        }
    }
}

impl From<&AccountConfig> for SyncOptions {
    fn from(config: &AccountConfig) -> Self {
        Self {
            dry_run: config.dry_run(),
            sync_deletes: config.sync_deletes(),
            quick: config.quick(),
            min_uid: config.min_uid,
            min_date: config.min_date(),
            remote_readonly: config.remote_readonly(),
            local_readonly: config.local_readonly(),
            max_copy_workers: config.max_copy_workers(),
        }
    }
}

impl SyncOptions {
    fn is_restricted(&self) -> bool {
        self.min_uid.is_some() || self.min_date.is_some()
    }
}

/// Represents what happened to a copied message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Copied {
    /// The message was saved with its uid.
    Saved,
    /// The message was saved with a new uid, adopted by the source.
    Renamed(i64),
    /// The message was saved with an unknown uid. The source copy was
    /// removed, the message comes back with its new uid next time.
    Unknown,
    /// The message already existed, only the status was updated.
    Known,
    /// The destination refused the message.
    Refused,
    /// The message vanished from the source.
    Vanished,
}

fn side(folder: &dyn Folder) -> &'static str {
    match folder.kind() {
        FolderKind::Remote => "remote",
        FolderKind::Local | FolderKind::Mapped => "local",
    }
}

/// Groups the given uids by the flags to add and to remove.
fn group_by_flag<'a, I>(pairs: I) -> (BTreeMap<Flag, Vec<i64>>, BTreeMap<Flag, Vec<i64>>)
where
    I: Iterator<Item = (i64, &'a Flags, Flags)>,
{
    let mut add: BTreeMap<Flag, Vec<i64>> = BTreeMap::new();
    let mut del: BTreeMap<Flag, Vec<i64>> = BTreeMap::new();
    for (uid, src, status) in pairs {
        for flag in src.diff(&status).iter() {
            add.entry(*flag).or_default().push(uid);
        }
        for flag in status.diff(src).iter() {
            del.entry(*flag).or_default().push(uid);
        }
    }
    (add, del)
}

/// Represents the synchronization of a remote folder with its local
/// counterpart.
pub struct FolderSync<'a> {
    remote: &'a dyn Folder,
    local: &'a dyn Folder,
    status: Mutex<StatusFolder>,
    options: SyncOptions,
    copies: Option<&'a Semaphore>,
    signals: &'a SyncSignals,
}

impl<'a> FolderSync<'a> {
    pub fn new(
        remote: &'a dyn Folder,
        local: &'a dyn Folder,
        status: StatusFolder,
        signals: &'a SyncSignals,
    ) -> Self {
        Self {
            remote,
            local,
            status: Mutex::new(status),
            options: SyncOptions::default(),
            copies: None,
            signals,
        }
    }

    pub fn options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the semaphore bounding the concurrent copies, shared by
    /// every folder of the store.
    pub fn copies(mut self, copies: &'a Semaphore) -> Self {
        self.copies = Some(copies);
        self
    }

    pub fn into_status(self) -> StatusFolder {
        self.status.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<StatusFolder> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_abort(&self) -> Result<()> {
        if self.signals.is_aborted() {
            return Err(Error::AbortedError(self.remote.name().to_owned()));
        }
        Ok(())
    }

    /// Runs the passes in both directions, then saves the status.
    ///
    /// A failure owned by the folder interrupts the passes and is
    /// recorded in the report. More severe failures are returned.
    pub fn sync(&self) -> Result<FolderReport> {
        let mut report = FolderReport::new(self.remote.name());
        info!(
            "synchronizing folder {} with {}",
            self.remote.name(),
            self.local.name()
        );

        let res = self.run(&mut report);

        let flushed = if self.options.dry_run {
            Ok(())
        } else {
            self.status().flush()
        };

        match res {
            Ok(()) => {
                flushed?;
                debug!("folder {}: to local: {}", report.folder, report.to_local);
                debug!("folder {}: to remote: {}", report.folder, report.to_remote);
                Ok(report)
            }
            Err(err @ Error::AbortedError(_)) => Err(err),
            Err(err) if err.is_owned_by(Severity::Folder) => {
                warn!("skipping remaining passes of folder {}: {}", report.folder, err);
                if let Err(err) = flushed {
                    warn!("cannot save status of folder {}: {}", report.folder, err);
                }
                report.error = Some(err.to_string());
                Ok(report)
            }
            Err(err) => Err(err),
        }
    }

    fn run(&self, report: &mut FolderReport) -> Result<()> {
        self.check_abort()?;
        self.status().load()?;

        if self.options.quick && self.is_unchanged()? {
            info!("folder {} did not change, skipping it", report.folder);
            report.unchanged = true;
            return Ok(());
        }

        let (min_uid, min_date) = (self.options.min_uid, self.options.min_date);
        self.remote.cache_message_list(min_uid, min_date)?;
        self.local.cache_message_list(min_uid, min_date)?;

        if self.options.is_restricted() {
            let mut uids: HashSet<i64> = self.remote.message_list().uids().into_iter().collect();
            uids.extend(self.local.message_list().uids());
            self.status().restrict_to(&uids);
        }

        if self.options.local_readonly {
            debug!("local folder {} is read-only, skipping it", self.local.name());
        } else {
            self.sync_to(self.remote, self.local, false, &mut report.to_local)?;
        }

        if self.options.remote_readonly {
            debug!("remote folder {} is read-only, skipping it", self.remote.name());
        } else {
            self.sync_to(self.local, self.remote, true, &mut report.to_remote)?;
        }

        Ok(())
    }

    /// Returns `true` if both sides have as many messages as the
    /// status.
    fn is_unchanged(&self) -> Result<bool> {
        let count = self.status().len();
        Ok(self.remote.message_count()? == count && self.local.message_count()? == count)
    }

    fn sync_to(
        &self,
        src: &dyn Folder,
        dst: &dyn Folder,
        to_remote: bool,
        changes: &mut Changes,
    ) -> Result<()> {
        debug!("syncing {} folder {} to {}", side(src), src.name(), side(dst));

        self.copy_pass(src, dst, to_remote, changes)?;
        self.save_status()?;
        self.delete_pass(src, dst, changes)?;
        self.save_status()?;
        self.flags_pass(src, dst, changes)?;
        self.save_status()?;

        if src.supports_labels() && dst.supports_labels() {
            self.labels_pass(src, dst, changes)?;
            self.save_status()?;
        }

        Ok(())
    }

    fn save_status(&self) -> Result<()> {
        if !self.options.dry_run {
            self.status().flush()?;
        }
        Ok(())
    }

    /// Handles a failure of one message: skips the message when the
    /// failure does not concern more than the message.
    fn skip_message(&self, uid: i64, err: Error, changes: &mut Changes) -> Result<()> {
        if err.is_owned_by(Severity::Message) {
            warn!("skipping message {} of {}: {}", uid, self.remote.name(), err);
            changes.skipped += 1;
            Ok(())
        } else {
            Err(err)
        }
    }

    fn copy_pass(
        &self,
        src: &dyn Folder,
        dst: &dyn Folder,
        to_remote: bool,
        changes: &mut Changes,
    ) -> Result<()> {
        let uids: Vec<i64> = {
            let status = self.status();
            src.message_list()
                .keys()
                .filter(|uid| **uid < 0 || !status.uid_exists(**uid))
                .cloned()
                .collect()
        };

        // Positive local uids were all assigned by the remote side: the
        // ones the remote and the status forgot were deleted remotely.
        let (uids, kept): (Vec<i64>, Vec<i64>) = uids.into_iter().partition(|uid| {
            self.options.sync_deletes || !to_remote || *uid < 0 || dst.uid_exists(*uid)
        });
        if !kept.is_empty() {
            debug!(
                "deletions disabled, keeping {} message(s) deleted from remote folder {}",
                kept.len(),
                dst.name()
            );
        }

        if uids.is_empty() {
            return Ok(());
        }
        info!(
            "copying {} message(s) from {} to {} folder {}",
            uids.len(),
            side(src),
            side(dst),
            dst.name()
        );

        if self.options.dry_run {
            for uid in &uids {
                info!("would copy message {} to {}", uid, dst.name());
            }
            changes.copied += uids.len();
            return Ok(());
        }

        let results = if dst.suggests_workers() && self.options.max_copy_workers > 1 {
            self.copy_concurrently(src, dst, &uids)
        } else {
            let mut results = vec![];
            for uid in &uids {
                if self.signals.is_aborted() {
                    break;
                }
                results.push((*uid, self.copy_message(src, dst, *uid)));
            }
            results
        };
        self.check_abort()?;

        for (uid, res) in results {
            match res {
                Ok(Copied::Saved | Copied::Renamed(_) | Copied::Unknown) => changes.copied += 1,
                Ok(Copied::Refused) => changes.skipped += 1,
                Ok(Copied::Known | Copied::Vanished) => (),
                Err(err) => self.skip_message(uid, err, changes)?,
            }
        }

        Ok(())
    }

    fn copy_concurrently(
        &self,
        src: &dyn Folder,
        dst: &dyn Folder,
        uids: &[i64],
    ) -> Vec<(i64, Result<Copied>)> {
        let fallback;
        let copies = match self.copies {
            Some(copies) => copies,
            None => {
                fallback = Semaphore::new("copies", self.options.max_copy_workers);
                &fallback
            }
        };

        thread::scope(|scope| {
            let mut workers = vec![];
            for uid in uids.iter().cloned() {
                if self.signals.is_aborted() {
                    break;
                }
                let permit = copies.acquire();
                dst.wait_for_slot();
                let worker = scope.spawn(move || {
                    let _permit = permit;
                    self.copy_message(src, dst, uid)
                });
                workers.push((uid, worker));
            }

            workers
                .into_iter()
                .map(|(uid, worker)| {
                    let res = worker
                        .join()
                        .unwrap_or_else(|_| Err(Error::CopyWorkerError(uid)));
                    (uid, res)
                })
                .collect()
        })
    }

    /// Copies one message, applying the uid returned by the
    /// destination.
    fn copy_message(&self, src: &dyn Folder, dst: &dyn Folder, uid: i64) -> Result<Copied> {
        let record = match src.get_message(uid) {
            Some(record) => record,
            None => return Ok(Copied::Vanished),
        };

        if uid > 0 && dst.uid_exists(uid) {
            trace!("message {} already in {}, updating status", uid, dst.name());
            self.status().save_record(Self::status_record(uid, &record))?;
            return Ok(Copied::Known);
        }

        let content = src.fetch_message(uid)?;
        let new_uid = dst.save_message(uid, &content, &record.flags, record.received)?;

        if new_uid > 0 {
            let copied = if new_uid != uid {
                trace!("message {} got uid {} in {}", uid, new_uid, dst.name());
                src.change_identifier(uid, new_uid)?;
                self.status().change_identifier(uid, new_uid)?;
                Copied::Renamed(new_uid)
            } else {
                Copied::Saved
            };
            self.status().save_record(Self::status_record(new_uid, &record))?;
            Ok(copied)
        } else if new_uid == 0 {
            debug!(
                "message {} saved to {} with unknown uid, removing source copy",
                uid,
                dst.name()
            );
            src.delete_messages(&[uid])?;
            Ok(Copied::Unknown)
        } else {
            warn!("message {} refused by {}", uid, dst.name());
            Ok(Copied::Refused)
        }
    }

    fn status_record(uid: i64, record: &MessageRecord) -> MessageRecord {
        MessageRecord {
            uid,
            flags: record.flags.clone(),
            labels: Labels::default(),
            received: record.received,
            mod_time: 0,
        }
    }

    fn delete_pass(&self, src: &dyn Folder, dst: &dyn Folder, changes: &mut Changes) -> Result<()> {
        self.check_abort()?;
        let src_list = src.message_list();
        let uids: Vec<i64> = self
            .status()
            .message_list()
            .keys()
            .filter(|uid| **uid > 0 && !src_list.contains_key(uid))
            .cloned()
            .collect();
        if uids.is_empty() {
            return Ok(());
        }

        if self.options.dry_run {
            info!("would delete {} message(s) from {}", uids.len(), dst.name());
            changes.deleted += uids.len();
            return Ok(());
        }

        self.status().delete_records(&uids)?;

        if self.options.sync_deletes {
            info!(
                "deleting {} message(s) from {} folder {}",
                uids.len(),
                side(dst),
                dst.name()
            );
            dst.delete_messages(&uids)?;
            changes.deleted += uids.len();
        } else {
            debug!("deletions disabled, keeping {} message(s) in {}", uids.len(), dst.name());
        }

        Ok(())
    }

    fn flags_pass(&self, src: &dyn Folder, dst: &dyn Folder, changes: &mut Changes) -> Result<()> {
        self.check_abort()?;
        let src_list = src.message_list();
        let dst_list = dst.message_list();
        let (add, del) = {
            let status = self.status();
            group_by_flag(
                src_list
                    .values()
                    .filter(|record| record.uid > 0 && dst_list.contains_key(&record.uid))
                    .map(|record| {
                        let flags = status
                            .get_message(record.uid)
                            .map(|status| status.flags.clone())
                            .unwrap_or_default();
                        (record.uid, &record.flags, flags)
                    }),
            )
        };

        for (flag, uids) in add {
            self.check_abort()?;
            let flags = Flags::from_iter([flag]);
            info!("adding flags {} to {} message(s) of {}", flags, uids.len(), dst.name());
            if !self.options.dry_run {
                if let Err(err) = dst.add_flags(&uids, &flags) {
                    self.skip_change(Error::from(err), uids.len(), changes)?;
                    continue;
                }
                self.status().add_flags(&uids, &flags)?;
            }
            changes.flags_added += uids.len();
        }

        for (flag, uids) in del {
            self.check_abort()?;
            let flags = Flags::from_iter([flag]);
            info!("removing flags {} from {} message(s) of {}", flags, uids.len(), dst.name());
            if !self.options.dry_run {
                if let Err(err) = dst.remove_flags(&uids, &flags) {
                    self.skip_change(Error::from(err), uids.len(), changes)?;
                    continue;
                }
                self.status().remove_flags(&uids, &flags)?;
            }
            changes.flags_removed += uids.len();
        }

        Ok(())
    }

    /// Handles a failure of a bulk flag or label change, the same
    /// way as [`FolderSync::skip_message`].
    fn skip_change(&self, err: Error, count: usize, changes: &mut Changes) -> Result<()> {
        if err.is_owned_by(Severity::Message) {
            warn!("skipping change of {} message(s): {}", count, err);
            changes.skipped += count;
            Ok(())
        } else {
            Err(err)
        }
    }

    fn labels_pass(&self, src: &dyn Folder, dst: &dyn Folder, changes: &mut Changes) -> Result<()> {
        self.check_abort()?;
        let src_list = src.message_list();
        let dst_list = dst.message_list();

        let mut add: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        let mut del: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        let mut mod_times = vec![];
        {
            let status = self.status();
            for record in src_list.values() {
                if record.uid <= 0 || !dst_list.contains_key(&record.uid) {
                    continue;
                }
                let (labels, mod_time) = match status.get_message(record.uid) {
                    Some(status) => (status.labels.clone(), status.mod_time),
                    None => (Labels::default(), 0),
                };
                if record.mod_time > 0 && record.mod_time <= mod_time {
                    continue;
                }
                for label in record.labels.diff(&labels).iter() {
                    add.entry(label.clone()).or_default().push(record.uid);
                }
                for label in labels.diff(&record.labels).iter() {
                    del.entry(label.clone()).or_default().push(record.uid);
                }
                if record.mod_time > mod_time {
                    mod_times.push((record.uid, record.mod_time));
                }
            }
        }

        // Messages whose labels could not be changed keep their status
        // mod time, so the change is retried next time.
        let mut skipped: HashSet<i64> = HashSet::new();

        for (label, uids) in add {
            self.check_abort()?;
            let labels = Labels::from_iter([label]);
            info!("adding labels {} to {} message(s) of {}", labels, uids.len(), dst.name());
            if !self.options.dry_run {
                if let Err(err) = dst.add_labels(&uids, &labels) {
                    self.skip_change(Error::from(err), uids.len(), changes)?;
                    skipped.extend(uids);
                    continue;
                }
                self.status().add_labels(&uids, &labels)?;
            }
            changes.labels_added += uids.len();
        }

        for (label, uids) in del {
            self.check_abort()?;
            let labels = Labels::from_iter([label]);
            info!("removing labels {} from {} message(s) of {}", labels, uids.len(), dst.name());
            if !self.options.dry_run {
                if let Err(err) = dst.remove_labels(&uids, &labels) {
                    self.skip_change(Error::from(err), uids.len(), changes)?;
                    skipped.extend(uids);
                    continue;
                }
                self.status().remove_labels(&uids, &labels)?;
            }
            changes.labels_removed += uids.len();
        }

        if !self.options.dry_run {
            let mut status = self.status();
            for (uid, mod_time) in mod_times {
                if !skipped.contains(&uid) {
                    status.set_mod_time(uid, mod_time)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex, PoisonError,
        },
        thread,
        time::Duration,
    };
    use tempfile::tempdir;

    use super::{Error, FolderSync, SyncOptions};
    use crate::{
        account::SyncSignals,
        folder::{self, Folder, FolderKind, MappedFolder, MessageList, MessageRecord},
        status::StatusFolder,
        Flags, HasSeverity, Labels, Semaphore, Severity, StatusBackend,
    };

    /// Represents what a fake folder does when a message is saved.
    #[derive(Clone, Copy, Debug)]
    pub enum SaveMode {
        /// Keeps the given uid, or assigns the next one to negative
        /// uids.
        Keep,
        /// Always assigns a new uid.
        Assign,
        /// Stores the message without telling its uid.
        Unknown,
        Refuse,
    }

    #[derive(Debug)]
    pub struct FakeFolder {
        name: String,
        kind: FolderKind,
        mode: SaveMode,
        labels: bool,
        workers: bool,
        next_uid: AtomicUsize,
        /// Represents the messages stored in the fake server.
        messages: Mutex<MessageList>,
        list: Mutex<MessageList>,
        pub calls: Mutex<Vec<String>>,
        pub failing: Mutex<HashSet<i64>>,
        running: AtomicUsize,
        pub max_running: AtomicUsize,
    }

    impl FakeFolder {
        pub fn new(kind: FolderKind, mode: SaveMode) -> Self {
            Self {
                name: "INBOX".into(),
                kind,
                mode,
                labels: false,
                workers: false,
                next_uid: AtomicUsize::new(100),
                messages: Mutex::default(),
                list: Mutex::default(),
                calls: Mutex::default(),
                failing: Mutex::default(),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }

        pub fn with_labels(mut self) -> Self {
            self.labels = true;
            self
        }

        pub fn with_workers(mut self) -> Self {
            self.workers = true;
            self
        }

        pub fn insert(&self, uid: i64, flags: &str) {
            self.messages
                .lock()
                .unwrap()
                .insert_record(MessageRecord::new(uid, Flags::from(flags)));
        }

        pub fn insert_record(&self, record: MessageRecord) {
            self.messages.lock().unwrap().insert_record(record);
        }

        pub fn stored(&self) -> MessageList {
            self.messages.lock().unwrap().clone()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn call(&self, call: String) {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
        }

        fn mutations(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|call| !call.starts_with("fetch"))
                .collect()
        }

        fn check_failing(&self, uids: &[i64]) -> folder::Result<()> {
            let failing = self.failing.lock().unwrap();
            match uids.iter().find(|uid| failing.contains(uid)) {
                Some(uid) => Err(folder::Error::FindMessageError(self.name.clone(), *uid)),
                None => Ok(()),
            }
        }

        fn update<U: Fn(&mut MessageRecord)>(&self, uids: &[i64], update: U) {
            for list in [&self.messages, &self.list] {
                let mut list = list.lock().unwrap();
                for uid in uids {
                    if let Some(record) = list.get_mut(uid) {
                        update(record);
                    }
                }
            }
        }
    }

    impl Folder for FakeFolder {
        fn name(&self) -> &str {
            &self.name
        }

        fn sep(&self) -> char {
            '/'
        }

        fn kind(&self) -> FolderKind {
            self.kind
        }

        fn suggests_workers(&self) -> bool {
            self.workers
        }

        fn supports_labels(&self) -> bool {
            self.labels
        }

        fn cache_message_list(
            &self,
            min_uid: Option<i64>,
            _min_date: Option<DateTime<Utc>>,
        ) -> folder::Result<()> {
            let list = self
                .stored()
                .values()
                .filter(|record| min_uid.map(|min| record.uid >= min).unwrap_or(true))
                .cloned()
                .collect();
            *self.list.lock().unwrap() = list;
            Ok(())
        }

        fn drop_message_list(&self) {
            *self.list.lock().unwrap() = MessageList::default();
        }

        fn message_list(&self) -> MessageList {
            self.list.lock().unwrap().clone()
        }

        fn get_message(&self, uid: i64) -> Option<MessageRecord> {
            self.list.lock().unwrap().get(&uid).cloned()
        }

        fn message_count(&self) -> folder::Result<usize> {
            Ok(self.messages.lock().unwrap().len())
        }

        fn fetch_message(&self, uid: i64) -> folder::Result<Vec<u8>> {
            self.call(format!("fetch {}", uid));
            if self.failing.lock().unwrap().contains(&uid) {
                return Err(folder::Error::FindMessageError(self.name.clone(), uid));
            }
            Ok(format!("message {}", uid).into_bytes())
        }

        fn save_message(
            &self,
            uid: i64,
            _content: &[u8],
            flags: &Flags,
            _received: Option<DateTime<Utc>>,
        ) -> folder::Result<i64> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            if self.workers {
                thread::sleep(Duration::from_millis(5));
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            self.call(format!("save {}", uid));
            let next_uid = || self.next_uid.fetch_add(1, Ordering::SeqCst) as i64;
            let (stored, returned) = match self.mode {
                SaveMode::Keep if uid > 0 => (uid, uid),
                SaveMode::Keep | SaveMode::Assign => {
                    let new = next_uid();
                    (new, new)
                }
                SaveMode::Unknown => (next_uid(), 0),
                SaveMode::Refuse => return Ok(-1),
            };
            let record = MessageRecord::new(stored, flags.clone());
            self.messages.lock().unwrap().insert_record(record.clone());
            if returned > 0 {
                self.list.lock().unwrap().insert_record(record);
            }
            Ok(returned)
        }

        fn add_flags(&self, uids: &[i64], flags: &Flags) -> folder::Result<()> {
            self.call(format!("add flags {} {:?}", flags, uids));
            self.update(uids, |record| record.flags.extend(flags.iter().cloned()));
            Ok(())
        }

        fn remove_flags(&self, uids: &[i64], flags: &Flags) -> folder::Result<()> {
            self.call(format!("remove flags {} {:?}", flags, uids));
            self.update(uids, |record| record.flags.retain(|f| !flags.contains(f)));
            Ok(())
        }

        fn add_labels(&self, uids: &[i64], labels: &Labels) -> folder::Result<()> {
            self.call(format!("add labels {} {:?}", labels, uids));
            self.check_failing(uids)?;
            self.update(uids, |record| record.labels.extend(labels.iter().cloned()));
            Ok(())
        }

        fn remove_labels(&self, uids: &[i64], labels: &Labels) -> folder::Result<()> {
            self.call(format!("remove labels {} {:?}", labels, uids));
            self.check_failing(uids)?;
            self.update(uids, |record| record.labels.retain(|l| !labels.contains(l)));
            Ok(())
        }

        fn delete_messages(&self, uids: &[i64]) -> folder::Result<()> {
            self.call(format!("delete {:?}", uids));
            for uid in uids {
                self.messages.lock().unwrap().remove(uid);
                self.list.lock().unwrap().remove(uid);
            }
            Ok(())
        }

        fn change_identifier(&self, old: i64, new: i64) -> folder::Result<()> {
            self.call(format!("rename {} {}", old, new));
            self.messages.lock().unwrap().rename(old, new);
            self.list.lock().unwrap().rename(old, new);
            Ok(())
        }
    }

    fn sync(
        remote: &FakeFolder,
        local: &FakeFolder,
        status: StatusFolder,
        options: SyncOptions,
    ) -> (super::FolderReport, StatusFolder) {
        let signals = SyncSignals::new();
        let sync = FolderSync::new(remote, local, status, &signals).options(options);
        let report = sync.sync().unwrap();
        (report, sync.into_status())
    }

    fn status(dir: &std::path::Path) -> StatusFolder {
        StatusFolder::open(dir, "INBOX", &StatusBackend::Plain)
    }

    fn pair() -> (FakeFolder, FakeFolder) {
        (
            FakeFolder::new(FolderKind::Remote, SaveMode::Assign),
            FakeFolder::new(FolderKind::Local, SaveMode::Keep),
        )
    }

    #[test]
    fn copy_both_ways_then_idempotent() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        remote.insert(1, "S");
        remote.insert(2, "");
        local.insert(-1, "F");

        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_local.copied, 2);
        assert_eq!(report.to_remote.copied, 1);
        assert_eq!(status.message_list().uids(), vec![1, 2, 100]);
        assert_eq!(local.stored().uids(), vec![1, 2, 100]);
        assert_eq!(remote.stored().uids(), vec![1, 2, 100]);
        assert!(local.calls().contains(&"rename -1 100".to_owned()));

        let remote_calls = remote.calls().len();
        let local_calls = local.calls().len();
        let (report, _) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert!(report.to_local.is_empty());
        assert!(report.to_remote.is_empty());
        assert_eq!(remote.calls().len(), remote_calls);
        assert_eq!(local.calls().len(), local_calls);
    }

    #[test]
    fn known_uid_only_updates_status() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        remote.insert(7, "S");
        local.insert(7, "S");

        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert!(report.to_local.is_empty());
        assert!(status.uid_exists(7));
        assert!(local.mutations().is_empty());
        assert!(remote.mutations().is_empty());
    }

    #[test]
    fn unknown_uid_removes_source_copy() {
        let dir = tempdir().unwrap();
        let remote = FakeFolder::new(FolderKind::Remote, SaveMode::Unknown);
        let local = FakeFolder::new(FolderKind::Local, SaveMode::Keep);
        local.insert(-1, "");

        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_remote.copied, 1);
        assert!(local.stored().is_empty());
        assert!(status.is_empty());
        assert_eq!(remote.stored().uids(), vec![100]);

        // the message comes back with its uid
        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_local.copied, 1);
        assert_eq!(local.stored().uids(), vec![100]);
        assert_eq!(status.message_list().uids(), vec![100]);
    }

    #[test]
    fn refused_messages_are_skipped() {
        let dir = tempdir().unwrap();
        let remote = FakeFolder::new(FolderKind::Remote, SaveMode::Refuse);
        let local = FakeFolder::new(FolderKind::Local, SaveMode::Keep);
        local.insert(-1, "");

        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_remote.skipped, 1);
        assert_eq!(local.stored().uids(), vec![-1]);
        assert!(status.is_empty());
    }

    #[test]
    fn mapped_local_folder_follows_save_contract() {
        for (mode, copied, skipped) in [
            (SaveMode::Keep, 1, 0),
            (SaveMode::Unknown, 1, 0),
            (SaveMode::Refuse, 0, 1),
        ] {
            let dir = tempdir().unwrap();
            let remote = FakeFolder::new(FolderKind::Remote, SaveMode::Assign);
            remote.insert(7, "S");
            let inner = FakeFolder::new(FolderKind::Local, mode);
            let local = MappedFolder::new(inner, dir.path().join("uid-map")).unwrap();

            let signals = SyncSignals::new();
            let sync = FolderSync::new(&remote, &local, self::status(dir.path()), &signals);
            let report = sync.sync().unwrap();
            assert_eq!(report.to_local.copied, copied, "{:?}", mode);
            assert_eq!(report.to_local.skipped, skipped, "{:?}", mode);
            assert!(report.to_remote.is_empty(), "{:?}", mode);
            assert_eq!(remote.stored().uids(), vec![7], "{:?}", mode);
            assert!(remote.mutations().is_empty(), "{:?}", mode);

            if copied == 0 {
                assert!(local.inner().stored().is_empty());
                assert!(sync.into_status().is_empty());
                continue;
            }

            assert_eq!(local.inner().stored().uids(), vec![100], "{:?}", mode);
            assert_eq!(local.message_list().uids(), vec![7], "{:?}", mode);
            assert_eq!(sync.into_status().message_list().uids(), vec![7]);

            // the mapping makes the next run a no-op
            let sync = FolderSync::new(&remote, &local, self::status(dir.path()), &signals);
            let report = sync.sync().unwrap();
            assert!(report.to_local.is_empty(), "{:?}", mode);
            assert!(report.to_remote.is_empty(), "{:?}", mode);
            assert_eq!(local.inner().stored().uids(), vec![100], "{:?}", mode);
        }
    }

    #[test]
    fn failing_message_is_skipped() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        remote.insert(1, "");
        remote.insert(2, "");
        remote.failing.lock().unwrap().insert(1);

        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_local.copied, 1);
        assert_eq!(report.to_local.skipped, 1);
        assert_eq!(status.message_list().uids(), vec![2]);
        assert!(report.error.is_none());
    }

    #[test]
    fn deletions_follow_status() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        remote.insert(1, "");
        remote.insert(2, "");
        sync(&remote, &local, self::status(dir.path()), SyncOptions::default());

        // deleted remotely, and a local message the status never saw
        remote.delete_messages(&[1]).unwrap();
        local.insert(-1, "");
        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_local.deleted, 1);
        assert_eq!(local.stored().uids(), vec![2, 100]);
        assert_eq!(status.message_list().uids(), vec![2, 100]);
    }

    #[test]
    fn deletions_can_be_disabled() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        remote.insert(5, "");
        sync(&remote, &local, self::status(dir.path()), SyncOptions::default());

        remote.delete_messages(&[5]).unwrap();
        let options = SyncOptions {
            sync_deletes: false,
            ..SyncOptions::default()
        };
        for _ in 0..2 {
            let (report, status) = sync(&remote, &local, self::status(dir.path()), options.clone());
            assert!(report.to_local.is_empty());
            assert!(report.to_remote.is_empty());
            assert_eq!(local.stored().uids(), vec![5]);
            assert!(remote.stored().is_empty());
            assert!(status.is_empty());
        }
        assert!(!remote.calls().iter().any(|call| call.starts_with("save")));
        assert!(!local.calls().iter().any(|call| call.starts_with("rename")));

        // new local messages are still uploaded
        local.insert(-1, "");
        let (report, _) = sync(&remote, &local, self::status(dir.path()), options);
        assert_eq!(report.to_remote.copied, 1);
        assert_eq!(remote.stored().uids(), vec![100]);
        assert_eq!(local.stored().uids(), vec![5, 100]);
    }

    #[test]
    fn flags_are_grouped() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        for uid in 1..=3 {
            remote.insert(uid, "S");
        }
        sync(&remote, &local, self::status(dir.path()), SyncOptions::default());

        remote.update(&[1, 2], |record| record.flags = Flags::from("FS"));
        remote.update(&[3], |record| record.flags = Flags::default());
        local.calls.lock().unwrap().clear();

        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_local.flags_added, 2);
        assert_eq!(report.to_local.flags_removed, 1);
        assert_eq!(
            local.mutations(),
            vec!["add flags F [1, 2]", "remove flags S [3]"]
        );
        assert_eq!(status.get_message(1).unwrap().flags, Flags::from("FS"));
        assert!(status.get_message(3).unwrap().flags.is_empty());
        assert!(report.to_remote.is_empty());
    }

    #[test]
    fn labels_follow_mod_time() {
        let dir = tempdir().unwrap();
        let remote = FakeFolder::new(FolderKind::Remote, SaveMode::Assign).with_labels();
        let local = FakeFolder::new(FolderKind::Local, SaveMode::Keep).with_labels();
        remote.insert_record(MessageRecord {
            uid: 1,
            labels: Labels::from("work"),
            ..MessageRecord::default()
        });

        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_local.labels_added, 1);
        assert_eq!(local.stored().get(&1).unwrap().labels, Labels::from("work"));
        assert_eq!(status.get_message(1).unwrap().labels, Labels::from("work"));

        // a local change older than the status is ignored
        local.update(&[1], |record| {
            record.labels = Labels::from("old");
            record.mod_time = 10;
        });
        let mut status = status;
        status.set_mod_time(1, 20).unwrap();
        status.flush().unwrap();
        let (report, _) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_remote.labels_added, 0);

        // a newer one is propagated
        local.update(&[1], |record| record.mod_time = 30);
        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_remote.labels_added, 1);
        assert_eq!(report.to_remote.labels_removed, 1);
        assert_eq!(remote.stored().get(&1).unwrap().labels, Labels::from("old"));
        assert_eq!(status.get_message(1).unwrap().mod_time, 30);
    }

    #[test]
    fn failing_label_change_is_skipped() {
        let dir = tempdir().unwrap();
        let remote = FakeFolder::new(FolderKind::Remote, SaveMode::Assign).with_labels();
        let local = FakeFolder::new(FolderKind::Local, SaveMode::Keep).with_labels();
        for (uid, label) in [(1, "work"), (2, "home")] {
            remote.insert_record(MessageRecord {
                uid,
                labels: Labels::from(label),
                ..MessageRecord::default()
            });
        }
        local.failing.lock().unwrap().insert(2);

        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert!(report.error.is_none());
        assert_eq!(report.to_local.copied, 2);
        assert_eq!(report.to_local.labels_added, 1);
        assert_eq!(report.to_local.skipped, 1);
        assert_eq!(status.get_message(1).unwrap().labels, Labels::from("work"));
        assert!(status.get_message(2).unwrap().labels.is_empty());

        local.failing.lock().unwrap().clear();
        let (report, status) = sync(&remote, &local, self::status(dir.path()), SyncOptions::default());
        assert_eq!(report.to_local.labels_added, 1);
        assert_eq!(local.stored().get(&2).unwrap().labels, Labels::from("home"));
        assert_eq!(status.get_message(2).unwrap().labels, Labels::from("home"));
    }

    #[test]
    fn sqlite_status_backend() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        remote.insert(1, "S");
        remote.insert(2, "");
        local.insert(-1, "F");
        let status = || StatusFolder::open(dir.path(), "INBOX", &StatusBackend::Sqlite);

        let (report, _) = sync(&remote, &local, status(), SyncOptions::default());
        assert_eq!(report.to_local.copied, 2);
        assert_eq!(report.to_remote.copied, 1);

        remote.update(&[2], |record| record.flags = Flags::from("R"));
        remote.delete_messages(&[1]).unwrap();
        let (report, status) = sync(&remote, &local, status(), SyncOptions::default());
        assert_eq!(report.to_local.deleted, 1);
        assert_eq!(report.to_local.flags_added, 1);
        assert!(report.to_remote.is_empty());
        assert_eq!(local.stored().uids(), vec![2, 100]);
        assert_eq!(status.message_list().uids(), vec![2, 100]);
        assert_eq!(status.get_message(2).unwrap().flags, Flags::from("R"));

        let mut reloaded = StatusFolder::open(dir.path(), "INBOX", &StatusBackend::Sqlite);
        reloaded.load().unwrap();
        assert_eq!(reloaded.message_list().uids(), vec![2, 100]);
    }

    #[test]
    fn dry_run_changes_nothing() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        remote.insert(1, "S");
        local.insert(-1, "");

        let options = SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        };
        let (report, status) = sync(&remote, &local, self::status(dir.path()), options);
        assert_eq!(report.to_local.copied, 1);
        assert_eq!(report.to_remote.copied, 1);
        assert!(remote.mutations().is_empty());
        assert!(local.mutations().is_empty());
        assert!(status.is_empty());
        assert!(!dir.path().join("INBOX").exists());
    }

    #[test]
    fn quick_mode_skips_unchanged_folders() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        remote.insert(1, "");
        sync(&remote, &local, self::status(dir.path()), SyncOptions::default());

        // a flag change is invisible to quick mode
        remote.update(&[1], |record| record.flags = Flags::from("S"));
        let options = SyncOptions {
            quick: true,
            ..SyncOptions::default()
        };
        let (report, _) = sync(&remote, &local, self::status(dir.path()), options.clone());
        assert!(report.unchanged);

        remote.insert(2, "");
        let (report, _) = sync(&remote, &local, self::status(dir.path()), options);
        assert!(!report.unchanged);
        assert_eq!(report.to_local.copied, 1);
        assert_eq!(report.to_local.flags_added, 1);
    }

    #[test]
    fn restriction_hides_old_status_records() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        for uid in 1..=4 {
            remote.insert(uid, "");
        }
        sync(&remote, &local, self::status(dir.path()), SyncOptions::default());

        let options = SyncOptions {
            min_uid: Some(3),
            ..SyncOptions::default()
        };
        let (report, status) = sync(&remote, &local, self::status(dir.path()), options);
        assert_eq!(report.to_local.deleted, 0);
        assert_eq!(status.message_list().uids(), vec![3, 4]);
        assert_eq!(local.stored().uids(), vec![1, 2, 3, 4]);

        let mut status = self::status(dir.path());
        status.load().unwrap();
        assert_eq!(status.message_list().uids(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn copies_are_bounded() {
        let dir = tempdir().unwrap();
        let remote = FakeFolder::new(FolderKind::Remote, SaveMode::Assign);
        let local = FakeFolder::new(FolderKind::Local, SaveMode::Keep).with_workers();
        for uid in 1..=12 {
            remote.insert(uid, "");
        }

        let signals = SyncSignals::new();
        let copies = Semaphore::new("copies:test", 3);
        let options = SyncOptions {
            max_copy_workers: 3,
            ..SyncOptions::default()
        };
        let sync = FolderSync::new(&remote, &local, self::status(dir.path()), &signals)
            .options(options)
            .copies(&copies);
        let report = sync.sync().unwrap();

        assert_eq!(report.to_local.copied, 12);
        assert!(local.max_running.load(Ordering::SeqCst) <= 3);
        assert!(copies.peak() <= 3);
        assert_eq!(sync.into_status().len(), 12);
    }

    #[test]
    fn abort_stops_the_passes() {
        let dir = tempdir().unwrap();
        let (remote, local) = pair();
        remote.insert(1, "");

        let signals = SyncSignals::new();
        signals.abort_now();
        let sync = FolderSync::new(&remote, &local, self::status(dir.path()), &signals);
        let err = sync.sync().unwrap_err();
        assert!(matches!(err, Error::AbortedError(_)));
        assert_eq!(err.severity(), Severity::Folder);
        assert!(local.stored().is_empty());
    }
}
