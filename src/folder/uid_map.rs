//! UID map module.
//!
//! This module contains the persisted bijection between the uids of
//! a local folder and the uids of its remote counterpart, and the
//! folder decorator presenting a local folder in the remote uid
//! space. It is used when the local store assigns its own uids, like
//! an IMAP server does.

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    result,
    sync::{Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

use crate::{
    folder::{self, Folder, FolderKind, MessageList, MessageRecord},
    Flags, HasSeverity, Labels, Severity,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open uid map file {1}")]
    OpenFileError(#[source] io::Error, PathBuf),
    #[error("cannot read line from uid map file {1}")]
    ReadLineError(#[source] io::Error, PathBuf),
    #[error("cannot parse line {1:?} of uid map file {0}")]
    ParseLineError(PathBuf, String),
    #[error("cannot write uid map file {1}")]
    WriteFileError(#[source] io::Error, PathBuf),
    #[error("cannot find the local uid of message {1} saved to {0}")]
    UnknownLocalUidError(String, i64),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        match self {
            Self::UnknownLocalUidError(..) => Severity::Message,
            _ => Severity::Folder,
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the bijection between local and remote uids, persisted
/// as one `local:remote` pair per line.
#[derive(Debug, Default)]
pub struct UidMapTable {
    path: PathBuf,
    local_to_remote: HashMap<i64, i64>,
    remote_to_local: HashMap<i64, i64>,
}

impl UidMapTable {
    /// Loads the table from the given file. A missing file is an
    /// empty table.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let mut table = Self {
            path: path.clone(),
            ..Self::default()
        };

        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("uid map {:?} not found, starting empty", path);
                return Ok(table);
            }
            Err(err) => return Err(Error::OpenFileError(err, path)),
        };

        for line in io::BufReader::new(file).lines() {
            let line = line.map_err(|err| Error::ReadLineError(err, path.clone()))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (local, remote) = line
                .split_once(':')
                .and_then(|(l, r)| Some((l.parse::<i64>().ok()?, r.parse::<i64>().ok()?)))
                .ok_or_else(|| Error::ParseLineError(path.clone(), line.to_owned()))?;
            table.insert(local, remote);
        }

        trace!("loaded uid map {:?}: {:?}", path, table.local_to_remote);
        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.local_to_remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_to_remote.is_empty()
    }

    pub fn remote(&self, local: i64) -> Option<i64> {
        self.local_to_remote.get(&local).cloned()
    }

    pub fn local(&self, remote: i64) -> Option<i64> {
        self.remote_to_local.get(&remote).cloned()
    }

    /// Maps the given pair, replacing any previous mapping of either
    /// uid so that the table stays a bijection.
    pub fn insert(&mut self, local: i64, remote: i64) {
        if let Some(previous_remote) = self.local_to_remote.remove(&local) {
            self.remote_to_local.remove(&previous_remote);
        }
        if let Some(previous_local) = self.remote_to_local.remove(&remote) {
            self.local_to_remote.remove(&previous_local);
        }
        self.local_to_remote.insert(local, remote);
        self.remote_to_local.insert(remote, local);
    }

    pub fn remove_remote(&mut self, remote: i64) -> Option<i64> {
        let local = self.remote_to_local.remove(&remote)?;
        self.local_to_remote.remove(&local);
        Some(local)
    }

    /// Removes the pairs whose local uid does not satisfy the given
    /// predicate. Returns the number of removed pairs.
    pub fn prune<F: Fn(i64) -> bool>(&mut self, keep: F) -> usize {
        let stale: Vec<i64> = self
            .local_to_remote
            .keys()
            .filter(|local| !keep(**local))
            .cloned()
            .collect();
        for local in &stale {
            if let Some(remote) = self.local_to_remote.remove(local) {
                self.remote_to_local.remove(&remote);
            }
        }
        stale.len()
    }

    /// Writes the table to a temporary file, then renames it over the
    /// previous one.
    pub fn save(&self) -> Result<()> {
        let mut pairs: Vec<_> = self.local_to_remote.iter().collect();
        pairs.sort();

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        let write = || -> io::Result<()> {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = fs::File::create(&tmp_path)?;
            for (local, remote) in pairs {
                writeln!(file, "{}:{}", local, remote)?;
            }
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };
        write().map_err(|err| Error::WriteFileError(err, self.path.clone()))?;

        trace!("saved uid map {:?}", self.path);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MappedState {
    table: UidMapTable,
    /// Local uids of the messages not mapped yet, indexed by their
    /// synthetic negative remote uid.
    unmapped: HashMap<i64, i64>,
    list: MessageList,
}

impl MappedState {
    fn local(&self, remote: i64) -> Option<i64> {
        if remote < 0 {
            self.unmapped.get(&remote).cloned()
        } else {
            self.table.local(remote)
        }
    }

    fn locals(&self, remotes: &[i64]) -> Vec<i64> {
        remotes
            .iter()
            .filter_map(|remote| self.local(*remote))
            .collect()
    }
}

/// Represents a local folder presented in the remote uid space.
///
/// Local messages without a remote counterpart get synthetic
/// negative uids, so the synchronization sees them as new.
#[derive(Debug)]
pub struct MappedFolder<F: Folder> {
    inner: F,
    state: Mutex<MappedState>,
}

impl<F: Folder> MappedFolder<F> {
    pub fn new<P: AsRef<Path>>(inner: F, uid_map_path: P) -> Result<Self> {
        let table = UidMapTable::load(uid_map_path)?;
        Ok(Self {
            inner,
            state: Mutex::new(MappedState {
                table,
                ..MappedState::default()
            }),
        })
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    fn state(&self) -> MutexGuard<MappedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locals(&self, remotes: &[i64]) -> Vec<i64> {
        self.state().locals(remotes)
    }

    /// Finds the local uid of a message the local store saved without
    /// telling its uid: the only local message neither mapped nor
    /// already known as unmapped.
    fn find_saved_uid(&self) -> folder::Result<Option<i64>> {
        self.inner.cache_message_list(None, None)?;
        let local_list = self.inner.message_list();

        let state = self.state();
        let unmapped: HashSet<i64> = state.unmapped.values().cloned().collect();
        let candidates: Vec<i64> = local_list
            .keys()
            .filter(|local| {
                **local > 0 && state.table.remote(**local).is_none() && !unmapped.contains(local)
            })
            .cloned()
            .collect();

        match candidates[..] {
            [local] => {
                debug!("found saved message of {} as local uid {}", self.name(), local);
                Ok(Some(local))
            }
            _ => {
                warn!(
                    "cannot tell the uid of the saved message among {} candidate(s) of {}",
                    candidates.len(),
                    self.name()
                );
                Ok(None)
            }
        }
    }

    fn update_flags<U: Fn(&mut Flags)>(&self, remotes: &[i64], update: U) {
        let mut state = self.state();
        for remote in remotes {
            if let Some(record) = state.list.get_mut(remote) {
                update(&mut record.flags)
            }
        }
    }

    fn update_labels<U: Fn(&mut Labels)>(&self, remotes: &[i64], update: U) {
        let mut state = self.state();
        for remote in remotes {
            if let Some(record) = state.list.get_mut(remote) {
                update(&mut record.labels)
            }
        }
    }
}

impl<F: Folder> Folder for MappedFolder<F> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn sep(&self) -> char {
        self.inner.sep()
    }

    fn kind(&self) -> FolderKind {
        FolderKind::Mapped
    }

    fn suggests_workers(&self) -> bool {
        self.inner.suggests_workers()
    }

    fn wait_for_slot(&self) {
        self.inner.wait_for_slot()
    }

    fn supports_labels(&self) -> bool {
        self.inner.supports_labels()
    }

    fn cache_message_list(
        &self,
        min_uid: Option<i64>,
        min_date: Option<DateTime<Utc>>,
    ) -> folder::Result<()> {
        folder::check_restrictions(self.name(), min_uid, min_date)?;

        // min_uid belongs to the remote uid space, so it is applied
        // after the translation.
        self.inner.cache_message_list(None, min_date)?;
        let local_list = self.inner.message_list();

        let mut state = self.state();

        if min_date.is_none() {
            let pruned = state.table.prune(|local| local_list.contains_key(&local));
            if pruned > 0 {
                debug!("pruned {} stale uid map entries of {}", pruned, self.name());
                state.table.save()?;
            }
        }

        let mut list = MessageList::default();
        let mut unmapped = HashMap::new();
        for (local, record) in local_list.iter() {
            let remote = match state.table.remote(*local) {
                Some(remote) => {
                    if min_uid.map(|min| remote < min).unwrap_or_default() {
                        continue;
                    }
                    remote
                }
                None => {
                    let remote = list.next_negative_uid();
                    unmapped.insert(remote, *local);
                    remote
                }
            };
            list.insert_record(MessageRecord {
                uid: remote,
                ..record.clone()
            });
        }

        state.list = list;
        state.unmapped = unmapped;
        Ok(())
    }

    fn drop_message_list(&self) {
        let mut state = self.state();
        state.list.clear();
        state.unmapped.clear();
        drop(state);
        self.inner.drop_message_list();
    }

    fn message_list(&self) -> MessageList {
        self.state().list.clone()
    }

    fn get_message(&self, uid: i64) -> Option<MessageRecord> {
        self.state().list.get(&uid).cloned()
    }

    fn message_count(&self) -> folder::Result<usize> {
        self.inner.message_count()
    }

    fn fetch_message(&self, uid: i64) -> folder::Result<Vec<u8>> {
        let local = self
            .state()
            .local(uid)
            .ok_or_else(|| folder::Error::FindMessageError(self.name().to_owned(), uid))?;
        self.inner.fetch_message(local)
    }

    fn save_message(
        &self,
        uid: i64,
        content: &[u8],
        flags: &Flags,
        received: Option<DateTime<Utc>>,
    ) -> folder::Result<i64> {
        if uid > 0 && self.state().table.local(uid).is_some() {
            debug!("message {} already mapped in {}, updating flags", uid, self.name());
            let current = self.get_message(uid).map(|r| r.flags).unwrap_or_default();
            self.add_flags(&[uid], &flags.diff(&current))?;
            self.remove_flags(&[uid], &current.diff(flags))?;
            return Ok(uid);
        }

        // Only the remote side assigns uids in this uid space.
        if uid <= 0 {
            warn!("cannot save message {} to {} without a remote uid", uid, self.name());
            return Ok(-1);
        }

        let local = match self.inner.save_message(-1, content, flags, received)? {
            0 => self
                .find_saved_uid()?
                .ok_or_else(|| Error::UnknownLocalUidError(self.name().to_owned(), uid))?,
            local if local < 0 => {
                warn!("local store of {} refused message {}", self.name(), uid);
                return Ok(local);
            }
            local => local,
        };

        let mut state = self.state();
        state.table.insert(local, uid);
        state.table.save()?;
        state.list.insert_record(MessageRecord {
            uid,
            flags: flags.clone(),
            received,
            ..MessageRecord::default()
        });

        Ok(uid)
    }

    fn add_flags(&self, uids: &[i64], flags: &Flags) -> folder::Result<()> {
        if flags.is_empty() {
            return Ok(());
        }
        self.inner.add_flags(&self.locals(uids), flags)?;
        self.update_flags(uids, |current| current.extend(flags.iter().cloned()));
        Ok(())
    }

    fn remove_flags(&self, uids: &[i64], flags: &Flags) -> folder::Result<()> {
        if flags.is_empty() {
            return Ok(());
        }
        self.inner.remove_flags(&self.locals(uids), flags)?;
        self.update_flags(uids, |current| current.retain(|f| !flags.contains(f)));
        Ok(())
    }

    fn add_labels(&self, uids: &[i64], labels: &Labels) -> folder::Result<()> {
        self.inner.add_labels(&self.locals(uids), labels)?;
        self.update_labels(uids, |current| current.extend(labels.iter().cloned()));
        Ok(())
    }

    fn remove_labels(&self, uids: &[i64], labels: &Labels) -> folder::Result<()> {
        self.inner.remove_labels(&self.locals(uids), labels)?;
        self.update_labels(uids, |current| current.retain(|l| !labels.contains(l)));
        Ok(())
    }

    fn delete_messages(&self, uids: &[i64]) -> folder::Result<()> {
        let locals = self.locals(uids);
        if !locals.is_empty() {
            self.inner.delete_messages(&locals)?;
        }

        let mut state = self.state();
        for uid in uids {
            if *uid < 0 {
                state.unmapped.remove(uid);
            } else {
                state.table.remove_remote(*uid);
            }
            state.list.remove(uid);
        }
        state.table.save()?;
        Ok(())
    }

    fn change_identifier(&self, old: i64, new: i64) -> folder::Result<()> {
        let mut state = self.state();
        let local = match state.local(old) {
            Some(local) => local,
            None => return Err(folder::Error::FindMessageError(self.name().to_owned(), old)),
        };
        state.unmapped.remove(&old);
        state.table.insert(local, new);
        state.table.save()?;
        state.list.rename(old, new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use std::sync::{Mutex, PoisonError};
    use tempfile::tempdir;

    use super::{MappedFolder, UidMapTable};
    use crate::{
        folder::{self, Folder, FolderKind, MessageList, MessageRecord},
        Flags,
    };

    /// In-memory local folder assigning its own uids.
    #[derive(Debug, Default)]
    struct LocalFolder {
        messages: Mutex<(i64, MessageList)>,
    }

    impl LocalFolder {
        fn with(uids: &[i64]) -> Self {
            let folder = Self::default();
            {
                let mut messages = folder.messages.lock().unwrap();
                for uid in uids {
                    messages.1.insert_record(MessageRecord::new(*uid, Flags::default()));
                    messages.0 = messages.0.max(*uid);
                }
            }
            folder
        }
    }

    impl Folder for LocalFolder {
        fn name(&self) -> &str {
            "INBOX"
        }
        fn sep(&self) -> char {
            '/'
        }
        fn kind(&self) -> FolderKind {
            FolderKind::Local
        }
        fn cache_message_list(
            &self,
            _: Option<i64>,
            _: Option<DateTime<Utc>>,
        ) -> folder::Result<()> {
            Ok(())
        }
        fn drop_message_list(&self) {}
        fn message_list(&self) -> MessageList {
            self.messages.lock().unwrap().1.clone()
        }
        fn get_message(&self, uid: i64) -> Option<MessageRecord> {
            self.messages.lock().unwrap().1.get(&uid).cloned()
        }
        fn message_count(&self) -> folder::Result<usize> {
            Ok(self.messages.lock().unwrap().1.len())
        }
        fn fetch_message(&self, uid: i64) -> folder::Result<Vec<u8>> {
            Ok(format!("local {}", uid).into_bytes())
        }
        fn save_message(
            &self,
            _: i64,
            _: &[u8],
            flags: &Flags,
            _: Option<DateTime<Utc>>,
        ) -> folder::Result<i64> {
            let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
            messages.0 += 1;
            let uid = messages.0;
            messages.1.insert_record(MessageRecord::new(uid, flags.clone()));
            Ok(uid)
        }
        fn add_flags(&self, _: &[i64], _: &Flags) -> folder::Result<()> {
            Ok(())
        }
        fn remove_flags(&self, _: &[i64], _: &Flags) -> folder::Result<()> {
            Ok(())
        }
        fn delete_messages(&self, uids: &[i64]) -> folder::Result<()> {
            let mut messages = self.messages.lock().unwrap();
            for uid in uids {
                messages.1.remove(uid);
            }
            Ok(())
        }
        fn change_identifier(&self, _: i64, _: i64) -> folder::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn table_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");

        let mut table = UidMapTable::load(&path).unwrap();
        assert!(table.is_empty());
        table.insert(1, 100);
        table.insert(2, 200);
        table.insert(1, 300);
        assert_eq!(table.remote(1), Some(300));
        assert_eq!(table.local(100), None);
        table.save().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "1:300\n2:200\n");

        let table = UidMapTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.local(200), Some(2));
    }

    #[test]
    fn table_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");
        std::fs::write(&path, "1:2\nnope\n").unwrap();
        assert!(UidMapTable::load(&path).is_err());
    }

    #[test]
    fn mapped_folder_prunes_and_assigns_negative_uids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");
        std::fs::write(&path, "1:100\n2:200\n9:900\n").unwrap();

        let mapped = MappedFolder::new(LocalFolder::with(&[1, 2, 3, 4]), &path).unwrap();
        mapped.cache_message_list(None, None).unwrap();

        assert_eq!(mapped.message_list().uids(), vec![-2, -1, 100, 200]);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "1:100\n2:200\n");
        assert_eq!(mapped.fetch_message(200).unwrap(), b"local 2");
        assert_eq!(mapped.fetch_message(-1).unwrap(), b"local 3");
    }

    #[test]
    fn mapped_folder_save_and_rename() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");

        let mapped = MappedFolder::new(LocalFolder::with(&[1]), &path).unwrap();
        mapped.cache_message_list(None, None).unwrap();
        assert_eq!(mapped.message_list().uids(), vec![-1]);

        // no remote uid to map the message to
        assert_eq!(mapped.save_message(-5, b"local", &Flags::default(), None).unwrap(), -1);
        assert_eq!(mapped.inner().message_count().unwrap(), 1);

        let uid = mapped
            .save_message(42, b"remote 42", &Flags::from("S"), None)
            .unwrap();
        assert_eq!(uid, 42);
        assert!(mapped.uid_exists(42));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "2:42\n");

        mapped.change_identifier(-1, 7).unwrap();
        assert!(mapped.uid_exists(7));
        assert!(!mapped.uid_exists(-1));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1:7\n2:42\n");

        mapped.delete_messages(&[42, 1000]).unwrap();
        assert!(!mapped.uid_exists(42));
        assert_eq!(mapped.inner().message_count().unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1:7\n");
    }

    #[test]
    fn mapped_folder_applies_min_uid_in_remote_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");
        std::fs::write(&path, "1:100\n2:200\n").unwrap();

        let mapped = MappedFolder::new(LocalFolder::with(&[1, 2, 3]), &path).unwrap();
        mapped.cache_message_list(Some(150), None).unwrap();
        assert_eq!(mapped.message_list().uids(), vec![-1, 200]);
    }
}
