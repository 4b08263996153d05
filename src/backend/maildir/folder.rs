//! Maildir folder module.
//!
//! This module contains the folder implementation of the local side.
//! A message found without a uid of this folder in its filename is
//! listed with a negative uid, so it gets uploaded then renamed with
//! the uid assigned by the remote side.

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, trace, warn};
use mail_parser::MessageParser;
use rayon::prelude::*;
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::UNIX_EPOCH,
};

use super::{filename::fmd5, Error, MaildirFilename, Result};
use crate::{
    folder::{self, check_restrictions, Folder, FolderKind, MessageList, MessageRecord},
    Flags, Labels,
};

#[derive(Debug, Default)]
struct State {
    list: MessageList,
    paths: HashMap<i64, PathBuf>,
}

/// Represents a message file found while scanning a folder.
#[derive(Debug)]
struct Entry {
    path: PathBuf,
    filename: MaildirFilename,
    mod_time: i64,
    labels: Labels,
}

/// Represents a Maildir folder, made of the `cur`, `new` and `tmp`
/// directories.
#[derive(Debug)]
pub struct MaildirFolder {
    name: String,
    sep: char,
    path: PathBuf,
    fmd5: String,
    readonly: bool,
    labels_header: Option<String>,
    state: RwLock<State>,
}

impl MaildirFolder {
    pub fn new<N: ToString, P: Into<PathBuf>>(
        name: N,
        sep: char,
        path: P,
        readonly: bool,
        labels_header: Option<String>,
    ) -> Self {
        let name = name.to_string();
        Self {
            fmd5: fmd5(&name),
            name,
            sep,
            path: path.into(),
            readonly,
            labels_header,
            state: RwLock::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> RwLockReadGuard<State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn message_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = vec![];
        for subdir in ["new", "cur"] {
            let dir = self.path.join(subdir);
            let entries = fs::read_dir(&dir).map_err(|err| Error::ReadDirError(err, dir.clone()))?;
            for entry in entries {
                let entry = entry.map_err(|err| Error::ReadDirError(err, dir.clone()))?;
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn read_entry(&self, path: PathBuf) -> Entry {
        let filename = path
            .file_name()
            .map(|name| MaildirFilename::parse(&name.to_string_lossy()))
            .unwrap_or_default();
        let mod_time = mod_time(&path);
        let labels = match &self.labels_header {
            Some(header) => match fs::read(&path) {
                Ok(content) => read_labels(&content, header),
                Err(err) => {
                    warn!("cannot read labels of message {:?}: {}", path, err);
                    Labels::default()
                }
            },
            None => Labels::default(),
        };
        Entry {
            path,
            filename,
            mod_time,
            labels,
        }
    }

    fn path_of(&self, uid: i64) -> Result<PathBuf> {
        self.state()
            .paths
            .get(&uid)
            .cloned()
            .ok_or_else(|| Error::FindMessageError(uid, self.name.clone()))
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnlyFolderError(self.name.clone()));
        }
        Ok(())
    }

    /// Moves the message to `cur` with the given flags in its info
    /// suffix.
    fn set_flags(&self, uid: i64, flags: Flags) -> Result<()> {
        let path = self.path_of(uid)?;
        let mut filename = path
            .file_name()
            .map(|name| MaildirFilename::parse(&name.to_string_lossy()))
            .unwrap_or_default();
        filename.flags = flags.clone();

        let dest = self.path.join("cur").join(filename.to_string());
        if dest != path {
            trace!("moving message {:?} to {:?}", path, dest);
            fs::rename(&path, &dest)
                .map_err(|err| Error::RenameMessageError(err, path.clone(), dest.clone()))?;
        }

        let mut state = self.state_mut();
        state.paths.insert(uid, dest);
        if let Some(record) = state.list.get_mut(&uid) {
            record.flags = flags;
        }
        Ok(())
    }

    /// Rewrites the labels header of the message.
    fn set_labels(&self, uid: i64, header: &str, labels: Labels) -> Result<()> {
        let path = self.path_of(uid)?;
        let content = fs::read(&path).map_err(|err| Error::ReadMessageError(err, path.clone()))?;
        let value = if labels.is_empty() {
            None
        } else {
            Some(labels.to_string())
        };
        let content = replace_header(&content, header, value.as_deref());

        let tmp = self.path.join("tmp").join(path.file_name().unwrap_or_default());
        fs::write(&tmp, content).map_err(|err| Error::WriteMessageError(err, tmp.clone()))?;
        fs::rename(&tmp, &path)
            .map_err(|err| Error::RenameMessageError(err, tmp.clone(), path.clone()))?;

        let mut state = self.state_mut();
        if let Some(record) = state.list.get_mut(&uid) {
            record.labels = labels;
            record.mod_time = mod_time(&path);
        }
        Ok(())
    }

    fn update_labels<U: Fn(&mut Labels)>(&self, uids: &[i64], update: U) -> folder::Result<()> {
        let header = match &self.labels_header {
            Some(header) => header,
            None => return Err(folder::Error::LabelsNotSupportedError(self.name.clone())),
        };
        self.check_writable()?;
        for uid in uids {
            let mut labels = match self.get_message(*uid) {
                Some(record) => record.labels,
                None => continue,
            };
            update(&mut labels);
            self.set_labels(*uid, header, labels)?;
        }
        Ok(())
    }
}

impl Folder for MaildirFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn sep(&self) -> char {
        self.sep
    }

    fn kind(&self) -> FolderKind {
        FolderKind::Local
    }

    fn supports_labels(&self) -> bool {
        self.labels_header.is_some()
    }

    fn cache_message_list(
        &self,
        min_uid: Option<i64>,
        min_date: Option<DateTime<Utc>>,
    ) -> folder::Result<()> {
        check_restrictions(&self.name, min_uid, min_date)?;

        let paths = self.message_paths()?;
        let entries: Vec<Entry> = paths
            .into_par_iter()
            .map(|path| self.read_entry(path))
            .collect();

        let mut state = State::default();
        let mut next_negative_uid = -1;
        for entry in entries {
            let uid = match entry.filename.uid_in(&self.fmd5) {
                Some(uid) if !state.paths.contains_key(&uid) => uid,
                found => {
                    if let Some(uid) = found {
                        warn!("uid {} found twice in {}, treating {:?} as new", uid, self.name, entry.path);
                    }
                    let uid = next_negative_uid;
                    next_negative_uid -= 1;
                    uid
                }
            };
            let received = entry
                .filename
                .received()
                .or_else(|| Utc.timestamp_opt(entry.mod_time, 0).single());

            if let Some(min_uid) = min_uid {
                if uid > 0 && uid < min_uid {
                    continue;
                }
            }
            if let Some(min_date) = min_date {
                if matches!(received, Some(received) if received < min_date) {
                    continue;
                }
            }

            state.list.insert_record(MessageRecord {
                uid,
                flags: entry.filename.flags,
                labels: entry.labels,
                received,
                mod_time: entry.mod_time,
            });
            state.paths.insert(uid, entry.path);
        }

        debug!("listed {} message(s) in {}", state.list.len(), self.name);
        *self.state_mut() = state;
        Ok(())
    }

    fn drop_message_list(&self) {
        *self.state_mut() = State::default();
    }

    fn message_list(&self) -> MessageList {
        self.state().list.clone()
    }

    fn get_message(&self, uid: i64) -> Option<MessageRecord> {
        self.state().list.get(&uid).cloned()
    }

    fn message_count(&self) -> folder::Result<usize> {
        Ok(self.message_paths()?.len())
    }

    fn fetch_message(&self, uid: i64) -> folder::Result<Vec<u8>> {
        let path = self.path_of(uid)?;
        let content = fs::read(&path).map_err(|err| Error::ReadMessageError(err, path))?;
        Ok(content)
    }

    fn save_message(
        &self,
        uid: i64,
        content: &[u8],
        flags: &Flags,
        received: Option<DateTime<Utc>>,
    ) -> folder::Result<i64> {
        // Maildir folders cannot assign uids on their own.
        if uid < 0 {
            return Ok(uid);
        }
        if self.readonly {
            debug!("refusing to save message {} to read-only folder {}", uid, self.name);
            return Ok(-1);
        }
        if self.uid_exists(uid) {
            self.set_flags(uid, flags.clone())?;
            return Ok(uid);
        }

        let filename = MaildirFilename::new(received, uid, self.fmd5.clone(), flags.clone());
        // Messages in `new` carry no info suffix.
        let dest = if flags.is_empty() {
            self.path.join("new").join(filename.to_new_string())
        } else {
            self.path.join("cur").join(filename.to_string())
        };
        let tmp = self.path.join("tmp").join(filename.to_new_string());
        fs::write(&tmp, content).map_err(|err| Error::WriteMessageError(err, tmp.clone()))?;

        fs::rename(&tmp, &dest)
            .map_err(|err| Error::RenameMessageError(err, tmp.clone(), dest.clone()))?;
        debug!("saved message {} to {:?}", uid, dest);

        let labels = match &self.labels_header {
            Some(header) => read_labels(content, header),
            None => Labels::default(),
        };
        let record = MessageRecord {
            uid,
            flags: flags.clone(),
            labels,
            received: received.or_else(|| filename.received()),
            mod_time: mod_time(&dest),
        };

        let mut state = self.state_mut();
        state.list.insert_record(record);
        state.paths.insert(uid, dest);
        Ok(uid)
    }

    fn add_flags(&self, uids: &[i64], flags: &Flags) -> folder::Result<()> {
        self.check_writable()?;
        for uid in uids {
            if let Some(record) = self.get_message(*uid) {
                let mut next = record.flags.clone();
                next.extend(flags.iter().cloned());
                if next != record.flags {
                    self.set_flags(*uid, next)?;
                }
            }
        }
        Ok(())
    }

    fn remove_flags(&self, uids: &[i64], flags: &Flags) -> folder::Result<()> {
        self.check_writable()?;
        for uid in uids {
            if let Some(record) = self.get_message(*uid) {
                let next = record.flags.diff(flags);
                if next != record.flags {
                    self.set_flags(*uid, next)?;
                }
            }
        }
        Ok(())
    }

    fn add_labels(&self, uids: &[i64], labels: &Labels) -> folder::Result<()> {
        self.update_labels(uids, |current| current.extend(labels.iter().cloned()))
    }

    fn remove_labels(&self, uids: &[i64], labels: &Labels) -> folder::Result<()> {
        self.update_labels(uids, |current| current.retain(|label| !labels.contains(label)))
    }

    fn delete_messages(&self, uids: &[i64]) -> folder::Result<()> {
        self.check_writable()?;
        let mut state = self.state_mut();
        for uid in uids {
            state.list.remove(uid);
            let path = match state.paths.remove(uid) {
                Some(path) => path,
                None => continue,
            };
            match fs::remove_file(&path) {
                Ok(()) => trace!("deleted message {:?}", path),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("message {:?} already deleted", path)
                }
                Err(err) => return Err(Error::DeleteMessageError(err, path).into()),
            }
        }
        Ok(())
    }

    fn change_identifier(&self, old: i64, new: i64) -> folder::Result<()> {
        let path = self.path_of(old)?;
        let mut filename = path
            .file_name()
            .map(|name| MaildirFilename::parse(&name.to_string_lossy()))
            .unwrap_or_default();
        filename.uid = Some(new);
        filename.fmd5 = Some(self.fmd5.clone());

        let in_new = path
            .parent()
            .and_then(Path::file_name)
            .map_or(false, |dir| dir == "new");
        let dest = if in_new {
            path.with_file_name(filename.to_new_string())
        } else {
            path.with_file_name(filename.to_string())
        };
        fs::rename(&path, &dest)
            .map_err(|err| Error::RenameMessageError(err, path.clone(), dest.clone()))?;
        debug!("renamed message {} to {} in {}", old, new, self.name);

        let mut state = self.state_mut();
        state.paths.remove(&old);
        state.paths.insert(new, dest);
        state.list.rename(old, new);
        Ok(())
    }
}

fn mod_time(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|time| time.as_secs() as i64)
        .unwrap_or_default()
}

fn read_labels(content: &[u8], header: &str) -> Labels {
    MessageParser::default()
        .parse_headers(content)
        .and_then(|msg| msg.header_raw(header).map(|value| Labels::from(value.trim())))
        .unwrap_or_default()
}

fn is_header(line: &[u8], name: &str) -> bool {
    line.len() > name.len()
        && line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
        && line[name.len()] == b':'
}

/// Replaces every occurrence of the given header, folded lines
/// included, by a single one at the top of the message. The header
/// is only removed when no value is given.
fn replace_header(content: &[u8], name: &str, value: Option<&str>) -> Vec<u8> {
    let eol: &[u8] = if content.windows(2).any(|w| w == b"\r\n") {
        b"\r\n"
    } else {
        b"\n"
    };

    let mut out = Vec::with_capacity(content.len() + 64);
    if let Some(value) = value {
        out.extend_from_slice(format!("{}: {}", name, value).as_bytes());
        out.extend_from_slice(eol);
    }

    let mut pos = 0;
    let mut skipping = false;
    while pos < content.len() {
        let end = content[pos..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|i| pos + i + 1)
            .unwrap_or(content.len());
        let line = &content[pos..end];
        if line == b"\n" || line == b"\r\n" {
            break;
        }
        if !matches!(line.first(), Some(b' ') | Some(b'\t')) {
            skipping = is_header(line, name);
        }
        if !skipping {
            out.extend_from_slice(line);
        }
        pos = end;
    }
    out.extend_from_slice(&content[pos..]);
    out
}
