//! Plain status module.
//!
//! The status is persisted as a flat file, rewritten as a whole when
//! flushed. Files written by older versions are upgraded on load.

use log::{debug, info, trace};
use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use super::{decode_labels, encode_labels, Error, Result, StatusStore};
use crate::{
    folder::{MessageList, MessageRecord},
    Flags,
};

const MAGIC: &str = "MAILSYNC STATUS CACHE DATA - DO NOT MODIFY";
const FORMAT: u8 = 2;

#[derive(Debug)]
pub struct PlainStatus {
    path: PathBuf,
}

impl PlainStatus {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_error(&self, line: &str) -> Error {
        Error::ParseLineError(self.path.clone(), line.to_owned())
    }

    /// Parses a `uid:flags` line.
    fn parse_v1(&self, line: &str) -> Result<MessageRecord> {
        let (uid, flags) = line.split_once(':').ok_or_else(|| self.parse_error(line))?;
        let uid = uid.trim().parse::<i64>().map_err(|_| self.parse_error(line))?;
        Ok(MessageRecord::new(uid, Flags::from(flags.trim())))
    }

    /// Parses a `uid|flags|mtime|labels` line.
    fn parse_v2(&self, line: &str) -> Result<MessageRecord> {
        let mut parts = line.splitn(4, '|');
        let uid = parts
            .next()
            .and_then(|uid| uid.parse::<i64>().ok())
            .ok_or_else(|| self.parse_error(line))?;
        let flags = parts.next().ok_or_else(|| self.parse_error(line))?;
        let mod_time = parts
            .next()
            .and_then(|mtime| mtime.parse::<i64>().ok())
            .ok_or_else(|| self.parse_error(line))?;
        let labels = parts.next().unwrap_or_default();

        Ok(MessageRecord {
            uid,
            flags: Flags::from(flags),
            labels: decode_labels(labels),
            received: None,
            mod_time,
        })
    }

    fn write(&self, list: &MessageList) -> Result<()> {
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        let write = || -> io::Result<()> {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = io::BufWriter::new(fs::File::create(&tmp_path)?);
            writeln!(file, "{} - FORMAT {}", MAGIC, FORMAT)?;
            for record in list.values() {
                writeln!(
                    file,
                    "{}|{}|{}|{}",
                    record.uid,
                    record.flags,
                    record.mod_time,
                    encode_labels(&record.labels)
                )?;
            }
            file.into_inner()?.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };
        write().map_err(|err| Error::WriteFileError(err, self.path.clone()))?;
        trace!("wrote status file {:?}", self.path);
        Ok(())
    }
}

impl StatusStore for PlainStatus {
    fn load(&mut self) -> Result<MessageList> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("status file {:?} not found, starting empty", self.path);
                return Ok(MessageList::default());
            }
            Err(err) => return Err(Error::OpenFileError(err, self.path.clone())),
        };

        let mut lines = io::BufReader::new(file).lines();
        let first = match lines.next() {
            Some(line) => line.map_err(|err| Error::ReadLineError(err, self.path.clone()))?,
            None => return Ok(MessageList::default()),
        };

        let mut list = MessageList::default();
        let format = match first.strip_prefix(MAGIC) {
            Some(format) => match format.trim().strip_prefix("- FORMAT ") {
                Some("1") => 1,
                Some("2") => 2,
                _ => return Err(self.parse_error(&first)),
            },
            // headerless files predate the format versions
            None => {
                if !first.trim().is_empty() {
                    list.insert_record(self.parse_v1(first.trim())?);
                }
                0
            }
        };

        for line in lines {
            let line = line.map_err(|err| Error::ReadLineError(err, self.path.clone()))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = match format {
                2 => self.parse_v2(line)?,
                _ => self.parse_v1(line)?,
            };
            list.insert_record(record);
        }

        if format != FORMAT {
            info!("upgrading status file {:?} to format {}", self.path, FORMAT);
            self.write(&list)?;
        }

        Ok(list)
    }

    fn upsert(&mut self, _records: &[&MessageRecord]) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self, _uids: &[i64]) -> Result<()> {
        Ok(())
    }

    fn rename(&mut self, _old: i64, _new: i64) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self, list: &MessageList) -> Result<()> {
        self.write(list)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use tempfile::tempdir;

    use super::PlainStatus;
    use crate::{
        folder::{MessageList, MessageRecord},
        status::StatusStore,
        Flags, Labels,
    };

    #[test]
    fn upgrade_format_1() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");
        fs::write(
            &path,
            "MAILSYNC STATUS CACHE DATA - DO NOT MODIFY - FORMAT 1\n1:S\n2:FS\n3:\n",
        )
        .unwrap();

        let list = PlainStatus::new(&path).load().unwrap();
        assert_eq!(list.uids(), vec![1, 2, 3]);
        assert_eq!(list.get(&2).unwrap().flags, Flags::from("FS"));
        assert!(list.get(&3).unwrap().flags.is_empty());

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "MAILSYNC STATUS CACHE DATA - DO NOT MODIFY - FORMAT 2\n1|S|0|\n2|FS|0|\n3||0|\n"
        );
    }

    #[test]
    fn upgrade_headerless() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");
        fs::write(&path, "7:R\n9:S\n").unwrap();

        let list = PlainStatus::new(&path).load().unwrap();
        assert_eq!(list.uids(), vec![7, 9]);
        assert!(fs::read_to_string(&path)
            .unwrap()
            .starts_with("MAILSYNC STATUS CACHE DATA - DO NOT MODIFY - FORMAT 2\n"));
    }

    #[test]
    fn read_format_2() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");
        let content = "MAILSYNC STATUS CACHE DATA - DO NOT MODIFY - FORMAT 2\n4|FS|1700000000|a,b\n";
        fs::write(&path, content).unwrap();

        let list = PlainStatus::new(&path).load().unwrap();
        let record = list.get(&4).unwrap();
        assert_eq!(record.flags, Flags::from("FS"));
        assert_eq!(record.mod_time, 1700000000);
        assert_eq!(record.labels, Labels::from("a,b"));
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn labels_with_separators_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");
        let mut list = MessageList::default();
        let mut record = MessageRecord::new(4, Flags::from("S"));
        record.labels = Labels::from_iter(["a,b|c", "back\\slash", "plain"]);
        list.insert_record(record.clone());

        let mut status = PlainStatus::new(&path);
        status.flush(&list).unwrap();
        assert!(fs::read_to_string(&path)
            .unwrap()
            .ends_with("4|S|0|a\\,b\\|c,back\\\\slash,plain\n"));

        let list = PlainStatus::new(&path).load().unwrap();
        assert_eq!(list.get(&4).unwrap().labels, record.labels);
    }

    #[test]
    fn reject_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");
        fs::write(&path, "MAILSYNC STATUS CACHE DATA - DO NOT MODIFY - FORMAT 2\nnope\n").unwrap();
        assert!(PlainStatus::new(&path).load().is_err());
    }
}
