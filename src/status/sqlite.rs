//! SQLite status module.
//!
//! The status is persisted in one SQLite database per folder. Every
//! change is written as it happens, inside a transaction.

use log::{debug, trace};
use rusqlite::{params, Connection};
use std::{
    fs,
    path::{Path, PathBuf},
};

use super::{decode_labels, encode_labels, Error, Result, StatusStore};
use crate::{
    folder::{MessageList, MessageRecord},
    Flags,
};

const CREATE_STATUS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS status (
        id     INTEGER PRIMARY KEY,
        flags  TEXT    NOT NULL,
        mtime  INTEGER NOT NULL DEFAULT 0,
        labels TEXT    NOT NULL DEFAULT ''
    )
";

const SELECT_RECORDS: &str = "
    SELECT id, flags, mtime, labels
    FROM status
    ORDER BY id
";

const UPSERT_RECORD: &str = "
    INSERT OR REPLACE INTO status (id, flags, mtime, labels)
    VALUES (?, ?, ?, ?)
";

const DELETE_RECORD: &str = "
    DELETE FROM status
    WHERE id = ?
";

const RENAME_RECORD: &str = "
    UPDATE status
    SET id = ?
    WHERE id = ?
";

#[derive(Debug)]
pub struct SqliteStatus {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteStatus {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            conn: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn db(&mut self) -> Result<&mut Connection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                if let Some(dir) = self.path.parent() {
                    fs::create_dir_all(dir)
                        .map_err(|err| Error::CreateDirError(err, dir.to_owned()))?;
                }
                let conn = Connection::open(&self.path)?;
                conn.execute(CREATE_STATUS_TABLE, [])?;
                debug!("opened status database {:?}", self.path);
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }
}

impl StatusStore for SqliteStatus {
    fn load(&mut self) -> Result<MessageList> {
        let db = self.db()?;
        let mut stmt = db.prepare(SELECT_RECORDS)?;
        let records: Vec<MessageRecord> = stmt
            .query_map([], |row| {
                Ok(MessageRecord {
                    uid: row.get(0)?,
                    flags: Flags::from(row.get::<usize, String>(1)?.as_str()),
                    mod_time: row.get(2)?,
                    labels: decode_labels(&row.get::<usize, String>(3)?),
                    received: None,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        Ok(MessageList::from_iter(records))
    }

    fn upsert(&mut self, records: &[&MessageRecord]) -> Result<()> {
        let db = self.db()?;
        let tx = db.transaction()?;
        for record in records {
            tx.execute(
                UPSERT_RECORD,
                params![
                    record.uid,
                    record.flags.to_string(),
                    record.mod_time,
                    encode_labels(&record.labels)
                ],
            )?;
        }
        tx.commit()?;
        trace!("upserted {} status record(s) in {:?}", records.len(), self.path);
        Ok(())
    }

    fn delete(&mut self, uids: &[i64]) -> Result<()> {
        let db = self.db()?;
        let tx = db.transaction()?;
        for uid in uids {
            tx.execute(DELETE_RECORD, [uid])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn rename(&mut self, old: i64, new: i64) -> Result<()> {
        let db = self.db()?;
        let tx = db.transaction()?;
        tx.execute(DELETE_RECORD, [new])?;
        tx.execute(RENAME_RECORD, [new, old])?;
        tx.commit()?;
        Ok(())
    }

    fn flush(&mut self, _list: &MessageList) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::SqliteStatus;
    use crate::{folder::MessageRecord, status::StatusStore, Flags, Labels};

    #[test]
    fn changes_are_written_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("INBOX");

        let mut status = SqliteStatus::new(&path);
        assert!(status.load().unwrap().is_empty());
        let a = MessageRecord::new(1, Flags::from("S"));
        let b = MessageRecord::new(2, Flags::default());
        status.upsert(&[&a, &b]).unwrap();
        status.rename(2, 5).unwrap();
        status.delete(&[1]).unwrap();

        // no flush needed
        let list = SqliteStatus::new(&path).load().unwrap();
        assert_eq!(list.uids(), vec![5]);
    }

    #[test]
    fn labels_with_commas_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX");

        let mut record = MessageRecord::new(3, Flags::default());
        record.labels = Labels::from_iter(["a,b|c", "d"]);
        SqliteStatus::new(&path).upsert(&[&record]).unwrap();

        let list = SqliteStatus::new(&path).load().unwrap();
        assert_eq!(list.get(&3).unwrap().labels, record.labels);
    }
}
