//! IMAP store module.

use log::{debug, info};
use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use super::{Error, ImapFolder, SessionPool, WorkerId};
use crate::{
    backend::Store,
    folder::{self, Folder},
    KeepaliveConfig,
};

/// Represents an IMAP store, every folder of which shares the same
/// session pool.
#[derive(Debug)]
pub struct ImapStore {
    name: String,
    pool: Arc<SessionPool>,
    readonly: bool,
}

impl ImapStore {
    pub fn new<N: ToString>(name: N, pool: Arc<SessionPool>, readonly: bool) -> Self {
        Self {
            name: name.to_string(),
            pool,
            readonly,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    fn worker(&self) -> WorkerId {
        WorkerId::new(format!("{}:structure", self.name))
    }
}

impl Store for ImapStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn sep(&self) -> folder::Result<char> {
        Ok(self.pool.delimiter()?)
    }

    fn list_folders(&self) -> folder::Result<Vec<String>> {
        // The root is discovered by the first session, so it must be
        // known before holding one.
        let root = self.pool.root()?;
        let mut session = self.pool.acquire(&self.worker())?;
        let entries = session
            .run(|proto| proto.list(&root, "*"))
            .map_err(|err| Error::ProtocolError(err, format!("list folders of {}", self.name)))?;

        let folders: Vec<String> = entries
            .into_iter()
            .filter(|entry| entry.is_selectable())
            .map(|entry| entry.name)
            .collect();
        debug!("found {} folder(s) in {}", folders.len(), self.name);
        Ok(folders)
    }

    fn create_folder(&self, name: &str) -> folder::Result<()> {
        info!("creating folder {} in {}", name, self.name);
        let mut session = self.pool.acquire(&self.worker())?;
        session
            .run(|proto| proto.create(name))
            .map_err(|err| Error::ProtocolError(err, format!("create folder {}", name)))?;
        Ok(())
    }

    fn open_folder(&self, name: &str) -> folder::Result<Box<dyn Folder>> {
        let sep = self.sep()?;
        Ok(Box::new(ImapFolder::new(
            self.pool.clone(),
            name,
            sep,
            self.readonly,
        )))
    }

    fn max_connections(&self) -> Option<usize> {
        Some(self.pool.max_connections())
    }

    fn drop_connections(&self) {
        self.pool.drop_connections()
    }

    fn hold_connections(&self, hold: bool) {
        self.pool.hold_connections(hold)
    }

    fn close(&self) {
        self.pool.close()
    }

    fn keepalive(
        &self,
        config: &KeepaliveConfig,
        tick: Duration,
        stop: &AtomicBool,
        on_new_mail: &(dyn Fn() + Sync),
    ) {
        self.pool.keepalive(config, tick, stop, on_new_mail)
    }
}
