//! Backend module.
//!
//! This module exposes the store trait, implemented by every kind of
//! mail store taking part in a synchronization, and the builder
//! turning a store configuration into a store.

#[cfg(feature = "imap-backend")]
pub mod imap;
#[cfg(feature = "maildir-backend")]
pub mod maildir;
pub mod mapped;

#[cfg(feature = "imap-backend")]
pub use self::imap::{Connector, ImapFolder, ImapStore, SessionPool, WorkerId};
#[cfg(feature = "maildir-backend")]
pub use self::maildir::{MaildirFolder, MaildirStore};
pub use self::mapped::MappedStore;

use log::debug;
use std::{fmt, result, sync::atomic::AtomicBool, time::Duration};
use thiserror::Error;

use crate::{
    folder::{self, Folder},
    AccountConfig, HasSeverity, KeepaliveConfig, Severity, StoreConfig,
};

#[cfg(feature = "imap-backend")]
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot build store of account {0}: store not configured")]
    BuildStoreError(String),
    #[error("cannot build imap store of account {0}: missing protocol connector")]
    MissingConnectorError(String),

    #[error(transparent)]
    ConfigError(#[from] crate::config::account::Error),
    #[error(transparent)]
    FolderError(#[from] folder::Error),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        match self {
            Self::BuildStoreError(_) => Severity::Fatal,
            Self::MissingConnectorError(_) => Severity::Fatal,
            Self::ConfigError(err) => err.severity(),
            Self::FolderError(err) => err.severity(),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Represents a mail store taking part in a synchronization.
pub trait Store: fmt::Debug + Send + Sync {
    /// Returns the name of the store, used to name its limiters.
    fn name(&self) -> &str;
    /// Returns the hierarchy separator of the folder names.
    fn sep(&self) -> folder::Result<char>;
    /// Returns the names of the folders of the store.
    fn list_folders(&self) -> folder::Result<Vec<String>>;
    fn create_folder(&self, name: &str) -> folder::Result<()>;
    fn open_folder(&self, name: &str) -> folder::Result<Box<dyn Folder>>;

    /// Returns the maximum number of concurrent connections of the
    /// store, if bounded.
    fn max_connections(&self) -> Option<usize> {
        None
    }

    /// Closes the idle connections of the store.
    fn drop_connections(&self) {}

    /// Sets whether idle connections stay open between two
    /// synchronizations.
    fn hold_connections(&self, _hold: bool) {}

    /// Waits for the connections in use, then closes them all.
    fn close(&self) {}

    /// Keeps the connections of the store alive until `stop` is set.
    fn keepalive(
        &self,
        _config: &KeepaliveConfig,
        _tick: Duration,
        _stop: &AtomicBool,
        _on_new_mail: &(dyn Fn() + Sync),
    ) {
    }
}

/// Represents the side of a store in an account.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreSide {
    Remote,
    Local,
}

/// Builds the stores of an account from its configuration.
#[derive(Debug, Default, Clone)]
pub struct StoreBuilder {
    #[cfg(feature = "imap-backend")]
    connector: Option<Arc<dyn Connector>>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connector opening the IMAP connections.
    #[cfg(feature = "imap-backend")]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(&self, account: &AccountConfig, side: StoreSide) -> Result<Box<dyn Store>> {
        let (config, readonly, suffix) = match side {
            StoreSide::Remote => (&account.remote, account.remote_readonly(), "remote"),
            StoreSide::Local => (&account.local, account.local_readonly(), "local"),
        };
        let name = format!("{}:{}", account.name, suffix);
        debug!("building store {}", name);

        match config {
            #[cfg(feature = "imap-backend")]
            StoreConfig::Imap(imap_config) => {
                let connector = self
                    .connector
                    .clone()
                    .ok_or_else(|| Error::MissingConnectorError(account.name.clone()))?;
                let pool = SessionPool::new(&name, imap_config.clone(), connector);
                let store = ImapStore::new(name, Arc::new(pool), readonly);
                match side {
                    StoreSide::Remote => Ok(Box::new(store)),
                    // A local IMAP store assigns its own uids, which
                    // are mapped to the remote ones.
                    StoreSide::Local => {
                        let dir = account.sync_dir()?.join("uid-maps").join(&account.name);
                        Ok(Box::new(MappedStore::new(Box::new(store), dir)))
                    }
                }
            }
            #[cfg(feature = "maildir-backend")]
            StoreConfig::Maildir(maildir_config) => Ok(Box::new(MaildirStore::new(
                name,
                maildir_config.clone(),
                readonly,
            ))),
            StoreConfig::None => Err(Error::BuildStoreError(account.name.clone())),
        }
    }
}
