//! Account config module.
//!
//! This module contains the representation of the synchronization
//! configuration of a user account.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dirs::data_dir;
use log::{debug, warn};
use std::{fs, io, path::PathBuf, result, time::Duration};
use thiserror::Error;

use crate::{FolderFilter, HasSeverity, NameTrans, Severity};

#[cfg(feature = "imap-backend")]
use crate::ImapConfig;
#[cfg(feature = "maildir-backend")]
use crate::MaildirConfig;

pub const DEFAULT_RETRY_COUNT: usize = 3;
pub const DEFAULT_SLEEP_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot expand sync directory {1}")]
    ExpandSyncDirError(#[source] shellexpand::LookupError<std::env::VarError>, String),
    #[error("cannot get XDG_DATA_HOME directory")]
    GetXdgDataDirError,
    #[error("cannot create sync directory {1}")]
    CreateSyncDirError(#[source] io::Error, PathBuf),
    #[error("cannot restrict synchronization of account {0} by both max age and min uid")]
    BothRestrictionsError(String),
    #[error("cannot use quick synchronization together with max age for account {0}")]
    QuickWithMaxAgeError(String),
    #[error("account {0} has no remote store configured")]
    MissingRemoteStoreError(String),
    #[error("account {0} has no local store configured")]
    MissingLocalStoreError(String),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        Severity::Fatal
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the configuration of one store of the account.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StoreConfig {
    None,
    #[cfg(feature = "imap-backend")]
    Imap(ImapConfig),
    #[cfg(feature = "maildir-backend")]
    Maildir(MaildirConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::None
    }
}

/// Represents the backend of the status snapshots.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum StatusBackend {
    /// One flat file per folder, rewritten at pass boundaries.
    #[default]
    Plain,
    /// One SQLite database per folder, updated per message.
    Sqlite,
}

/// Represents the keepalive configuration of the remote session
/// pool, used while the account sleeps between two
/// synchronizations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KeepaliveConfig {
    /// Represents the delay between two keepalive rounds.
    pub interval: Duration,
    /// Represents the timeout of one IDLE round.
    pub idle_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(29 * 60),
            idle_timeout: Duration::from_secs(29 * 60),
        }
    }
}

/// Represents the synchronization configuration of the user
/// account.
#[derive(Debug, Clone, Default)]
pub struct AccountConfig {
    /// Represents the name of the account.
    pub name: String,
    /// Represents the directory holding the status snapshots, the
    /// UID maps and the lock file of the account.
    pub sync_dir: Option<PathBuf>,

    /// Represents the remote store.
    pub remote: StoreConfig,
    /// Represents the local store.
    pub local: StoreConfig,
    /// Represents the status snapshot backend.
    pub status_backend: StatusBackend,

    /// Represents the delay between two synchronizations. The
    /// account is synchronized only once when unset.
    pub autorefresh: Option<Duration>,
    /// Represents the polling increment of the autorefresh sleep.
    pub sleep_tick: Option<Duration>,
    /// Skips folders whose message counts did not change.
    pub quick: Option<bool>,
    /// Only synchronizes messages received during the last given
    /// days.
    pub max_age: Option<u32>,
    /// Only synchronizes remote messages whose uid is greater or
    /// equal to the given one.
    pub min_uid: Option<i64>,
    /// Propagates deletions. When disabled, only the stale status
    /// entries are removed.
    pub sync_deletes: Option<bool>,
    /// Computes the changes without applying them.
    pub dry_run: Option<bool>,

    /// Represents the folders of the remote store to synchronize.
    pub remote_filter: FolderFilter,
    /// Represents the folders of the local store to synchronize.
    pub local_filter: FolderFilter,
    /// Translates remote folder names into local ones.
    pub remote_nametrans: NameTrans,
    /// Translates local folder names into remote ones.
    pub local_nametrans: NameTrans,
    /// Creates on the remote store the folders that only exist
    /// locally.
    pub create_remote_folders: Option<bool>,
    /// Creates on the local store the folders that only exist
    /// remotely.
    pub create_local_folders: Option<bool>,
    /// Never writes to the remote store.
    pub remote_readonly: Option<bool>,
    /// Never writes to the local store.
    pub local_readonly: Option<bool>,

    /// Represents the number of times a failed cycle is retried.
    pub retry_count: Option<usize>,
    /// Represents the wait before the first retry. Each following
    /// retry waits one more delay, up to five minutes.
    pub retry_delay: Option<Duration>,
    /// Represents the maximum number of folders synchronized at the
    /// same time. Defaults to the remote maximum connections.
    pub max_sync_folders: Option<usize>,
    /// Represents the maximum number of messages copied at the same
    /// time. Defaults to the remote maximum connections.
    pub max_copy_workers: Option<usize>,
    /// Keeps remote sessions open between two synchronizations.
    pub hold_connections_open: Option<bool>,
    /// Represents the keepalive of the remote sessions while
    /// sleeping.
    pub keepalive: Option<KeepaliveConfig>,
}

impl AccountConfig {
    /// Checks the consistency of the options.
    pub fn validate(&self) -> Result<()> {
        if let StoreConfig::None = self.remote {
            return Err(Error::MissingRemoteStoreError(self.name.clone()));
        }

        if let StoreConfig::None = self.local {
            return Err(Error::MissingLocalStoreError(self.name.clone()));
        }

        if self.max_age.is_some() && self.min_uid.is_some() {
            return Err(Error::BothRestrictionsError(self.name.clone()));
        }

        if self.quick() && self.max_age.is_some() {
            return Err(Error::QuickWithMaxAgeError(self.name.clone()));
        }

        Ok(())
    }

    /// Gets the sync directory of the account, and creates it if it
    /// does not exist yet.
    pub fn sync_dir(&self) -> Result<PathBuf> {
        let dir = match self.sync_dir.as_ref() {
            Some(dir) => {
                let dir = dir.to_string_lossy();
                let expanded = shellexpand::full(&dir)
                    .map_err(|err| Error::ExpandSyncDirError(err, dir.to_string()))?;
                PathBuf::from(expanded.as_ref())
            }
            None => {
                warn!("sync dir not set, falling back to $XDG_DATA_HOME/mailsync");
                data_dir()
                    .map(|dir| dir.join("mailsync"))
                    .ok_or(Error::GetXdgDataDirError)?
                    .join(&self.name)
            }
        };

        debug!("sync dir of account {}: {:?}", self.name, dir);
        fs::create_dir_all(&dir).map_err(|err| Error::CreateSyncDirError(err, dir.clone()))?;
        Ok(dir)
    }

    pub fn sleep_tick(&self) -> Duration {
        self.sleep_tick.unwrap_or(DEFAULT_SLEEP_TICK)
    }

    pub fn quick(&self) -> bool {
        self.quick.unwrap_or_default()
    }

    /// Returns the oldest receipt date of the synchronized messages.
    pub fn min_date(&self) -> Option<DateTime<Utc>> {
        self.max_age
            .map(|days| Utc::now() - ChronoDuration::days(days as i64))
    }

    pub fn sync_deletes(&self) -> bool {
        self.sync_deletes.unwrap_or(true)
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run.unwrap_or_default()
    }

    pub fn create_remote_folders(&self) -> bool {
        self.create_remote_folders.unwrap_or(true)
    }

    pub fn create_local_folders(&self) -> bool {
        self.create_local_folders.unwrap_or(true)
    }

    pub fn remote_readonly(&self) -> bool {
        self.remote_readonly.unwrap_or_default()
    }

    pub fn local_readonly(&self) -> bool {
        self.local_readonly.unwrap_or_default()
    }

    pub fn retry_count(&self) -> usize {
        self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT)
    }

    /// Returns the wait before the given retry, starting at 1.
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.retry_delay
            .unwrap_or(DEFAULT_RETRY_DELAY)
            .saturating_mul(attempt)
            .min(MAX_RETRY_DELAY)
    }

    pub fn hold_connections_open(&self) -> bool {
        self.hold_connections_open.unwrap_or_default()
    }

    /// Returns the maximum number of connections of the remote store,
    /// used as the default bound of folder syncs and copy workers.
    pub fn remote_max_connections(&self) -> usize {
        match &self.remote {
            #[cfg(feature = "imap-backend")]
            StoreConfig::Imap(config) => config.max_connections(),
            _ => 1,
        }
    }

    pub fn max_sync_folders(&self) -> usize {
        self.max_sync_folders
            .unwrap_or_else(|| self.remote_max_connections())
            .max(1)
    }

    pub fn max_copy_workers(&self) -> usize {
        self.max_copy_workers
            .unwrap_or_else(|| self.remote_max_connections())
            .max(1)
    }
}
