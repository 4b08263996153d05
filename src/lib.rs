//! Rust library for two-way synchronization of mail stores.
//!
//! A remote IMAP store and a local store (Maildir or IMAP) are kept
//! in sync folder by folder. The state both sides agreed on after the
//! last synchronization is kept in a status snapshot, which tells
//! which side changed since then.

pub mod severity;
pub use severity::{HasSeverity, Severity};

pub mod flag;
pub use flag::{Flag, Flags, Labels};

pub mod limiter;
pub use limiter::{Limiters, Semaphore, SemaphorePermit, SemaphorePermits, SyncMutexes};

pub(crate) mod process;

pub mod config;
pub use config::{
    AccountConfig, FolderFilter, KeepaliveConfig, NameTrans, StatusBackend, StoreConfig,
};
#[cfg(feature = "imap-backend")]
pub use config::{AuthMechanism, ImapConfig};
#[cfg(feature = "maildir-backend")]
pub use config::MaildirConfig;

pub mod folder;
pub use folder::{Folder, FolderKind, MappedFolder, MessageList, MessageRecord, UidMapTable};

pub mod backend;
pub use backend::{MappedStore, Store, StoreBuilder, StoreSide};
#[cfg(feature = "imap-backend")]
pub use backend::{Connector, ImapFolder, ImapStore, SessionPool, WorkerId};
#[cfg(feature = "maildir-backend")]
pub use backend::{MaildirFolder, MaildirStore};

pub mod status;
pub use status::{StatusFolder, StatusStore};

pub mod sync;
pub use sync::{Changes, FolderReport, FolderSync, SyncOptions, SyncReport};

pub mod account;
pub use account::{Account, AccountLock, AccountState, Scheduler, SyncContext, SyncSignals};
