//! IMAP backend module.
//!
//! This module contains the remote side of the synchronization: the
//! contract of the protocol engine, the session pool driving it, and
//! the IMAP store and folder built on top of the pool.

pub mod flags;
pub mod folder;
pub mod pool;
pub mod protocol;
pub mod store;

pub use self::folder::ImapFolder;
pub use self::pool::{SessionGuard, SessionPool, WorkerId};
pub use self::protocol::{
    ConnectError, Connector, FetchItems, FetchedMessage, IdleEvent, ImapProtocol, ListEntry,
    MailboxState, Namespace, ProtocolError, ProtocolErrorKind, SearchCriterion, StoreItem,
    StoreOp, UidSet,
};
pub use self::store::ImapStore;

use std::result;
use thiserror::Error;

use crate::{config, HasSeverity, Severity};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot connect to imap server {1}")]
    ConnectError(#[source] ConnectError, String),
    #[error("cannot authenticate to imap server {0}: {1}")]
    AuthenticateError(String, String),
    #[error("cannot authenticate to imap server {0}: no supported mechanism")]
    NoAuthMechanismError(String),
    #[error("cannot {1} on imap server")]
    ProtocolError(#[source] ProtocolError, String),
    #[error("cannot fetch message {1} from {2}")]
    FetchMessageError(#[source] ProtocolError, i64, String),
    #[error("cannot find message {0} in {1}")]
    FindMessageError(i64, String),
    #[error("cannot append message to {1}")]
    AppendMessageError(#[source] ProtocolError, String),

    #[error(transparent)]
    ConfigError(#[from] config::imap::Error),
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        match self {
            Self::ConnectError(..) => Severity::Store,
            Self::AuthenticateError(..) => Severity::Store,
            Self::NoAuthMechanismError(..) => Severity::Store,
            Self::ProtocolError(err, _) => err.severity(),
            Self::FetchMessageError(err, ..) | Self::AppendMessageError(err, _) => {
                if err.breaks_session() {
                    Severity::Store
                } else {
                    Severity::Message
                }
            }
            Self::FindMessageError(..) => Severity::Message,
            Self::ConfigError(err) => err.severity(),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
