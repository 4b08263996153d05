//! IMAP protocol engine module.
//!
//! This module contains the contract of the wire-level IMAP engine
//! the session pool drives. The engine is provided by the caller:
//! one [`Connector`] opens connections, each connection being an
//! [`ImapProtocol`] session.

use chrono::{DateTime, NaiveDate, Utc};
use std::{fmt, result, time::Duration};
use thiserror::Error;

use crate::{AuthMechanism, HasSeverity, ImapConfig, Severity};

/// Represents the kind of a protocol failure, which tells what can
/// still be done with the session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolErrorKind {
    /// The command may succeed on a new connection.
    Retryable,
    /// The session cannot be used anymore.
    SessionFatal,
    /// The command failed for the selected mailbox only; the session
    /// is still usable.
    MailboxFatal,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::SessionFatal => write!(f, "fatal to session"),
            Self::MailboxFatal => write!(f, "fatal to mailbox"),
        }
    }
}

#[derive(Debug, Error)]
#[error("imap protocol error ({kind}): {message}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

impl ProtocolError {
    pub fn new<M: ToString>(kind: ProtocolErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }

    pub fn retryable<M: ToString>(message: M) -> Self {
        Self::new(ProtocolErrorKind::Retryable, message)
    }

    pub fn session<M: ToString>(message: M) -> Self {
        Self::new(ProtocolErrorKind::SessionFatal, message)
    }

    pub fn mailbox<M: ToString>(message: M) -> Self {
        Self::new(ProtocolErrorKind::MailboxFatal, message)
    }

    /// Returns `true` if the session that raised the error must not
    /// be reused.
    pub fn breaks_session(&self) -> bool {
        self.kind != ProtocolErrorKind::MailboxFatal
    }
}

impl HasSeverity for ProtocolError {
    fn severity(&self) -> Severity {
        match self.kind {
            ProtocolErrorKind::Retryable | ProtocolErrorKind::SessionFatal => Severity::Store,
            ProtocolErrorKind::MailboxFatal => Severity::Folder,
        }
    }
}

pub type Result<T> = result::Result<T, ProtocolError>;

/// Represents the class of a connection failure.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot resolve host {0}")]
    Dns(String),
    #[error("cannot negotiate tls with {0}: {1}")]
    Tls(String, String),
    #[error("connection refused by {0}")]
    Refused(String),
    #[error("cannot connect to {0}: {1}")]
    Other(String, String),
}

/// Represents one entry of a LIST response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListEntry {
    pub name: String,
    pub delimiter: Option<char>,
    pub attributes: Vec<String>,
}

impl ListEntry {
    pub fn is_selectable(&self) -> bool {
        !self
            .attributes
            .iter()
            .any(|attr| attr.eq_ignore_ascii_case("\\Noselect"))
    }
}

/// Represents the personal namespace announced by the server.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Namespace {
    pub prefix: String,
    pub delimiter: Option<char>,
}

/// Represents the state of a freshly selected mailbox.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MailboxState {
    pub exists: usize,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
    /// The server granted read-only access only.
    pub read_only: bool,
}

/// Represents a set of uids.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UidSet {
    /// Every message of the mailbox (`1:*`).
    All,
    /// Every message whose uid is greater or equal to the given one
    /// (`n:*`).
    From(i64),
    List(Vec<i64>),
}

/// Represents the items of a FETCH command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchItems {
    /// `UID FLAGS INTERNALDATE`, plus `X-GM-LABELS` when asked.
    Meta { labels: bool },
    /// `UID BODY.PEEK[]`.
    Body,
}

/// Represents one message of a FETCH or STORE response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FetchedMessage {
    pub uid: i64,
    pub flags: Vec<String>,
    pub labels: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub body: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreOp {
    Add,
    Remove,
}

/// Represents the attribute modified by a STORE command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreItem {
    Flags,
    /// Gmail `X-GM-LABELS`.
    Labels,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SearchCriterion {
    All,
    Since(NaiveDate),
    Header(String, String),
}

/// Represents the outcome of an IDLE round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdleEvent {
    NewMail,
    Timeout,
}

/// Represents one authenticated (or about to be) IMAP session.
pub trait ImapProtocol: Send {
    fn capabilities(&mut self) -> Result<Vec<String>>;
    fn authenticate(&mut self, mechanism: AuthMechanism, login: &str, passwd: &str)
        -> Result<()>;
    fn namespace(&mut self) -> Result<Option<Namespace>>;
    fn list(&mut self, reference: &str, pattern: &str) -> Result<Vec<ListEntry>>;
    fn create(&mut self, mailbox: &str) -> Result<()>;
    fn delete(&mut self, mailbox: &str) -> Result<()>;
    fn select(&mut self, mailbox: &str, readonly: bool) -> Result<MailboxState>;
    fn fetch(&mut self, uids: &UidSet, items: FetchItems) -> Result<Vec<FetchedMessage>>;
    /// Stores the given values and returns the messages echoed by the
    /// server.
    fn store(
        &mut self,
        uids: &UidSet,
        op: StoreOp,
        item: StoreItem,
        values: &[String],
    ) -> Result<Vec<FetchedMessage>>;
    /// Appends a message and returns its uid when the server supports
    /// `UIDPLUS`.
    fn append(
        &mut self,
        mailbox: &str,
        flags: &[String],
        date: Option<DateTime<Utc>>,
        body: &[u8],
    ) -> Result<Option<i64>>;
    fn search(&mut self, criterion: &SearchCriterion) -> Result<Vec<i64>>;
    /// Waits for changes of the selected mailbox, at most `timeout`.
    fn idle(&mut self, timeout: Duration) -> Result<IdleEvent>;
    fn noop(&mut self) -> Result<()>;
    fn expunge(&mut self) -> Result<()>;
    fn logout(&mut self) -> Result<()>;
}

/// Opens connections to an IMAP server.
pub trait Connector: fmt::Debug + Send + Sync {
    fn connect(&self, config: &ImapConfig) -> result::Result<Box<dyn ImapProtocol>, ConnectError>;
}
