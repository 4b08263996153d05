//! Config module.
//!
//! This module contains the representation of the user's
//! configuration: accounts, stores and their synchronization
//! options. Loading the configuration from a file is left to the
//! caller.

pub mod account;
pub use account::*;

pub mod filter;
pub use filter::*;

#[cfg(feature = "imap-backend")]
pub mod imap;
#[cfg(feature = "imap-backend")]
pub use self::imap::*;

#[cfg(feature = "maildir-backend")]
pub mod maildir;
#[cfg(feature = "maildir-backend")]
pub use self::maildir::*;
