//! IMAP store config module.
//!
//! This module contains the representation of the IMAP store
//! configuration of the user account.

use serde::Deserialize;
use std::{collections::HashMap, fmt, result};
use thiserror::Error;

use crate::{process, HasSeverity, Severity};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot get imap password")]
    GetPasswdError(#[source] process::Error),
    #[error("cannot get imap password: password is empty")]
    GetPasswdEmptyError,
}

impl HasSeverity for Error {
    fn severity(&self) -> Severity {
        Severity::Store
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the authentication mechanisms, from the strongest to
/// the weakest.
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMechanism {
    Gssapi,
    XOAuth2,
    CramMd5,
    Plain,
    Login,
}

impl AuthMechanism {
    /// Returns the name of the mechanism as advertised in the
    /// `AUTH=` server capabilities. `LOGIN` is the plain IMAP login
    /// command, which is not advertised that way.
    pub fn capability(&self) -> Option<&'static str> {
        match self {
            Self::Gssapi => Some("AUTH=GSSAPI"),
            Self::XOAuth2 => Some("AUTH=XOAUTH2"),
            Self::CramMd5 => Some("AUTH=CRAM-MD5"),
            Self::Plain => Some("AUTH=PLAIN"),
            Self::Login => None,
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gssapi => write!(f, "GSSAPI"),
            Self::XOAuth2 => write!(f, "XOAUTH2"),
            Self::CramMd5 => write!(f, "CRAM-MD5"),
            Self::Plain => write!(f, "PLAIN"),
            Self::Login => write!(f, "LOGIN"),
        }
    }
}

pub const DEFAULT_AUTH_MECHANISMS: [AuthMechanism; 5] = [
    AuthMechanism::Gssapi,
    AuthMechanism::XOAuth2,
    AuthMechanism::CramMd5,
    AuthMechanism::Plain,
    AuthMechanism::Login,
];

/// Represents the IMAP store configuration.
#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImapConfig {
    /// Represents the IMAP server host.
    pub host: String,
    /// Represents the IMAP server port.
    pub port: u16,
    /// Enables SSL.
    pub ssl: Option<bool>,
    /// Enables StartTLS.
    pub starttls: Option<bool>,
    /// Trusts any certificate.
    pub insecure: Option<bool>,
    /// Represents the IMAP server login.
    pub login: String,
    /// Represents the IMAP server password command.
    pub passwd_cmd: String,

    /// Represents the authentication mechanisms to try, in order.
    pub auth_mechanisms: Option<Vec<AuthMechanism>>,
    /// Represents the maximum number of simultaneous sessions.
    pub max_connections: Option<usize>,
    /// Represents the folders watched with IDLE between two
    /// synchronizations, instead of a simple NOOP keepalive.
    pub idle_folders: Option<Vec<String>>,
    /// Expunges folders after deleting messages.
    pub expunge: Option<bool>,
    /// Synchronizes Gmail labels, through the `X-GM-LABELS`
    /// extension.
    pub labels: Option<bool>,
    /// Overrides the namespace root discovered from the server.
    pub reference: Option<String>,
    /// Represents the mapping between flag keyword codes and IMAP
    /// keywords.
    pub keywords: Option<HashMap<char, String>>,
}

impl ImapConfig {
    /// Executes the IMAP password command in order to retrieve the
    /// IMAP server password.
    pub fn passwd(&self) -> Result<String> {
        let passwd = process::run(&self.passwd_cmd).map_err(Error::GetPasswdError)?;
        let passwd = passwd
            .lines()
            .next()
            .filter(|passwd| !passwd.is_empty())
            .ok_or(Error::GetPasswdEmptyError)?;
        Ok(passwd.to_owned())
    }

    /// Gets the SSL IMAP option.
    pub fn ssl(&self) -> bool {
        self.ssl.unwrap_or(true)
    }

    /// Gets the StartTLS IMAP option.
    pub fn starttls(&self) -> bool {
        self.starttls.unwrap_or_default()
    }

    /// Gets the insecure IMAP option.
    pub fn insecure(&self) -> bool {
        self.insecure.unwrap_or_default()
    }

    pub fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        self.auth_mechanisms
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTH_MECHANISMS.to_vec())
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(1).max(1)
    }

    pub fn idle_folders(&self) -> Vec<String> {
        self.idle_folders.clone().unwrap_or_default()
    }

    pub fn expunge(&self) -> bool {
        self.expunge.unwrap_or(true)
    }

    pub fn labels(&self) -> bool {
        self.labels.unwrap_or_default()
    }

    pub fn keywords(&self) -> HashMap<char, String> {
        self.keywords.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthMechanism, ImapConfig};

    #[test]
    fn defaults() {
        let config = ImapConfig::default();
        assert!(config.ssl());
        assert!(!config.starttls());
        assert!(config.expunge());
        assert_eq!(config.max_connections(), 1);
        assert_eq!(config.auth_mechanisms()[0], AuthMechanism::Gssapi);
        assert_eq!(config.auth_mechanisms().last(), Some(&AuthMechanism::Login));
    }

    #[cfg(unix)]
    #[test]
    fn passwd_takes_first_line() {
        let config = ImapConfig {
            passwd_cmd: "printf 'secret\\nignored'".into(),
            ..ImapConfig::default()
        };
        assert_eq!(config.passwd().unwrap(), "secret");

        let config = ImapConfig {
            passwd_cmd: "true".into(),
            ..ImapConfig::default()
        };
        assert!(config.passwd().is_err());
    }
}
