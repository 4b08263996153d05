//! Maildir filename module.
//!
//! Maildir messages carry their metadata in their filename:
//! `<secs>_<seq>.<pid>.<host>,U=<uid>,FMD5=<md5>:2,<flags>`. The uid
//! is only trusted when the folder fingerprint `FMD5` matches the
//! folder the message is found in.

use chrono::{DateTime, TimeZone, Utc};
use gethostname::gethostname;
use std::{
    process,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{Flag, Flags};

const INFO_SEP: &str = ":2,";

static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Returns the fingerprint of a folder name.
pub fn fmd5<N: AsRef<str>>(folder: N) -> String {
    format!("{:x}", md5::compute(folder.as_ref()))
}

/// Returns the host name, with the characters reserved by the
/// Maildir naming scheme escaped.
fn hostname() -> String {
    let host = gethostname().to_string_lossy().trim().to_owned();
    let host = if host.is_empty() { String::from("localhost") } else { host };
    host.replace('/', "\\057").replace(':', "\\072")
}

/// Represents the parsed filename of a Maildir message.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MaildirFilename {
    /// Represents the unique part of the name.
    pub base: String,
    pub uid: Option<i64>,
    pub fmd5: Option<String>,
    pub flags: Flags,
}

impl MaildirFilename {
    /// Builds the filename of a new message.
    pub fn new(received: Option<DateTime<Utc>>, uid: i64, fmd5: String, flags: Flags) -> Self {
        let secs = received.unwrap_or_else(Utc::now).timestamp();
        let seq = SEQUENCE.fetch_add(1, Ordering::SeqCst);
        Self {
            base: format!("{}_{}.{}.{}", secs, seq, process::id(), hostname()),
            uid: Some(uid),
            fmd5: Some(fmd5),
            flags,
        }
    }

    pub fn parse(name: &str) -> Self {
        let (head, info) = match name.rsplit_once(INFO_SEP) {
            Some((head, info)) => (head, Some(info)),
            None => (name, None),
        };

        let mut parts = head.split(',');
        let mut filename = Self {
            base: parts.next().unwrap_or_default().to_owned(),
            flags: info
                .map(|info| info.chars().filter_map(Flag::from_char).collect())
                .unwrap_or_default(),
            ..Self::default()
        };

        for part in parts {
            if let Some(uid) = part.strip_prefix("U=") {
                filename.uid = uid.parse().ok();
            } else if let Some(fmd5) = part.strip_prefix("FMD5=") {
                filename.fmd5 = Some(fmd5.to_owned());
            }
        }

        filename
    }

    /// Returns the uid of the message, if it belongs to the folder
    /// with the given fingerprint.
    pub fn uid_in(&self, fmd5: &str) -> Option<i64> {
        match (&self.uid, &self.fmd5) {
            (Some(uid), Some(found)) if found == fmd5 && *uid > 0 => Some(*uid),
            (Some(uid), None) if *uid > 0 => Some(*uid),
            _ => None,
        }
    }

    /// Returns the name without its info suffix, as expected for
    /// messages living in `new`.
    pub fn to_new_string(&self) -> String {
        let mut name = self.base.clone();
        if let Some(uid) = self.uid {
            name.push_str(&format!(",U={}", uid));
        }
        if let Some(fmd5) = &self.fmd5 {
            name.push_str(&format!(",FMD5={}", fmd5));
        }
        name
    }

    /// Returns the delivery date encoded in the name.
    pub fn received(&self) -> Option<DateTime<Utc>> {
        let secs: String = self.base.chars().take_while(char::is_ascii_digit).collect();
        let secs = secs.parse().ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }
}

impl std::fmt::Display for MaildirFilename {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.to_new_string(), INFO_SEP, self.flags)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{fmd5, MaildirFilename};
    use crate::Flags;

    #[test]
    fn parse_full_name() {
        let md5 = fmd5("INBOX");
        let name = format!("1672531200_3.42.host,U=17,FMD5={}:2,FS", md5);
        let filename = MaildirFilename::parse(&name);
        assert_eq!(filename.base, "1672531200_3.42.host");
        assert_eq!(filename.uid_in(&md5), Some(17));
        assert_eq!(filename.flags, Flags::from("FS"));
        assert_eq!(
            filename.received(),
            Utc.timestamp_opt(1672531200, 0).single()
        );
        assert_eq!(filename.to_string(), name);
    }

    #[test]
    fn foreign_or_missing_uids_are_ignored() {
        let filename = MaildirFilename::parse("1672531200.M1P2.host:2,S");
        assert_eq!(filename.uid_in(&fmd5("INBOX")), None);

        let name = format!("1672531200_3.42.host,U=17,FMD5={}:2,", fmd5("Sent"));
        assert_eq!(MaildirFilename::parse(&name).uid_in(&fmd5("INBOX")), None);

        let filename = MaildirFilename::parse("1672531200_3.42.host,U=5");
        assert_eq!(filename.uid_in(&fmd5("INBOX")), Some(5));
        assert!(filename.flags.is_empty());
    }

    #[test]
    fn new_names_are_unique() {
        let a = MaildirFilename::new(None, 1, fmd5("INBOX"), Flags::default());
        let b = MaildirFilename::new(None, 1, fmd5("INBOX"), Flags::default());
        assert_ne!(a.base, b.base);
        assert!(a.to_string().ends_with(":2,"));
        assert!(!a.to_new_string().contains(':'));
        assert_eq!(MaildirFilename::parse(&a.to_new_string()), a);

        let host = a.base.splitn(3, '.').nth(2).unwrap();
        assert!(!host.is_empty());
        assert!(!host.contains('/'));
    }
}
