//! IMAP flags module.
//!
//! This module contains the conversion between IMAP system flags and
//! keywords on one side, and flag codes on the other side.

use log::trace;
use std::collections::HashMap;

use crate::{Flag, Flags};

/// Converts IMAP flags into flags. Keywords are converted through
/// the given keyword table, unknown ones are ignored.
pub fn from_imap_flags<S: AsRef<str>>(imap_flags: &[S], keywords: &HashMap<char, String>) -> Flags {
    imap_flags
        .iter()
        .filter_map(|flag| {
            let flag = flag.as_ref();
            let converted = match flag.to_ascii_lowercase().as_str() {
                "\\seen" => Some(Flag::Seen),
                "\\answered" => Some(Flag::Replied),
                "\\flagged" => Some(Flag::Flagged),
                "\\deleted" => Some(Flag::Trashed),
                "\\draft" => Some(Flag::Draft),
                "$forwarded" => Some(Flag::Passed),
                _ => keywords
                    .iter()
                    .find(|(_, keyword)| keyword.eq_ignore_ascii_case(flag))
                    .map(|(code, _)| Flag::Keyword(*code)),
            };
            if converted.is_none() {
                trace!("ignoring imap flag {}", flag);
            }
            converted
        })
        .collect()
}

/// Converts flags into IMAP flags. Keywords missing from the keyword
/// table are ignored.
pub fn into_imap_flags(flags: &Flags, keywords: &HashMap<char, String>) -> Vec<String> {
    flags
        .iter()
        .filter_map(|flag| match flag {
            Flag::Seen => Some("\\Seen".to_owned()),
            Flag::Replied => Some("\\Answered".to_owned()),
            Flag::Flagged => Some("\\Flagged".to_owned()),
            Flag::Trashed => Some("\\Deleted".to_owned()),
            Flag::Draft => Some("\\Draft".to_owned()),
            Flag::Passed => Some("$Forwarded".to_owned()),
            Flag::Keyword(code) => keywords.get(code).cloned(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{from_imap_flags, into_imap_flags};
    use crate::{Flag, Flags};

    #[test]
    fn system_flags() {
        let keywords = HashMap::new();
        let flags = from_imap_flags(&["\\Seen", "\\ANSWERED", "$Forwarded", "\\Recent"], &keywords);
        assert_eq!(flags, Flags::from("PRS"));
        assert_eq!(
            into_imap_flags(&flags, &keywords),
            vec!["$Forwarded", "\\Answered", "\\Seen"]
        );
    }

    #[test]
    fn keywords_go_through_the_table() {
        let keywords = HashMap::from([('a', "$Label1".to_owned())]);
        let flags = from_imap_flags(&["$label1", "$Junk"], &keywords);
        assert_eq!(flags, Flags::from_iter([Flag::Keyword('a')]));

        let flags = Flags::from_iter([Flag::Keyword('a'), Flag::Keyword('b')]);
        assert_eq!(into_imap_flags(&flags, &keywords), vec!["$Label1"]);
    }
}
