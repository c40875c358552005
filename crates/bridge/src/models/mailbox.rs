//! Mailbox model as seen by the engine

use serde::{Deserialize, Serialize};
use std::fmt;

use super::FlagSet;

/// Opaque mailbox identifier (database primary key rendered as text)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailboxId(pub String);

impl MailboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MailboxId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MailboxId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rendered mailbox descriptor handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    /// Hierarchical name, one entry per path segment
    pub name: Vec<String>,
    /// Flags clients may set on messages in this mailbox
    pub flags: FlagSet,
    /// Flags that survive across sessions
    pub permanent_flags: FlagSet,
    /// Special-use and structural attributes
    pub attributes: FlagSet,
}

impl Mailbox {
    /// Last path segment, used for special-use detection
    pub fn leaf_name(&self) -> &str {
        self.name.last().map(String::as_str).unwrap_or("")
    }
}

/// Whether a mailbox shows up in LIST responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MailboxVisibility {
    #[default]
    Visible,
    Hidden,
}

/// Message counters for STATUS-style queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailboxStatus {
    pub messages: usize,
    pub unseen: usize,
}

/// Split a stored mailbox name into path segments
pub fn split_name(name: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() {
        return vec![name.to_string()];
    }
    name.split(delimiter).map(str::to_string).collect()
}

/// Join path segments into the stored mailbox name
pub fn join_name(segments: &[String], delimiter: &str) -> String {
    segments.join(delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_join() {
        let parts = split_name("Folders/Work/2024", "/");
        assert_eq!(parts, vec!["Folders", "Work", "2024"]);
        assert_eq!(join_name(&parts, "/"), "Folders/Work/2024");
    }

    #[test]
    fn test_split_without_delimiter() {
        assert_eq!(split_name("INBOX", "/"), vec!["INBOX"]);
        assert_eq!(split_name("a/b", ""), vec!["a/b"]);
    }

    #[test]
    fn test_leaf_name() {
        let mbox = Mailbox {
            id: MailboxId::new("1"),
            name: vec!["Folders".into(), "Sent".into()],
            flags: FlagSet::new(),
            permanent_flags: FlagSet::new(),
            attributes: FlagSet::new(),
        };
        assert_eq!(mbox.leaf_name(), "Sent");
    }
}
