//! Flag sets exchanged with the engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// System flag names understood by every IMAP client
pub const FLAG_SEEN: &str = "\\Seen";
pub const FLAG_ANSWERED: &str = "\\Answered";
pub const FLAG_FLAGGED: &str = "\\Flagged";
pub const FLAG_DELETED: &str = "\\Deleted";
pub const FLAG_DRAFT: &str = "\\Draft";

/// Mailbox attributes (RFC 3501 / RFC 6154 / RFC 8457)
pub const ATTR_HAS_CHILDREN: &str = "\\HasChildren";
pub const ATTR_HAS_NO_CHILDREN: &str = "\\HasNoChildren";
pub const ATTR_ALL: &str = "\\All";
pub const ATTR_ARCHIVE: &str = "\\Archive";
pub const ATTR_DRAFTS: &str = "\\Drafts";
pub const ATTR_IMPORTANT: &str = "\\Important";
pub const ATTR_JUNK: &str = "\\Junk";
pub const ATTR_SENT: &str = "\\Sent";
pub const ATTR_TRASH: &str = "\\Trash";

/// An ordered set of case-sensitive flag tokens
///
/// Ordering is lexical so two sets built from the same tokens in a
/// different order compare and render identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagSet(BTreeSet<String>);

impl FlagSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Add a flag, returning the set (builder style)
    pub fn with(mut self, flag: impl Into<String>) -> Self {
        self.insert(flag);
        self
    }

    /// Add a flag. Returns false if it was already present.
    pub fn insert(&mut self, flag: impl Into<String>) -> bool {
        self.0.insert(flag.into())
    }

    pub fn remove(&mut self, flag: &str) -> bool {
        self.0.remove(flag)
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.0.contains(flag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Union of two sets
    pub fn union(&self, other: &FlagSet) -> FlagSet {
        FlagSet(self.0.union(&other.0).cloned().collect())
    }
}

impl<S: Into<String>> FromIterator<S> for FlagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, flag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", flag)?;
        }
        write!(f, ")")
    }
}
