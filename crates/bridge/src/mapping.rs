//! Translation between stored message columns and engine flags
//!
//! Stored rows carry six boolean columns, a priority enum and a JSON tag
//! list. The engine only knows flag tokens. Everything here is pure so the
//! connector and the resynchronizer derive identical flag sets from the same
//! row.

use log::warn;

use crate::models::flags::{
    ATTR_ALL, ATTR_ARCHIVE, ATTR_DRAFTS, ATTR_HAS_CHILDREN, ATTR_HAS_NO_CHILDREN, ATTR_IMPORTANT,
    ATTR_JUNK, ATTR_SENT, ATTR_TRASH, FLAG_ANSWERED, FLAG_DELETED, FLAG_DRAFT, FLAG_FLAGGED,
    FLAG_SEEN,
};
use crate::models::{FlagSet, Priority};

/// Keyword for the `important` column
pub const KEYWORD_IMPORTANT: &str = "$Important";
/// Keyword for the `pinned` column
pub const KEYWORD_PINNED: &str = "$Pinned";
/// Advertised so clients may archive, never derived from a column
pub const KEYWORD_ARCHIVED: &str = "$Archived";

pub const KEYWORD_HIGH_PRIORITY: &str = "$HighPriority";
pub const KEYWORD_NORMAL_PRIORITY: &str = "$NormalPriority";
pub const KEYWORD_LOW_PRIORITY: &str = "$LowPriority";

/// Flag-relevant columns of a stored message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredFlags {
    pub seen: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub answered: bool,
    pub important: bool,
    pub pinned: bool,
    pub priority: Priority,
    /// Free-form keywords, persisted as a JSON array
    pub tags: Vec<String>,
}

/// Flags clients may set in every mailbox
pub fn default_flags() -> FlagSet {
    [
        FLAG_SEEN,
        FLAG_ANSWERED,
        FLAG_FLAGGED,
        FLAG_DELETED,
        FLAG_DRAFT,
        KEYWORD_IMPORTANT,
        KEYWORD_PINNED,
        KEYWORD_ARCHIVED,
    ]
    .into_iter()
    .collect()
}

/// Flags that persist across sessions
pub fn default_permanent_flags() -> FlagSet {
    default_flags()
}

/// Attributes shared by every mailbox
pub fn default_attributes() -> FlagSet {
    FlagSet::new()
}

/// Keyword for a priority value. Exactly one per priority.
pub fn priority_keyword(priority: Priority) -> &'static str {
    match priority {
        Priority::High => KEYWORD_HIGH_PRIORITY,
        Priority::Normal => KEYWORD_NORMAL_PRIORITY,
        Priority::Low => KEYWORD_LOW_PRIORITY,
    }
}

/// Build the engine flag set for a stored message
pub fn to_flags(stored: &StoredFlags) -> FlagSet {
    let mut flags = FlagSet::new();

    if stored.seen {
        flags.insert(FLAG_SEEN);
    }
    if stored.flagged {
        flags.insert(FLAG_FLAGGED);
    }
    if stored.deleted {
        flags.insert(FLAG_DELETED);
    }
    if stored.answered {
        flags.insert(FLAG_ANSWERED);
    }
    if stored.important {
        flags.insert(KEYWORD_IMPORTANT);
    }
    if stored.pinned {
        flags.insert(KEYWORD_PINNED);
    }

    flags.insert(priority_keyword(stored.priority));

    for tag in &stored.tags {
        flags.insert(tag.as_str());
    }

    flags
}

/// Project an engine flag set back onto stored columns
///
/// Lossless for the six boolean columns and the priority. If a client set
/// several priority keywords, high wins over low, low over normal. Every
/// remaining non-system token becomes a tag.
pub fn from_flags(flags: &FlagSet) -> StoredFlags {
    let priority = if flags.contains(KEYWORD_HIGH_PRIORITY) {
        Priority::High
    } else if flags.contains(KEYWORD_LOW_PRIORITY) {
        Priority::Low
    } else {
        Priority::Normal
    };

    let tags = flags
        .iter()
        .filter(|flag| !is_reserved(flag))
        .map(str::to_string)
        .collect();

    StoredFlags {
        seen: flags.contains(FLAG_SEEN),
        flagged: flags.contains(FLAG_FLAGGED),
        deleted: flags.contains(FLAG_DELETED),
        answered: flags.contains(FLAG_ANSWERED),
        important: flags.contains(KEYWORD_IMPORTANT),
        pinned: flags.contains(KEYWORD_PINNED),
        priority,
        tags,
    }
}

fn is_reserved(flag: &str) -> bool {
    flag.starts_with('\\')
        || matches!(
            flag,
            KEYWORD_IMPORTANT
                | KEYWORD_PINNED
                | KEYWORD_HIGH_PRIORITY
                | KEYWORD_NORMAL_PRIORITY
                | KEYWORD_LOW_PRIORITY
        )
}

/// Decode the JSON tag column. Bad data yields no tags.
pub fn parse_tags(raw: Option<&str>) -> Vec<String> {
    match raw {
        Some(json) if !json.trim().is_empty() => serde_json::from_str(json).unwrap_or_else(|e| {
            warn!("Ignoring malformed tag list {:?}: {}", json, e);
            Vec::new()
        }),
        _ => Vec::new(),
    }
}

/// Encode tags for the JSON tag column
pub fn tags_to_json(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

/// Special-use and structural attributes for a mailbox
///
/// Matching is case-insensitive on the leaf name. INBOX gets no special-use
/// attribute; it is implicit and must remain selectable.
pub fn mailbox_attributes(mailbox_name: &str, has_children: bool) -> FlagSet {
    let mut attrs = FlagSet::new();

    let special = match mailbox_name.to_lowercase().as_str() {
        "sent" => Some(ATTR_SENT),
        "drafts" => Some(ATTR_DRAFTS),
        "trash" | "deleted" => Some(ATTR_TRASH),
        "spam" | "junk" => Some(ATTR_JUNK),
        "archive" => Some(ATTR_ARCHIVE),
        "important" => Some(ATTR_IMPORTANT),
        "all" => Some(ATTR_ALL),
        _ => None,
    };
    if let Some(attr) = special {
        attrs.insert(attr);
    }

    attrs.insert(if has_children {
        ATTR_HAS_CHILDREN
    } else {
        ATTR_HAS_NO_CHILDREN
    });

    attrs
}
