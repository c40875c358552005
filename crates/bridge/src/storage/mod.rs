//! Storage traits and implementations
//!
//! The connector talks to persisted state only through [`MailStore`], so
//! the SQLite store can be swapped for another relational backend.

mod sqlite;
mod traits;

pub use sqlite::SqliteMailStore;
pub use traits::{
    AccountRecord, FlagChange, MailStore, MailboxRecord, MessageRecord, NewAccount, NewMessage,
    Removal,
};
