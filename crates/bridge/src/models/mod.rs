//! Domain models for connector entities

mod account;
pub mod flags;
mod mailbox;
mod message;

pub(crate) use account::parse_json_column;
pub use account::{OpenPgpKeys, SystemEmail, UserConfig};
pub use flags::FlagSet;
pub use mailbox::{Mailbox, MailboxId, MailboxStatus, MailboxVisibility, join_name, split_name};
pub use message::{Message, MessageCreated, MessageId, Priority};
