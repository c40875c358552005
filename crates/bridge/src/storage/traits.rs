//! Storage trait definitions

use chrono::{DateTime, Utc};

use crate::context::Context;
use crate::error::StoreError;
use crate::mapping::StoredFlags;
use crate::models::{
    MailboxId, MailboxStatus, MessageId, OpenPgpKeys, SystemEmail, UserConfig, parse_json_column,
};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Row of the `accounts` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: String,
    pub email: String,
    pub hash: String,
    pub tenant_name: String,
    pub mailbox_size: i64,
    pub usage: i64,
    pub key: String,
    pub open_pgp: Option<Vec<u8>>,
    pub system_email: Option<Vec<u8>>,
    pub imap_enabled: bool,
    /// Identity assigned by the engine, once registered
    pub engine_user_id: Option<String>,
}

impl AccountRecord {
    /// Build the connector's user context, tolerating malformed JSON columns
    pub fn into_user_config(self) -> UserConfig {
        let open_pgp: OpenPgpKeys =
            parse_json_column(&self.email, "open_pgp", self.open_pgp.as_deref());
        let system_email: SystemEmail =
            parse_json_column(&self.email, "system_email", self.system_email.as_deref());

        UserConfig {
            id: self.id,
            email: self.email,
            hash: self.hash,
            tenant_name: self.tenant_name,
            mailbox_size: self.mailbox_size,
            usage: self.usage,
            key: self.key,
            open_pgp,
            system_email,
        }
    }
}

/// Input for provisioning an account (normally done by the admin service)
#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub email: String,
    pub password_hash: String,
    pub tenant_name: String,
    pub mailbox_size: i64,
    pub key: String,
    pub open_pgp: Option<OpenPgpKeys>,
    pub system_email: Option<SystemEmail>,
    pub imap_enabled: bool,
}

/// Row of the `mailboxes` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxRecord {
    pub id: MailboxId,
    /// Path segments joined by the configured delimiter
    pub name: String,
    pub hidden: bool,
    pub uid_validity: u32,
}

/// Row of the `messages` table plus its label memberships
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    /// Primary mailbox first, then extra memberships in id order
    pub mailbox_ids: Vec<MailboxId>,
    pub flags: StoredFlags,
    pub thread_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub size: usize,
}

/// Input for inserting a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub mailbox_id: MailboxId,
    pub literal: Vec<u8>,
    pub flags: StoredFlags,
    pub thread_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// A single boolean column change applied to a batch of messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagChange {
    Seen(bool),
    Flagged(bool),
    Deleted(bool),
    Answered(bool),
}

/// Result of detaching messages from a mailbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    /// Still present in at least one other mailbox
    pub detached: Vec<MessageId>,
    /// Had no other mailbox and were deleted
    pub deleted: Vec<MessageId>,
}

impl Removal {
    pub fn is_empty(&self) -> bool {
        self.detached.is_empty() && self.deleted.is_empty()
    }
}

/// Trait for connector storage operations
///
/// Every call is scoped by the owner's email and honours `ctx`: a cancelled
/// context aborts the in-flight statement and yields `StoreError::Cancelled`.
/// Batch mutations are all-or-nothing.
pub trait MailStore: Send + Sync {
    // === Accounts ===

    fn insert_account(&self, ctx: &Context, account: &NewAccount) -> Result<AccountRecord>;

    fn find_account(&self, ctx: &Context, email: &str) -> Result<Option<AccountRecord>>;

    /// Accounts allowed to use IMAP, ordered by email
    fn list_imap_accounts(&self, ctx: &Context) -> Result<Vec<AccountRecord>>;

    /// Persist the engine identity. Returns false if the account is unknown.
    fn set_engine_user_id(&self, ctx: &Context, email: &str, engine_user_id: &str)
    -> Result<bool>;

    // === Mailboxes ===

    fn create_mailbox(&self, ctx: &Context, owner: &str, name: &str) -> Result<MailboxRecord>;

    fn get_mailbox(&self, ctx: &Context, owner: &str, id: &MailboxId)
    -> Result<Option<MailboxRecord>>;

    fn find_mailbox_by_name(
        &self,
        ctx: &Context,
        owner: &str,
        name: &str,
    ) -> Result<Option<MailboxRecord>>;

    /// Mailboxes ordered by name
    fn list_mailboxes(&self, ctx: &Context, owner: &str) -> Result<Vec<MailboxRecord>>;

    fn rename_mailbox(&self, ctx: &Context, owner: &str, id: &MailboxId, name: &str)
    -> Result<bool>;

    /// Delete a mailbox. Messages that live elsewhere too survive; the rest
    /// are deleted with it.
    /// Delete a mailbox, detaching its messages; `None` if it does not exist
    fn delete_mailbox(
        &self,
        ctx: &Context,
        owner: &str,
        id: &MailboxId,
    ) -> Result<Option<Removal>>;

    fn set_mailbox_hidden(
        &self,
        ctx: &Context,
        owner: &str,
        id: &MailboxId,
        hidden: bool,
    ) -> Result<bool>;

    /// Increment the UID validity counter, returning the new value
    fn bump_uid_validity(&self, ctx: &Context, owner: &str, id: &MailboxId)
    -> Result<Option<u32>>;

    fn mailbox_status(&self, ctx: &Context, owner: &str, id: &MailboxId) -> Result<MailboxStatus>;

    // === Messages ===

    fn insert_message(&self, ctx: &Context, owner: &str, message: &NewMessage)
    -> Result<MessageRecord>;

    fn get_message(&self, ctx: &Context, owner: &str, id: &MessageId)
    -> Result<Option<MessageRecord>>;

    fn get_literal(&self, ctx: &Context, owner: &str, id: &MessageId) -> Result<Option<Vec<u8>>>;

    /// Messages in a mailbox (primary or label membership), oldest first
    fn list_messages(&self, ctx: &Context, owner: &str, mailbox_id: &MailboxId)
    -> Result<Vec<MessageRecord>>;

    fn add_to_mailbox(
        &self,
        ctx: &Context,
        owner: &str,
        ids: &[MessageId],
        mailbox_id: &MailboxId,
    ) -> Result<()>;

    fn remove_from_mailbox(
        &self,
        ctx: &Context,
        owner: &str,
        ids: &[MessageId],
        mailbox_id: &MailboxId,
    ) -> Result<Removal>;

    /// Move every message from one mailbox to another, or none of them
    fn move_messages(
        &self,
        ctx: &Context,
        owner: &str,
        ids: &[MessageId],
        from: &MailboxId,
        to: &MailboxId,
    ) -> Result<()>;

    fn update_flags(
        &self,
        ctx: &Context,
        owner: &str,
        ids: &[MessageId],
        change: FlagChange,
    ) -> Result<()>;

    /// Detach every message marked deleted from a mailbox
    fn expunge(&self, ctx: &Context, owner: &str, mailbox_id: &MailboxId) -> Result<Removal>;
}
