//! Boundary with the external protocol engine
//!
//! The engine owns the wire protocol and session state. It drives a
//! [`Connector`] for every stateful operation and consumes the connector's
//! update stream. [`Engine`] is the slice of the engine's user management
//! the connector factory needs.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::context::Context;
use crate::error::{ConnectorError, EngineError};
use crate::models::{
    FlagSet, Mailbox, MailboxId, MailboxVisibility, Message, MessageCreated, MessageId,
};
use crate::updates::UpdateStream;

/// Operations the engine requires from a storage connector
///
/// Implementations must be safe to call from several engine threads at once.
pub trait Connector: Send + Sync {
    /// Check credentials. Any failure is `false`, never an error.
    fn authorize(&self, ctx: &Context, username: &str, password: &[u8]) -> bool;

    fn create_mailbox(&self, ctx: &Context, name: &[String]) -> Result<Mailbox, ConnectorError>;

    fn delete_mailbox(&self, ctx: &Context, id: &MailboxId) -> Result<(), ConnectorError>;

    fn update_mailbox_name(
        &self,
        ctx: &Context,
        id: &MailboxId,
        name: &[String],
    ) -> Result<(), ConnectorError>;

    /// Store an appended message, returning it and its literal
    fn create_message(
        &self,
        ctx: &Context,
        mailbox_id: &MailboxId,
        literal: &[u8],
        flags: &FlagSet,
        date: DateTime<Utc>,
    ) -> Result<(Message, Vec<u8>), ConnectorError>;

    fn add_messages_to_mailbox(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        mailbox_id: &MailboxId,
    ) -> Result<(), ConnectorError>;

    fn remove_messages_from_mailbox(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        mailbox_id: &MailboxId,
    ) -> Result<(), ConnectorError>;

    /// Move messages atomically
    ///
    /// Returns true if the engine should drop the source association, false
    /// when the move was really a copy (folder into label).
    fn move_messages(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        from: &MailboxId,
        to: &MailboxId,
    ) -> Result<bool, ConnectorError>;

    fn mark_messages_seen(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        seen: bool,
    ) -> Result<(), ConnectorError>;

    fn mark_messages_flagged(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        flagged: bool,
    ) -> Result<(), ConnectorError>;

    /// Raw message bytes, for when the engine's own cache lost them
    fn get_message_literal(&self, ctx: &Context, id: &MessageId)
    -> Result<Vec<u8>, ConnectorError>;

    fn mailbox_visibility(&self, id: &MailboxId) -> MailboxVisibility;

    fn list_mailboxes(&self, ctx: &Context) -> Result<Vec<Mailbox>, ConnectorError>;

    fn list_messages(
        &self,
        ctx: &Context,
        mailbox_id: &MailboxId,
    ) -> Result<Vec<MessageCreated>, ConnectorError>;

    fn get_updates(&self) -> UpdateStream;

    fn close(&self, ctx: &Context) -> Result<(), ConnectorError>;
}

/// User registration on the engine side
pub trait Engine: Send + Sync {
    /// Register a new user, returning the identity the engine assigned
    fn add_user(
        &self,
        ctx: &Context,
        connector: Arc<dyn Connector>,
        passphrase: &[u8],
    ) -> Result<String, EngineError>;

    /// Attach a connector to a previously assigned identity
    ///
    /// Returns true if the engine already knew the identity.
    fn load_user(
        &self,
        ctx: &Context,
        connector: Arc<dyn Connector>,
        user_id: &str,
        passphrase: &[u8],
    ) -> Result<bool, EngineError>;

    fn remove_user(&self, ctx: &Context, user_id: &str, with_data: bool)
    -> Result<(), EngineError>;
}
