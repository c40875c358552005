//! The engine-facing operation set

use std::sync::PoisonError;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::{DbConnector, is_inbox};
use crate::auth::validate_password;
use crate::context::Context;
use crate::engine::Connector;
use crate::error::ConnectorError;
use crate::mapping;
use crate::models::{
    FlagSet, Mailbox, MailboxId, MailboxVisibility, Message, MessageCreated, MessageId, join_name,
};
use crate::storage::FlagChange;
use crate::updates::{UpdateKind, UpdateStream};

impl Connector for DbConnector {
    fn authorize(&self, ctx: &Context, username: &str, password: &[u8]) -> bool {
        // One message for every failure so callers cannot tell which accounts exist
        let reject = || {
            warn!("[{}] Authentication failed for {:?}", self.email, username);
            false
        };

        if !username.eq_ignore_ascii_case(&self.email) {
            return reject();
        }
        let account = match self.store.find_account(ctx, &self.email) {
            Ok(Some(account)) => account,
            Ok(None) => return reject(),
            Err(e) => {
                debug!("[{}] Account lookup failed: {}", self.email, e);
                return reject();
            }
        };
        if !validate_password(&account.hash, password) {
            return reject();
        }

        let mut user = self.user.write().unwrap_or_else(PoisonError::into_inner);
        if user.is_none() {
            *user = Some(account.into_user_config());
            info!("[{}] Authorized", self.email);
        }
        true
    }

    fn create_mailbox(&self, ctx: &Context, name: &[String]) -> Result<Mailbox, ConnectorError> {
        let exclusive = self.naming.validate_name(name)?;
        let joined = join_name(name, &self.delimiter);

        let record = self.store.create_mailbox(ctx, &self.email, &joined)?;
        let mailbox = self
            .state
            .create_mailbox(record.id.clone(), name.to_vec(), exclusive);
        self.publish(UpdateKind::MailboxCreated(mailbox.clone()))?;

        info!(
            "[{}] Created mailbox {:?} ({})",
            self.email, joined, record.id
        );
        Ok(mailbox)
    }

    fn delete_mailbox(&self, ctx: &Context, id: &MailboxId) -> Result<(), ConnectorError> {
        let name = self.mailbox_name(ctx, id)?;
        if is_inbox(&name) {
            return Err(ConnectorError::DeleteForbidden(join_name(
                &name,
                &self.delimiter,
            )));
        }

        let Some(removal) = self.store.delete_mailbox(ctx, &self.email, id)? else {
            self.state.remove_mailbox(id);
            return Err(ConnectorError::NoSuchMailbox(id.clone()));
        };
        self.state.remove_mailbox(id);
        self.announce_removal(ctx, &removal)?;
        self.publish(UpdateKind::MailboxDeleted(id.clone()))?;

        info!(
            "[{}] Deleted mailbox {} ({} messages deleted)",
            self.email,
            id,
            removal.deleted.len()
        );
        Ok(())
    }

    fn update_mailbox_name(
        &self,
        ctx: &Context,
        id: &MailboxId,
        name: &[String],
    ) -> Result<(), ConnectorError> {
        let current = self.mailbox_name(ctx, id)?;
        if is_inbox(&current) {
            return Err(ConnectorError::RenameForbidden(join_name(
                &current,
                &self.delimiter,
            )));
        }
        let exclusive = self.naming.validate_name(name)?;
        let joined = join_name(name, &self.delimiter);

        if !self.store.rename_mailbox(ctx, &self.email, id, &joined)? {
            self.state.remove_mailbox(id);
            return Err(ConnectorError::NoSuchMailbox(id.clone()));
        }
        self.state.rename_mailbox(id, name.to_vec(), exclusive)?;
        self.publish(UpdateKind::MailboxRenamed {
            mailbox_id: id.clone(),
            name: name.to_vec(),
        })?;

        info!("[{}] Renamed mailbox {} to {:?}", self.email, id, joined);
        Ok(())
    }

    fn create_message(
        &self,
        ctx: &Context,
        mailbox_id: &MailboxId,
        literal: &[u8],
        flags: &FlagSet,
        date: DateTime<Utc>,
    ) -> Result<(Message, Vec<u8>), ConnectorError> {
        let created = self.insert_and_announce(ctx, mailbox_id, literal, flags, date)?;
        info!(
            "[{}] Appended message {} to {} ({} bytes)",
            self.email,
            created.0.id,
            mailbox_id,
            literal.len()
        );
        Ok(created)
    }

    fn add_messages_to_mailbox(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        mailbox_id: &MailboxId,
    ) -> Result<(), ConnectorError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.mailbox_name(ctx, mailbox_id)?;
        self.store.add_to_mailbox(ctx, &self.email, ids, mailbox_id)?;
        self.announce_memberships(ctx, ids)?;

        info!(
            "[{}] Added {} messages to {}",
            self.email,
            ids.len(),
            mailbox_id
        );
        Ok(())
    }

    fn remove_messages_from_mailbox(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        mailbox_id: &MailboxId,
    ) -> Result<(), ConnectorError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.mailbox_name(ctx, mailbox_id)?;
        let removal = self
            .store
            .remove_from_mailbox(ctx, &self.email, ids, mailbox_id)?;
        self.announce_removal(ctx, &removal)?;

        info!(
            "[{}] Removed {} messages from {} ({} deleted)",
            self.email,
            ids.len(),
            mailbox_id,
            removal.deleted.len()
        );
        Ok(())
    }

    fn move_messages(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        from: &MailboxId,
        to: &MailboxId,
    ) -> Result<bool, ConnectorError> {
        let from_exclusive = self.is_exclusive(ctx, from)?;
        let to_exclusive = self.is_exclusive(ctx, to)?;
        if ids.is_empty() {
            return Ok(true);
        }
        // Nothing moves; the source is also the destination and must stay
        if from == to {
            debug!("[{}] Move of {} messages within {}", self.email, ids.len(), from);
            return Ok(false);
        }

        // Filing a message from a folder under a label keeps it in the folder
        let remove_source = if from_exclusive && !to_exclusive {
            self.store.add_to_mailbox(ctx, &self.email, ids, to)?;
            false
        } else {
            self.store.move_messages(ctx, &self.email, ids, from, to)?;
            true
        };
        self.announce_memberships(ctx, ids)?;

        info!(
            "[{}] {} {} messages from {} to {}",
            self.email,
            if remove_source { "Moved" } else { "Copied" },
            ids.len(),
            from,
            to
        );
        Ok(remove_source)
    }

    fn mark_messages_seen(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        seen: bool,
    ) -> Result<(), ConnectorError> {
        self.apply_flag_change(ctx, ids, FlagChange::Seen(seen))
    }

    fn mark_messages_flagged(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        flagged: bool,
    ) -> Result<(), ConnectorError> {
        self.apply_flag_change(ctx, ids, FlagChange::Flagged(flagged))
    }

    fn get_message_literal(
        &self,
        ctx: &Context,
        id: &MessageId,
    ) -> Result<Vec<u8>, ConnectorError> {
        self.store
            .get_literal(ctx, &self.email, id)?
            .ok_or_else(|| ConnectorError::NoSuchMessage(id.clone()))
    }

    fn mailbox_visibility(&self, id: &MailboxId) -> MailboxVisibility {
        self.state.visibility(id).unwrap_or_default()
    }

    fn list_mailboxes(&self, ctx: &Context) -> Result<Vec<Mailbox>, ConnectorError> {
        let (mailboxes, _) = self.refresh_mailboxes(ctx)?;
        Ok(mailboxes)
    }

    fn list_messages(
        &self,
        ctx: &Context,
        mailbox_id: &MailboxId,
    ) -> Result<Vec<MessageCreated>, ConnectorError> {
        let records = self.store.list_messages(ctx, &self.email, mailbox_id)?;

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            let Some(literal) = self.store.get_literal(ctx, &self.email, &record.id)? else {
                debug!("[{}] Message {} vanished while listing", self.email, record.id);
                continue;
            };
            messages.push(MessageCreated {
                message: Message {
                    id: record.id,
                    flags: mapping::to_flags(&record.flags),
                    date: record.received_at,
                    thread_id: record.thread_id,
                },
                literal,
                mailbox_ids: record.mailbox_ids,
            });
        }
        Ok(messages)
    }

    fn get_updates(&self) -> UpdateStream {
        self.dispatcher.updates()
    }

    fn close(&self, _ctx: &Context) -> Result<(), ConnectorError> {
        self.dispatcher.close();
        self.state.clear();
        self.user
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("[{}] Connector closed", self.email);
        Ok(())
    }
}
