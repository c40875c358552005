//! Store-backed connector
//!
//! [`DbConnector`] answers every engine call from the [`MailStore`] and
//! records an update for each mutation. Store writes always commit before
//! the mailbox cache is touched and before the update is queued, so a
//! failed write leaves both untouched and a lost update is repaired by the
//! next resync.

mod ops;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::context::Context;
use crate::error::{ConnectorError, DispatchError};
use crate::mapping;
use crate::models::{
    FlagSet, Mailbox, MailboxId, MailboxStatus, MailboxVisibility, Message, MessageCreated,
    MessageId, UserConfig, join_name, split_name,
};
use crate::naming::NamingPolicy;
use crate::state::MailboxState;
use crate::storage::{FlagChange, MailStore, MailboxRecord, NewMessage, Removal};
use crate::sync::{self, SyncStats, cooldown_elapsed};
use crate::updates::{Dispatcher, DispatcherConfig, UpdateKind};

/// Per-connector settings, usually derived from
/// [`BridgeConfig`](crate::config::BridgeConfig)
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub naming: NamingPolicy,
    /// Separator between mailbox path segments in stored names
    pub delimiter: String,
    pub dispatcher: DispatcherConfig,
    /// Minimum gap between on-demand resyncs
    pub resync_cooldown_secs: u64,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            naming: NamingPolicy::default(),
            delimiter: "/".to_string(),
            dispatcher: DispatcherConfig::default(),
            resync_cooldown_secs: 0,
        }
    }
}

/// Connector for one user backed by a [`MailStore`]
pub struct DbConnector {
    store: Arc<dyn MailStore>,
    email: String,
    naming: NamingPolicy,
    delimiter: String,
    state: MailboxState,
    dispatcher: Dispatcher,
    /// Populated by the first successful authorize, cleared by close
    user: RwLock<Option<UserConfig>>,
    last_resync: Mutex<Option<DateTime<Utc>>>,
    resync_cooldown_secs: u64,
    /// Set when an update could not be queued; forces the next resync
    stale: AtomicBool,
}

impl DbConnector {
    /// Create a connector for `email` and start its update flush loop
    pub fn new(
        store: Arc<dyn MailStore>,
        email: impl Into<String>,
        options: ConnectorOptions,
    ) -> Self {
        let email = email.into();
        let dispatcher = Dispatcher::start(email.clone(), options.dispatcher);

        Self {
            store,
            email,
            naming: options.naming,
            delimiter: options.delimiter,
            state: MailboxState::default(),
            dispatcher,
            user: RwLock::new(None),
            last_resync: Mutex::new(None),
            resync_cooldown_secs: options.resync_cooldown_secs,
            stale: AtomicBool::new(false),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// The authorized account, if any
    pub fn user(&self) -> Option<UserConfig> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether an update was lost since the last resync
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// `(usage, limit)` in bytes for the authorized account
    pub fn quota(&self) -> Result<(i64, i64), ConnectorError> {
        let user = self.user.read().unwrap_or_else(PoisonError::into_inner);
        let user = user.as_ref().ok_or(ConnectorError::NotAuthorized)?;
        Ok((user.usage, user.mailbox_size))
    }

    pub fn mark_messages_deleted(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        deleted: bool,
    ) -> Result<(), ConnectorError> {
        self.apply_flag_change(ctx, ids, FlagChange::Deleted(deleted))
    }

    pub fn mark_messages_answered(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        answered: bool,
    ) -> Result<(), ConnectorError> {
        self.apply_flag_change(ctx, ids, FlagChange::Answered(answered))
    }

    /// Permanently remove messages marked deleted from a mailbox
    ///
    /// Messages that still live in another mailbox only lose this one.
    pub fn expunge(
        &self,
        ctx: &Context,
        mailbox_id: &MailboxId,
    ) -> Result<Removal, ConnectorError> {
        self.mailbox_name(ctx, mailbox_id)?;
        let removal = self.store.expunge(ctx, &self.email, mailbox_id)?;
        self.announce_removal(ctx, &removal)?;

        info!(
            "[{}] Expunged mailbox {}: {} deleted, {} detached",
            self.email,
            mailbox_id,
            removal.deleted.len(),
            removal.detached.len()
        );
        Ok(removal)
    }

    pub fn set_mailbox_visibility(
        &self,
        ctx: &Context,
        id: &MailboxId,
        visibility: MailboxVisibility,
    ) -> Result<(), ConnectorError> {
        self.mailbox_name(ctx, id)?;
        let hidden = visibility == MailboxVisibility::Hidden;
        if !self.store.set_mailbox_hidden(ctx, &self.email, id, hidden)? {
            return Err(ConnectorError::NoSuchMailbox(id.clone()));
        }
        self.state.set_visibility(id, visibility)?;
        debug!("[{}] Mailbox {} is now {:?}", self.email, id, visibility);
        Ok(())
    }

    /// Invalidate the engine's UIDs for a mailbox
    pub fn bump_uid_validity(&self, ctx: &Context, id: &MailboxId) -> Result<u32, ConnectorError> {
        let uid_validity = self
            .store
            .bump_uid_validity(ctx, &self.email, id)?
            .ok_or_else(|| ConnectorError::NoSuchMailbox(id.clone()))?;
        self.publish(UpdateKind::UidValidityBumped {
            mailbox_id: id.clone(),
            uid_validity,
        })?;
        info!(
            "[{}] UID validity of mailbox {} is now {}",
            self.email, id, uid_validity
        );
        Ok(uid_validity)
    }

    pub fn mailbox_status(
        &self,
        ctx: &Context,
        id: &MailboxId,
    ) -> Result<MailboxStatus, ConnectorError> {
        self.mailbox_name(ctx, id)?;
        Ok(self.store.mailbox_status(ctx, &self.email, id)?)
    }

    /// Deliver a message that arrived from outside the engine
    pub fn receive_message(
        &self,
        ctx: &Context,
        mailbox_name: &[String],
        literal: &[u8],
    ) -> Result<Message, ConnectorError> {
        let mailbox_id = match self.state.find_by_name(mailbox_name) {
            Some(id) => id,
            None => {
                let joined = join_name(mailbox_name, &self.delimiter);
                let record = self
                    .store
                    .find_mailbox_by_name(ctx, &self.email, &joined)?
                    .ok_or_else(|| ConnectorError::NoSuchMailbox(MailboxId::new(joined)))?;
                self.remember(&record)?;
                record.id
            }
        };

        let (message, _) =
            self.insert_and_announce(ctx, &mailbox_id, literal, &FlagSet::new(), Utc::now())?;
        info!(
            "[{}] Received message {} into {}",
            self.email, message.id, mailbox_id
        );
        Ok(message)
    }

    /// Rebuild the engine's cache from the store
    pub fn resync(&self, ctx: &Context) -> Result<SyncStats, ConnectorError> {
        sync::resync(self, ctx)
    }

    /// Resync unless one ran within the cooldown
    ///
    /// A connector that lost an update resyncs regardless of the cooldown.
    pub fn resync_if_due(&self, ctx: &Context) -> Result<Option<SyncStats>, ConnectorError> {
        let last = *self.last_resync.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_stale() && !cooldown_elapsed(last, self.resync_cooldown_secs) {
            debug!("[{}] Resync skipped, still in cooldown", self.email);
            return Ok(None);
        }
        self.resync(ctx).map(Some)
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Record a finished resync
    pub(crate) fn mark_resynced(&self, at: DateTime<Utc>) {
        *self.last_resync.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    /// Clear the stale marker, returning whether it was set
    pub(crate) fn take_stale(&self) -> bool {
        self.stale.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Queue an update after a committed write
    ///
    /// A full queue under the reject policy is not an error for the caller:
    /// the write already committed, so the connector is marked stale and the
    /// next resync repairs the engine cache.
    pub(crate) fn publish(&self, kind: UpdateKind) -> Result<(), ConnectorError> {
        match self.dispatcher.enqueue(kind) {
            Ok(()) => Ok(()),
            Err(DispatchError::QueueFull { limit }) => {
                warn!(
                    "[{}] Update dropped, queue holds {} entries; engine cache stale until resync",
                    self.email, limit
                );
                self.mark_stale();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load every stored mailbox into the cache
    ///
    /// Mailboxes whose names break the naming policy are skipped. Cache
    /// entries without a stored row are dropped. Returns the valid mailboxes
    /// in store order and the number skipped.
    pub(crate) fn refresh_mailboxes(
        &self,
        ctx: &Context,
    ) -> Result<(Vec<Mailbox>, usize), ConnectorError> {
        let records = self.store.list_mailboxes(ctx, &self.email)?;

        let mut valid = Vec::with_capacity(records.len());
        let mut skipped = 0;
        for record in records {
            match self.remember(&record) {
                Ok(_) => valid.push(record.id),
                Err(ConnectorError::InvalidPrefix { expected }) => {
                    warn!(
                        "[{}] Skipping mailbox {:?}: name must start with {}",
                        self.email, record.name, expected
                    );
                    self.state.remove_mailbox(&record.id);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        for cached in self.state.list_mailboxes() {
            if !valid.contains(&cached.id) {
                debug!("[{}] Dropping stale cache entry {}", self.email, cached.id);
                self.state.remove_mailbox(&cached.id);
            }
        }

        // Render after the cache is complete so child attributes are right
        let mailboxes = valid
            .iter()
            .map(|id| self.state.get_mailbox(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((mailboxes, skipped))
    }

    /// Cache a stored mailbox row
    fn remember(&self, record: &MailboxRecord) -> Result<Mailbox, ConnectorError> {
        let name = split_name(&record.name, &self.delimiter);
        let exclusive = self.naming.validate_name(&name)?;
        let mailbox = self.state.create_mailbox(record.id.clone(), name, exclusive);
        let visibility = if record.hidden {
            MailboxVisibility::Hidden
        } else {
            MailboxVisibility::Visible
        };
        self.state.set_visibility(&record.id, visibility)?;
        Ok(mailbox)
    }

    /// Cached path of a mailbox, loading it from the store on a miss
    fn mailbox_name(&self, ctx: &Context, id: &MailboxId) -> Result<Vec<String>, ConnectorError> {
        if let Ok(name) = self.state.name(id) {
            return Ok(name);
        }
        let record = self
            .store
            .get_mailbox(ctx, &self.email, id)?
            .ok_or_else(|| ConnectorError::NoSuchMailbox(id.clone()))?;
        Ok(self.remember(&record)?.name)
    }

    fn is_exclusive(&self, ctx: &Context, id: &MailboxId) -> Result<bool, ConnectorError> {
        self.mailbox_name(ctx, id)?;
        self.state.is_exclusive(id)
    }

    fn insert_and_announce(
        &self,
        ctx: &Context,
        mailbox_id: &MailboxId,
        literal: &[u8],
        flags: &FlagSet,
        date: DateTime<Utc>,
    ) -> Result<(Message, Vec<u8>), ConnectorError> {
        self.mailbox_name(ctx, mailbox_id)?;

        let record = self.store.insert_message(
            ctx,
            &self.email,
            &NewMessage {
                mailbox_id: mailbox_id.clone(),
                literal: literal.to_vec(),
                flags: mapping::from_flags(flags),
                thread_id: None,
                received_at: date,
            },
        )?;

        let message = Message {
            id: record.id.clone(),
            flags: mapping::to_flags(&record.flags),
            date: record.received_at,
            thread_id: record.thread_id,
        };
        self.publish(UpdateKind::MessagesCreated(vec![MessageCreated {
            message: message.clone(),
            literal: literal.to_vec(),
            mailbox_ids: record.mailbox_ids,
        }]))?;

        Ok((message, literal.to_vec()))
    }

    /// Apply one flag column change to every message, then announce the
    /// recomputed flag sets
    fn apply_flag_change(
        &self,
        ctx: &Context,
        ids: &[MessageId],
        change: FlagChange,
    ) -> Result<(), ConnectorError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.store.update_flags(ctx, &self.email, ids, change)?;

        for id in ids {
            if let Some(record) = self.store.get_message(ctx, &self.email, id)? {
                self.publish(UpdateKind::MessageFlagsUpdated {
                    message_id: record.id,
                    flags: mapping::to_flags(&record.flags),
                })?;
            }
        }

        info!("[{}] Applied {:?} to {} messages", self.email, change, ids.len());
        Ok(())
    }

    /// Announce the current mailbox memberships of each message
    fn announce_memberships(&self, ctx: &Context, ids: &[MessageId]) -> Result<(), ConnectorError> {
        for id in ids {
            match self.store.get_message(ctx, &self.email, id)? {
                Some(record) => self.publish(UpdateKind::MessageMailboxesUpdated {
                    message_id: record.id,
                    flags: mapping::to_flags(&record.flags),
                    mailbox_ids: record.mailbox_ids,
                })?,
                None => debug!("[{}] Message {} vanished before announcement", self.email, id),
            }
        }
        Ok(())
    }

    fn announce_removal(&self, ctx: &Context, removal: &Removal) -> Result<(), ConnectorError> {
        self.announce_memberships(ctx, &removal.detached)?;
        for id in &removal.deleted {
            self.publish(UpdateKind::MessageDeleted(id.clone()))?;
        }
        Ok(())
    }
}

fn is_inbox(name: &[String]) -> bool {
    matches!(name, [only] if only.eq_ignore_ascii_case("INBOX"))
}

#[cfg(test)]
mod tests;
