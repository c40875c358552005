//! Full rebuild of the engine's cache for one user

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use log::{debug, info, warn};

use crate::connector::DbConnector;
use crate::context::Context;
use crate::engine::Connector;
use crate::error::{ConnectorError, DispatchError};
use crate::models::{MailboxId, MessageId};
use crate::updates::UpdateKind;

/// Statistics from a resync
#[derive(Debug, Default, Clone)]
pub struct SyncStats {
    /// Number of mailboxes announced and acknowledged
    pub mailboxes: usize,
    /// Number of messages announced in creation batches
    pub messages: usize,
    /// Number of extra memberships announced for messages already sent
    /// with an earlier mailbox
    pub memberships: usize,
    /// Number of stored mailboxes skipped for breaking the naming policy
    pub skipped_mailboxes: usize,
    /// Number of mailboxes the engine refused (fail-open only)
    pub rejected_mailboxes: usize,
    /// Duration of the resync
    pub duration_ms: u64,
}

/// Announce every stored mailbox and message to the engine
///
/// Mailboxes go out in name order, each one acknowledged before its
/// messages are queued, so the engine never sees a message in a mailbox it
/// does not know. Each mailbox's messages go out as one batch, oldest
/// first. A message that lives in several mailboxes is created once, with
/// the first mailbox, and its later mailboxes are announced as membership
/// changes.
///
/// Running it again on an unchanged store describes the same state; the
/// engine is expected to treat a repeated mailbox creation as an upsert.
///
/// A connector that was stale stays stale if the resync fails, so the next
/// attempt is not held back by the cooldown.
pub fn resync(connector: &DbConnector, ctx: &Context) -> Result<SyncStats, ConnectorError> {
    let was_stale = connector.take_stale();
    let result = run(connector, ctx);
    if result.is_err() && was_stale {
        connector.mark_stale();
    }
    result
}

fn run(connector: &DbConnector, ctx: &Context) -> Result<SyncStats, ConnectorError> {
    let start = Instant::now();
    let mut stats = SyncStats::default();
    let dispatcher = connector.dispatcher();

    // 1. Load mailboxes into the cache
    let (mailboxes, skipped) = connector.refresh_mailboxes(ctx)?;
    stats.skipped_mailboxes = skipped;

    // Mailboxes each message has been announced in so far
    let mut announced: HashMap<MessageId, Vec<MailboxId>> = HashMap::new();

    for mailbox in mailboxes {
        if ctx.is_done() {
            return Err(ConnectorError::Cancelled);
        }
        let mailbox_id = mailbox.id.clone();

        // 2. Announce the mailbox and wait for the engine to apply it
        match dispatcher.deliver_and_wait(UpdateKind::MailboxCreated(mailbox), ctx) {
            Ok(()) => stats.mailboxes += 1,
            Err(DispatchError::Rejected { reason, .. }) => {
                warn!(
                    "[{}] Engine refused mailbox {}, skipping its messages: {}",
                    connector.email(),
                    mailbox_id,
                    reason
                );
                stats.rejected_mailboxes += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        // 3. Queue its messages as one batch
        let mut batch = Vec::new();
        let mut memberships = Vec::new();
        for mut created in connector.list_messages(ctx, &mailbox_id)? {
            match announced.get_mut(&created.message.id) {
                Some(known) => {
                    known.push(mailbox_id.clone());
                    memberships.push(UpdateKind::MessageMailboxesUpdated {
                        message_id: created.message.id,
                        mailbox_ids: known.clone(),
                        flags: created.message.flags,
                    });
                }
                None => {
                    created.mailbox_ids = vec![mailbox_id.clone()];
                    announced.insert(created.message.id.clone(), created.mailbox_ids.clone());
                    batch.push(created);
                }
            }
        }

        debug!(
            "[{}] Mailbox {}: {} new messages, {} shared",
            connector.email(),
            mailbox_id,
            batch.len(),
            memberships.len()
        );
        stats.messages += batch.len();
        stats.memberships += memberships.len();

        if !batch.is_empty() {
            connector.publish(UpdateKind::MessagesCreated(batch))?;
        }
        for update in memberships {
            connector.publish(update)?;
        }
    }

    // 4. Push out the last mailbox's messages before reporting success
    dispatcher.flush(ctx)?;
    connector.mark_resynced(Utc::now());

    stats.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "[{}] Resync complete: {} mailboxes, {} messages in {}ms",
        connector.email(),
        stats.mailboxes,
        stats.messages,
        stats.duration_ms
    );
    Ok(stats)
}
