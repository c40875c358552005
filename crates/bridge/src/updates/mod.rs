//! Change notifications delivered to the engine
//!
//! Every mutating connector call records an [`UpdateKind`]. The
//! [`Dispatcher`] turns it into an [`Update`] carrying an acknowledgment
//! handle, delivers it in FIFO order and applies the configured failure
//! policy to the engine's answer.

mod ack;
mod dispatcher;

use std::fmt;

pub use ack::{AckOutcome, AckSender, AckWaiter};
pub use dispatcher::{Dispatcher, DispatcherConfig, FailPolicy, OverflowPolicy, UpdateStream};

use crate::models::{FlagSet, Mailbox, MailboxId, MessageCreated, MessageId};

/// What changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    MailboxCreated(Mailbox),
    MailboxDeleted(MailboxId),
    MailboxRenamed {
        mailbox_id: MailboxId,
        name: Vec<String>,
    },
    /// One batch per mailbox during resync, one entry per appended message otherwise
    MessagesCreated(Vec<MessageCreated>),
    MessageDeleted(MessageId),
    /// Carries the full recomputed flag set, not a delta
    MessageFlagsUpdated {
        message_id: MessageId,
        flags: FlagSet,
    },
    MessageMailboxesUpdated {
        message_id: MessageId,
        mailbox_ids: Vec<MailboxId>,
        flags: FlagSet,
    },
    UidValidityBumped {
        mailbox_id: MailboxId,
        uid_validity: u32,
    },
}

impl UpdateKind {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateKind::MailboxCreated(_) => "MailboxCreated",
            UpdateKind::MailboxDeleted(_) => "MailboxDeleted",
            UpdateKind::MailboxRenamed { .. } => "MailboxRenamed",
            UpdateKind::MessagesCreated(_) => "MessagesCreated",
            UpdateKind::MessageDeleted(_) => "MessageDeleted",
            UpdateKind::MessageFlagsUpdated { .. } => "MessageFlagsUpdated",
            UpdateKind::MessageMailboxesUpdated { .. } => "MessageMailboxesUpdated",
            UpdateKind::UidValidityBumped { .. } => "UidValidityBumped",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKind::MailboxCreated(mbox) => {
                write!(f, "MailboxCreated({} {:?})", mbox.id, mbox.name.join("/"))
            }
            UpdateKind::MailboxDeleted(id) => write!(f, "MailboxDeleted({})", id),
            UpdateKind::MailboxRenamed { mailbox_id, name } => {
                write!(f, "MailboxRenamed({} -> {:?})", mailbox_id, name.join("/"))
            }
            UpdateKind::MessagesCreated(batch) => write!(f, "MessagesCreated({})", batch.len()),
            UpdateKind::MessageDeleted(id) => write!(f, "MessageDeleted({})", id),
            UpdateKind::MessageFlagsUpdated { message_id, flags } => {
                write!(f, "MessageFlagsUpdated({} {})", message_id, flags)
            }
            UpdateKind::MessageMailboxesUpdated {
                message_id,
                mailbox_ids,
                ..
            } => write!(
                f,
                "MessageMailboxesUpdated({} in {})",
                message_id,
                mailbox_ids.len()
            ),
            UpdateKind::UidValidityBumped {
                mailbox_id,
                uid_validity,
            } => write!(f, "UidValidityBumped({} = {})", mailbox_id, uid_validity),
        }
    }
}

/// A delivered update, as the engine receives it
///
/// The engine must call [`done`](Update::done) or [`fail`](Update::fail)
/// once it has applied (or failed to apply) the change. Dropping the update
/// without either counts as "not acknowledged".
#[derive(Debug)]
pub struct Update {
    kind: UpdateKind,
    ack: AckSender,
}

impl Update {
    pub(crate) fn new(kind: UpdateKind, ack: AckSender) -> Self {
        Self { kind, ack }
    }

    pub fn kind(&self) -> &UpdateKind {
        &self.kind
    }

    /// Acknowledge successful application
    pub fn done(self) {
        self.ack.send(Ok(()));
    }

    /// Report an application error
    pub fn fail(self, reason: impl Into<String>) {
        self.ack.send(Err(reason.into()));
    }
}
