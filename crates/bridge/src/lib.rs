//! Bridge crate - Synchronization connector for an IMAP engine
//!
//! This crate connects a relational mailbox store to an external,
//! event-driven mail-protocol engine:
//! - Flag and attribute mapping between stored columns and engine flags
//! - An in-memory mailbox cache and the folder/label naming policy
//! - Ordered update delivery with per-update acknowledgment
//! - The store-backed connector the engine calls for every operation
//! - Resynchronization of the engine's cache from the store
//! - A registry that creates, loads and evicts per-user connectors
//!
//! The engine itself (wire protocol, sessions, MIME) is external and only
//! modelled at its boundary by [`Engine`] and [`Connector`].

pub mod auth;
pub mod config;
pub mod connector;
pub mod context;
pub mod engine;
pub mod error;
pub mod factory;
pub mod mapping;
pub mod models;
pub mod naming;
pub mod state;
pub mod storage;
pub mod sync;
pub mod updates;

pub use auth::{generate_password, validate_password};
pub use config::BridgeConfig;
pub use connector::{ConnectorOptions, DbConnector};
pub use context::Context;
pub use engine::{Connector, Engine};
pub use error::{ConnectorError, DispatchError, EngineError, FactoryError, StoreError};
pub use factory::ConnectorFactory;
pub use mapping::StoredFlags;
pub use models::{
    FlagSet, Mailbox, MailboxId, MailboxStatus, MailboxVisibility, Message, MessageCreated,
    MessageId, Priority, UserConfig,
};
pub use naming::NamingPolicy;
pub use state::MailboxState;
pub use storage::{MailStore, SqliteMailStore};
pub use sync::{SyncStats, cooldown_elapsed};
pub use updates::{
    AckOutcome, Dispatcher, DispatcherConfig, FailPolicy, OverflowPolicy, Update, UpdateKind,
    UpdateStream,
};
