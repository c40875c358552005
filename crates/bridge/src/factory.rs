//! Per-user connector registry
//!
//! Maps user emails to the identity the engine assigned them and owns the
//! connector for each loaded user. Build one at startup and share it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, error, info, warn};

use crate::connector::{ConnectorOptions, DbConnector};
use crate::context::Context;
use crate::engine::{Connector, Engine};
use crate::error::FactoryError;
use crate::storage::MailStore;
use crate::sync::SyncStats;

struct UserEntry {
    engine_user_id: String,
    connector: Arc<DbConnector>,
}

/// Creates, loads and evicts per-user connectors
pub struct ConnectorFactory {
    store: Arc<dyn MailStore>,
    engine: Arc<dyn Engine>,
    options: ConnectorOptions,
    passphrase: Vec<u8>,
    registry: RwLock<HashMap<String, UserEntry>>,
}

impl ConnectorFactory {
    pub fn new(
        store: Arc<dyn MailStore>,
        engine: Arc<dyn Engine>,
        options: ConnectorOptions,
        passphrase: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            store,
            engine,
            options,
            passphrase: passphrase.into(),
            registry: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, UserEntry>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, UserEntry>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the engine identity for `email`, registering the user if needed
    ///
    /// A known identity (passed in, or persisted on the account) is loaded
    /// into the engine; otherwise the engine assigns a new one and it is
    /// written back to the account. A failed write is logged and the user
    /// is registered anyway, so later calls reuse it. Concurrent calls for the
    /// same email agree on one identity. A freshly loaded user is resynced.
    pub fn get_or_create_user(
        &self,
        ctx: &Context,
        email: &str,
        engine_user_id: Option<&str>,
    ) -> Result<String, FactoryError> {
        if let Some(entry) = self.read().get(email) {
            return Ok(entry.engine_user_id.clone());
        }

        let (user_id, connector) = {
            let mut registry = self.write();
            // Another caller may have won the race for the write lock
            if let Some(entry) = registry.get(email) {
                return Ok(entry.engine_user_id.clone());
            }

            let known = match engine_user_id {
                Some(id) => Some(id.to_string()),
                None => self
                    .store
                    .find_account(ctx, email)?
                    .and_then(|account| account.engine_user_id),
            };

            let connector = Arc::new(DbConnector::new(
                Arc::clone(&self.store),
                email,
                self.options.clone(),
            ));
            let handle: Arc<dyn Connector> = connector.clone();

            let user_id = match known {
                Some(id) => {
                    let existed = self.engine.load_user(ctx, handle, &id, &self.passphrase)?;
                    debug!("Loaded {} as {} (known to engine: {})", email, id, existed);
                    id
                }
                None => {
                    let id = self.engine.add_user(ctx, handle, &self.passphrase)?;
                    // The engine already holds the user, so register it even
                    // when the identity cannot be written back
                    match self.store.set_engine_user_id(ctx, email, &id) {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("No account row for {}, identity {} not persisted", email, id);
                        }
                        Err(e) => {
                            error!("Failed to persist identity {} for {}: {}", id, email, e);
                        }
                    }
                    info!("Registered {} as {}", email, id);
                    id
                }
            };

            registry.insert(
                email.to_string(),
                UserEntry {
                    engine_user_id: user_id.clone(),
                    connector: Arc::clone(&connector),
                },
            );
            (user_id, connector)
        };

        // Outside the lock: resync waits on the engine
        if let Err(e) = connector.resync(ctx) {
            warn!("Initial resync for {} failed, retrying on demand: {}", email, e);
        }
        Ok(user_id)
    }

    /// Load every IMAP-enabled account
    ///
    /// A failing user is logged and skipped. Returns how many are loaded.
    pub fn initialize_users(&self, ctx: &Context) -> Result<usize, FactoryError> {
        let accounts = self.store.list_imap_accounts(ctx)?;
        let mut loaded = 0;

        for account in &accounts {
            match self.get_or_create_user(ctx, &account.email, account.engine_user_id.as_deref()) {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Failed to load user {}: {}", account.email, e),
            }
        }

        info!("Loaded {}/{} IMAP users", loaded, accounts.len());
        Ok(loaded)
    }

    /// Evict a user from the registry and the engine and close its connector
    pub fn remove_user(
        &self,
        ctx: &Context,
        email: &str,
        with_data: bool,
    ) -> Result<(), FactoryError> {
        let entry = self
            .write()
            .remove(email)
            .ok_or_else(|| FactoryError::UserNotLoaded(email.to_string()))?;

        let removed = self
            .engine
            .remove_user(ctx, &entry.engine_user_id, with_data);
        entry.connector.close(ctx)?;
        removed?;

        info!("Removed user {} ({})", email, entry.engine_user_id);
        Ok(())
    }

    /// Emails of loaded users, sorted
    pub fn active_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.read().keys().cloned().collect();
        users.sort();
        users
    }

    pub fn active_user_count(&self) -> usize {
        self.read().len()
    }

    pub fn is_user_loaded(&self, email: &str) -> bool {
        self.read().contains_key(email)
    }

    pub fn engine_user_id(&self, email: &str) -> Option<String> {
        self.read()
            .get(email)
            .map(|entry| entry.engine_user_id.clone())
    }

    pub fn connector(&self, email: &str) -> Option<Arc<DbConnector>> {
        self.read()
            .get(email)
            .map(|entry| Arc::clone(&entry.connector))
    }

    /// Resync a loaded user unless it is in cooldown
    pub fn resync_user(
        &self,
        ctx: &Context,
        email: &str,
    ) -> Result<Option<SyncStats>, FactoryError> {
        let connector = self
            .connector(email)
            .ok_or_else(|| FactoryError::UserNotLoaded(email.to_string()))?;
        Ok(connector.resync_if_due(ctx)?)
    }
}
