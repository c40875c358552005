//! In-memory mailbox cache
//!
//! Answers the engine's mailbox lookups without a store round-trip. The
//! cache holds a non-owning copy of mailbox rows: callers write it only
//! after the corresponding store write has committed.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ConnectorError;
use crate::mapping;
use crate::models::{FlagSet, Mailbox, MailboxId, MailboxVisibility};

#[derive(Debug, Clone)]
struct MailboxEntry {
    name: Vec<String>,
    exclusive: bool,
    visibility: MailboxVisibility,
}

/// Lock-guarded map from mailbox id to mailbox metadata
#[derive(Debug)]
pub struct MailboxState {
    flags: FlagSet,
    permanent_flags: FlagSet,
    attributes: FlagSet,
    mailboxes: RwLock<HashMap<MailboxId, MailboxEntry>>,
}

impl Default for MailboxState {
    fn default() -> Self {
        Self::new(
            mapping::default_flags(),
            mapping::default_permanent_flags(),
            mapping::default_attributes(),
        )
    }
}

impl MailboxState {
    pub fn new(flags: FlagSet, permanent_flags: FlagSet, attributes: FlagSet) -> Self {
        Self {
            flags,
            permanent_flags,
            attributes,
            mailboxes: RwLock::new(HashMap::new()),
        }
    }

    // A panic while holding the lock cannot leave an entry half-written,
    // so a poisoned map is still usable.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<MailboxId, MailboxEntry>> {
        self.mailboxes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<MailboxId, MailboxEntry>> {
        self.mailboxes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite a cache entry and return its rendered descriptor
    pub fn create_mailbox(&self, id: MailboxId, name: Vec<String>, exclusive: bool) -> Mailbox {
        let mut mailboxes = self.write();
        let visibility = mailboxes
            .get(&id)
            .map(|entry| entry.visibility)
            .unwrap_or_default();
        mailboxes.insert(
            id.clone(),
            MailboxEntry {
                name,
                exclusive,
                visibility,
            },
        );
        self.render(&mailboxes, &id, &mailboxes[&id])
    }

    pub fn get_mailbox(&self, id: &MailboxId) -> Result<Mailbox, ConnectorError> {
        let mailboxes = self.read();
        let entry = mailboxes
            .get(id)
            .ok_or_else(|| ConnectorError::NoSuchMailbox(id.clone()))?;
        Ok(self.render(&mailboxes, id, entry))
    }

    /// Every cached mailbox, ordered by name
    pub fn list_mailboxes(&self) -> Vec<Mailbox> {
        let mailboxes = self.read();
        let mut list: Vec<Mailbox> = mailboxes
            .iter()
            .map(|(id, entry)| self.render(&mailboxes, id, entry))
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn is_exclusive(&self, id: &MailboxId) -> Result<bool, ConnectorError> {
        self.read()
            .get(id)
            .map(|entry| entry.exclusive)
            .ok_or_else(|| ConnectorError::NoSuchMailbox(id.clone()))
    }

    pub fn name(&self, id: &MailboxId) -> Result<Vec<String>, ConnectorError> {
        self.read()
            .get(id)
            .map(|entry| entry.name.clone())
            .ok_or_else(|| ConnectorError::NoSuchMailbox(id.clone()))
    }

    /// Look up a mailbox by its full path
    pub fn find_by_name(&self, name: &[String]) -> Option<MailboxId> {
        self.read()
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(id, _)| id.clone())
    }

    pub fn rename_mailbox(
        &self,
        id: &MailboxId,
        name: Vec<String>,
        exclusive: bool,
    ) -> Result<Mailbox, ConnectorError> {
        let mut mailboxes = self.write();
        let entry = mailboxes
            .get_mut(id)
            .ok_or_else(|| ConnectorError::NoSuchMailbox(id.clone()))?;
        entry.name = name;
        entry.exclusive = exclusive;
        Ok(self.render(&mailboxes, id, &mailboxes[id]))
    }

    /// Drop a cache entry. Returns false if it was not cached.
    pub fn remove_mailbox(&self, id: &MailboxId) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn visibility(&self, id: &MailboxId) -> Result<MailboxVisibility, ConnectorError> {
        self.read()
            .get(id)
            .map(|entry| entry.visibility)
            .ok_or_else(|| ConnectorError::NoSuchMailbox(id.clone()))
    }

    pub fn set_visibility(
        &self,
        id: &MailboxId,
        visibility: MailboxVisibility,
    ) -> Result<(), ConnectorError> {
        let mut mailboxes = self.write();
        let entry = mailboxes
            .get_mut(id)
            .ok_or_else(|| ConnectorError::NoSuchMailbox(id.clone()))?;
        entry.visibility = visibility;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn render(
        &self,
        mailboxes: &HashMap<MailboxId, MailboxEntry>,
        id: &MailboxId,
        entry: &MailboxEntry,
    ) -> Mailbox {
        let has_children = mailboxes.values().any(|other| {
            other.name.len() > entry.name.len() && other.name.starts_with(&entry.name)
        });
        let leaf = entry.name.last().map(String::as_str).unwrap_or("");

        Mailbox {
            id: id.clone(),
            name: entry.name.clone(),
            flags: self.flags.clone(),
            permanent_flags: self.permanent_flags.clone(),
            attributes: self
                .attributes
                .union(&mapping::mailbox_attributes(leaf, has_children)),
        }
    }
}
