//! Authenticated account model

use log::warn;
use serde::{Deserialize, Serialize};

/// End-to-end key material stored with the account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPgpKeys {
    #[serde(rename = "privateKey", default)]
    pub private_key: String,
    #[serde(rename = "publicKey", default)]
    pub public_key: String,
    #[serde(rename = "revocationCertificate", default)]
    pub revocation_certificate: String,
}

/// Marker for service mailboxes that auto-reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEmail {
    #[serde(default)]
    pub is_system_email: bool,
    #[serde(default)]
    pub system_email_reply: String,
}

/// The principal a connector acts for, populated by a successful authorize
///
/// Loaded from the `accounts` table and never mutated by the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Internal identifier (database primary key)
    pub id: String,
    /// Email address (natural external key)
    pub email: String,
    /// Salted password hash, `salt:hash` in hex
    #[serde(skip_serializing)]
    pub hash: String,
    pub tenant_name: String,
    /// Mailbox quota in bytes
    pub mailbox_size: i64,
    /// Current usage in bytes
    pub usage: i64,
    /// Reference to the account's encryption key
    pub key: String,
    pub open_pgp: OpenPgpKeys,
    pub system_email: SystemEmail,
}

impl UserConfig {
    /// Remaining quota in bytes (never negative)
    pub fn remaining_quota(&self) -> i64 {
        (self.mailbox_size - self.usage).max(0)
    }
}

/// Parse an optional JSON column, falling back to the default on bad data
///
/// A malformed column must not lock the user out, so it is logged and ignored.
pub(crate) fn parse_json_column<T>(email: &str, column: &str, raw: Option<&[u8]>) -> T
where
    T: for<'de> Deserialize<'de> + Default,
{
    match raw {
        Some(bytes) if !bytes.is_empty() => serde_json::from_slice(bytes).unwrap_or_else(|e| {
            warn!("Failed to parse {} JSON for {}: {}", column, email, e);
            T::default()
        }),
        _ => T::default(),
    }
}
