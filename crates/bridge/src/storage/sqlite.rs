//! SQLite-backed connector storage

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::traits::{
    AccountRecord, FlagChange, MailStore, MailboxRecord, MessageRecord, NewAccount, NewMessage,
    Removal, Result,
};
use crate::context::Context;
use crate::error::StoreError;
use crate::mapping::{self, StoredFlags};
use crate::models::{MailboxId, MailboxStatus, MessageId, Priority};

/// Virtual machine steps between cancellation checks
const PROGRESS_STEPS: i32 = 1_000;

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Accounts, keyed by the two halves of the email address
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                local_part TEXT NOT NULL,
                domain TEXT NOT NULL,
                hash TEXT NOT NULL,
                tenant_name TEXT NOT NULL DEFAULT '',
                mailbox_size INTEGER NOT NULL DEFAULT 0,
                usage INTEGER NOT NULL DEFAULT 0,
                key TEXT NOT NULL DEFAULT '',
                open_pgp BLOB,         -- JSON
                system_email BLOB,     -- JSON
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (local_part, domain)
            );

            -- Mailboxes, owned by an account email
            CREATE TABLE mailboxes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                hidden INTEGER NOT NULL DEFAULT 0,
                uid_validity INTEGER NOT NULL DEFAULT 1,
                UNIQUE (owner, name)
            );

            -- Messages; mailbox_id is the primary mailbox
            CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                mailbox_id INTEGER NOT NULL,
                raw BLOB NOT NULL,
                seen INTEGER NOT NULL DEFAULT 0,
                flagged INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                answered INTEGER NOT NULL DEFAULT 0,
                important INTEGER NOT NULL DEFAULT 0,
                pinned INTEGER NOT NULL DEFAULT 0,
                priority TEXT NOT NULL DEFAULT 'normal',
                tags TEXT NOT NULL DEFAULT '[]',
                thread_id TEXT,
                received_at TEXT NOT NULL,
                FOREIGN KEY (mailbox_id) REFERENCES mailboxes(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_messages_owner_mailbox
                ON messages(owner, mailbox_id, received_at ASC);

            -- Additional (label) memberships
            CREATE TABLE message_mailbox (
                message_id INTEGER NOT NULL,
                mailbox_id INTEGER NOT NULL,
                PRIMARY KEY (message_id, mailbox_id),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
                FOREIGN KEY (mailbox_id) REFERENCES mailboxes(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_message_mailbox_mailbox ON message_mailbox(mailbox_id);
            "#,
        ),
        // Migration 2: Engine registration fields
        M::up(
            r#"
            ALTER TABLE accounts ADD COLUMN imap_enabled INTEGER NOT NULL DEFAULT 1;
            ALTER TABLE accounts ADD COLUMN engine_user_id TEXT;
            "#,
        ),
    ])
}

const ACCOUNT_COLUMNS: &str = "id, local_part, domain, hash, tenant_name, mailbox_size, usage, \
     key, open_pgp, system_email, imap_enabled, engine_user_id";

const MAILBOX_COLUMNS: &str = "id, name, hidden, uid_validity";

const MESSAGE_COLUMNS: &str = "m.id, m.mailbox_id, m.seen, m.flagged, m.deleted, m.answered, \
     m.important, m.pinned, m.priority, m.tags, m.thread_id, m.received_at, length(m.raw)";

/// SQLite-based connector storage
///
/// A single connection behind a mutex; every call installs a progress
/// handler so a cancelled [`Context`] interrupts the running statement.
pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

impl SqliteMailStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        debug!("Opened mail store at {:?}", db_path.as_ref());
        Self::init(conn)
    }

    /// A private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        // WAL lets readers proceed during writes; foreign keys are needed
        // for the ON DELETE CASCADE clauses.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations().to_latest(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` on the connection, aborting it once `ctx` is done
    fn with_conn<T>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        if ctx.is_done() {
            return Err(StoreError::Cancelled);
        }
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;

        let watch = ctx.clone();
        conn.progress_handler(PROGRESS_STEPS, Some(move || watch.is_done()));
        let result = f(&mut conn);
        conn.progress_handler(0, None::<fn() -> bool>);

        result.map_err(|err| match err {
            StoreError::Sqlite(e)
                if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) =>
            {
                StoreError::Cancelled
            }
            other => other,
        })
    }
}

fn row_id(id: &str) -> Option<i64> {
    id.parse().ok()
}

fn split_email(email: &str) -> Option<(&str, &str)> {
    email
        .rsplit_once('@')
        .filter(|(local, domain)| !local.is_empty() && !domain.is_empty())
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Invalid received_at {:?}: {}", raw, e);
            DateTime::<Utc>::UNIX_EPOCH
        })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<AccountRecord> {
    let id: i64 = row.get(0)?;
    let local: String = row.get(1)?;
    let domain: String = row.get(2)?;
    Ok(AccountRecord {
        id: id.to_string(),
        email: format!("{}@{}", local, domain),
        hash: row.get(3)?,
        tenant_name: row.get(4)?,
        mailbox_size: row.get(5)?,
        usage: row.get(6)?,
        key: row.get(7)?,
        open_pgp: row.get(8)?,
        system_email: row.get(9)?,
        imap_enabled: row.get(10)?,
        engine_user_id: row.get(11)?,
    })
}

fn mailbox_from_row(row: &Row<'_>) -> rusqlite::Result<MailboxRecord> {
    let id: i64 = row.get(0)?;
    Ok(MailboxRecord {
        id: MailboxId::new(id.to_string()),
        name: row.get(1)?,
        hidden: row.get(2)?,
        uid_validity: row.get(3)?,
    })
}

/// Message row without its extra memberships
fn message_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, MessageRecord)> {
    let id: i64 = row.get(0)?;
    let primary: i64 = row.get(1)?;
    let priority: String = row.get(8)?;
    let tags: Option<String> = row.get(9)?;
    let received_at: String = row.get(11)?;
    let size: i64 = row.get(12)?;

    let record = MessageRecord {
        id: MessageId::new(id.to_string()),
        mailbox_ids: vec![MailboxId::new(primary.to_string())],
        flags: StoredFlags {
            seen: row.get(2)?,
            flagged: row.get(3)?,
            deleted: row.get(4)?,
            answered: row.get(5)?,
            important: row.get(6)?,
            pinned: row.get(7)?,
            priority: Priority::from_column(&priority),
            tags: mapping::parse_tags(tags.as_deref()),
        },
        thread_id: row.get(10)?,
        received_at: parse_timestamp(&received_at),
        size: usize::try_from(size).unwrap_or_default(),
    };
    Ok((id, record))
}

fn load_memberships(conn: &Connection, record: &mut MessageRecord, id: i64) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT mailbox_id FROM message_mailbox WHERE message_id = ? ORDER BY mailbox_id",
    )?;
    let extra = stmt
        .query_map([id], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    record
        .mailbox_ids
        .extend(extra.into_iter().map(|m| MailboxId::new(m.to_string())));
    Ok(())
}

fn load_message(conn: &Connection, owner: &str, id: i64) -> Result<Option<MessageRecord>> {
    let sql = format!(
        "SELECT {} FROM messages m WHERE m.id = ?1 AND m.owner = ?2",
        MESSAGE_COLUMNS
    );
    let row = conn
        .query_row(&sql, params![id, owner], message_from_row)
        .optional()?;

    let Some((id, mut record)) = row else {
        return Ok(None);
    };
    load_memberships(conn, &mut record, id)?;
    Ok(Some(record))
}

fn primary_mailbox(conn: &Connection, owner: &str, message: i64) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT mailbox_id FROM messages WHERE id = ?1 AND owner = ?2",
            params![message, owner],
            |row| row.get(0),
        )
        .optional()?)
}

enum Detach {
    NotMember,
    Detached,
    Deleted,
}

/// Remove one message from one mailbox
///
/// Leaving the primary mailbox promotes the lowest remaining membership;
/// with none left the message itself is deleted.
fn detach(conn: &Connection, owner: &str, message: i64, mailbox: i64) -> Result<Detach> {
    let Some(primary) = primary_mailbox(conn, owner, message)? else {
        return Ok(Detach::NotMember);
    };

    if primary != mailbox {
        let removed = conn.execute(
            "DELETE FROM message_mailbox WHERE message_id = ?1 AND mailbox_id = ?2",
            params![message, mailbox],
        )?;
        return Ok(if removed > 0 {
            Detach::Detached
        } else {
            Detach::NotMember
        });
    }

    let next: Option<i64> = conn
        .query_row(
            "SELECT mailbox_id FROM message_mailbox WHERE message_id = ?
             ORDER BY mailbox_id LIMIT 1",
            [message],
            |row| row.get(0),
        )
        .optional()?;

    match next {
        Some(next) => {
            conn.execute(
                "UPDATE messages SET mailbox_id = ?1 WHERE id = ?2",
                params![next, message],
            )?;
            conn.execute(
                "DELETE FROM message_mailbox WHERE message_id = ?1 AND mailbox_id = ?2",
                params![message, next],
            )?;
            Ok(Detach::Detached)
        }
        None => {
            conn.execute("DELETE FROM messages WHERE id = ?", [message])?;
            Ok(Detach::Deleted)
        }
    }
}

fn detach_all(conn: &Connection, owner: &str, messages: &[i64], mailbox: i64) -> Result<Removal> {
    let mut removal = Removal::default();
    for &message in messages {
        let id = MessageId::new(message.to_string());
        match detach(conn, owner, message, mailbox)? {
            Detach::NotMember => debug!("Message {} not in mailbox {}", message, mailbox),
            Detach::Detached => removal.detached.push(id),
            Detach::Deleted => removal.deleted.push(id),
        }
    }
    Ok(removal)
}

impl MailStore for SqliteMailStore {
    fn insert_account(&self, ctx: &Context, account: &NewAccount) -> Result<AccountRecord> {
        let (local, domain) = account
            .email
            .rsplit_once('@')
            .unwrap_or((account.email.as_str(), ""));
        let open_pgp = account.open_pgp.as_ref().map(serde_json::to_vec).transpose()?;
        let system_email = account
            .system_email
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;

        self.with_conn(ctx, |conn| {
            conn.execute(
                "INSERT INTO accounts
                 (local_part, domain, hash, tenant_name, mailbox_size, key,
                  open_pgp, system_email, imap_enabled)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    local,
                    domain,
                    account.password_hash,
                    account.tenant_name,
                    account.mailbox_size,
                    account.key,
                    open_pgp,
                    system_email,
                    account.imap_enabled,
                ],
            )?;
            let id = conn.last_insert_rowid();
            let sql = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
            Ok(conn.query_row(&sql, [id], account_from_row)?)
        })
    }

    fn find_account(&self, ctx: &Context, email: &str) -> Result<Option<AccountRecord>> {
        let Some((local, domain)) = split_email(email) else {
            return Ok(None);
        };
        self.with_conn(ctx, |conn| {
            let sql = format!(
                "SELECT {} FROM accounts WHERE local_part = ?1 AND domain = ?2",
                ACCOUNT_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![local, domain], account_from_row)
                .optional()?)
        })
    }

    fn list_imap_accounts(&self, ctx: &Context) -> Result<Vec<AccountRecord>> {
        self.with_conn(ctx, |conn| {
            let sql = format!(
                "SELECT {} FROM accounts WHERE imap_enabled = 1
                 ORDER BY local_part || '@' || domain",
                ACCOUNT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let accounts = stmt
                .query_map([], account_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(accounts)
        })
    }

    fn set_engine_user_id(
        &self,
        ctx: &Context,
        email: &str,
        engine_user_id: &str,
    ) -> Result<bool> {
        let Some((local, domain)) = split_email(email) else {
            return Ok(false);
        };
        self.with_conn(ctx, |conn| {
            let updated = conn.execute(
                "UPDATE accounts SET engine_user_id = ?1 WHERE local_part = ?2 AND domain = ?3",
                params![engine_user_id, local, domain],
            )?;
            Ok(updated > 0)
        })
    }

    fn create_mailbox(&self, ctx: &Context, owner: &str, name: &str) -> Result<MailboxRecord> {
        self.with_conn(ctx, |conn| {
            conn.execute(
                "INSERT INTO mailboxes (owner, name) VALUES (?, ?)",
                params![owner, name],
            )?;
            let id = conn.last_insert_rowid();
            Ok(MailboxRecord {
                id: MailboxId::new(id.to_string()),
                name: name.to_string(),
                hidden: false,
                uid_validity: 1,
            })
        })
    }

    fn get_mailbox(
        &self,
        ctx: &Context,
        owner: &str,
        id: &MailboxId,
    ) -> Result<Option<MailboxRecord>> {
        let Some(id) = row_id(id.as_str()) else {
            return Ok(None);
        };
        self.with_conn(ctx, |conn| {
            let sql = format!(
                "SELECT {} FROM mailboxes WHERE id = ?1 AND owner = ?2",
                MAILBOX_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![id, owner], mailbox_from_row)
                .optional()?)
        })
    }

    fn find_mailbox_by_name(
        &self,
        ctx: &Context,
        owner: &str,
        name: &str,
    ) -> Result<Option<MailboxRecord>> {
        self.with_conn(ctx, |conn| {
            let sql = format!(
                "SELECT {} FROM mailboxes WHERE owner = ?1 AND name = ?2",
                MAILBOX_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![owner, name], mailbox_from_row)
                .optional()?)
        })
    }

    fn list_mailboxes(&self, ctx: &Context, owner: &str) -> Result<Vec<MailboxRecord>> {
        self.with_conn(ctx, |conn| {
            let sql = format!(
                "SELECT {} FROM mailboxes WHERE owner = ? ORDER BY name, id",
                MAILBOX_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mailboxes = stmt
                .query_map([owner], mailbox_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(mailboxes)
        })
    }

    fn rename_mailbox(
        &self,
        ctx: &Context,
        owner: &str,
        id: &MailboxId,
        name: &str,
    ) -> Result<bool> {
        let Some(id) = row_id(id.as_str()) else {
            return Ok(false);
        };
        self.with_conn(ctx, |conn| {
            let updated = conn.execute(
                "UPDATE mailboxes SET name = ?1 WHERE id = ?2 AND owner = ?3",
                params![name, id, owner],
            )?;
            Ok(updated > 0)
        })
    }

    fn delete_mailbox(
        &self,
        ctx: &Context,
        owner: &str,
        id: &MailboxId,
    ) -> Result<Option<Removal>> {
        let Some(mailbox) = row_id(id.as_str()) else {
            return Ok(None);
        };
        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;

            let exists = tx
                .query_row(
                    "SELECT 1 FROM mailboxes WHERE id = ?1 AND owner = ?2",
                    params![mailbox, owner],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Ok(None);
            }

            let members = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM messages WHERE owner = ?1 AND mailbox_id = ?2
                     UNION
                     SELECT mm.message_id FROM message_mailbox mm
                     JOIN messages m ON m.id = mm.message_id
                     WHERE m.owner = ?1 AND mm.mailbox_id = ?2
                     ORDER BY 1",
                )?;
                stmt.query_map(params![owner, mailbox], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            let removal = detach_all(&tx, owner, &members, mailbox)?;

            tx.execute(
                "DELETE FROM message_mailbox WHERE mailbox_id = ?",
                [mailbox],
            )?;
            tx.execute("DELETE FROM mailboxes WHERE id = ?", [mailbox])?;
            tx.commit()?;

            debug!(
                "Deleted mailbox {} ({} messages kept elsewhere, {} deleted)",
                mailbox,
                removal.detached.len(),
                removal.deleted.len()
            );
            Ok(Some(removal))
        })
    }

    fn set_mailbox_hidden(
        &self,
        ctx: &Context,
        owner: &str,
        id: &MailboxId,
        hidden: bool,
    ) -> Result<bool> {
        let Some(id) = row_id(id.as_str()) else {
            return Ok(false);
        };
        self.with_conn(ctx, |conn| {
            let updated = conn.execute(
                "UPDATE mailboxes SET hidden = ?1 WHERE id = ?2 AND owner = ?3",
                params![hidden, id, owner],
            )?;
            Ok(updated > 0)
        })
    }

    fn bump_uid_validity(
        &self,
        ctx: &Context,
        owner: &str,
        id: &MailboxId,
    ) -> Result<Option<u32>> {
        let Some(id) = row_id(id.as_str()) else {
            return Ok(None);
        };
        self.with_conn(ctx, |conn| {
            Ok(conn
                .query_row(
                    "UPDATE mailboxes SET uid_validity = uid_validity + 1
                     WHERE id = ?1 AND owner = ?2
                     RETURNING uid_validity",
                    params![id, owner],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn mailbox_status(&self, ctx: &Context, owner: &str, id: &MailboxId) -> Result<MailboxStatus> {
        let Some(id) = row_id(id.as_str()) else {
            return Ok(MailboxStatus::default());
        };
        self.with_conn(ctx, |conn| {
            let (messages, unseen): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN seen = 0 THEN 1 ELSE 0 END), 0)
                 FROM messages
                 WHERE owner = ?1
                   AND (mailbox_id = ?2
                        OR id IN (SELECT message_id FROM message_mailbox WHERE mailbox_id = ?2))",
                params![owner, id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(MailboxStatus {
                messages: usize::try_from(messages).unwrap_or_default(),
                unseen: usize::try_from(unseen).unwrap_or_default(),
            })
        })
    }

    fn insert_message(
        &self,
        ctx: &Context,
        owner: &str,
        message: &NewMessage,
    ) -> Result<MessageRecord> {
        // -1 is never a rowid, so an unparseable id fails the foreign key
        let mailbox = row_id(message.mailbox_id.as_str()).unwrap_or(-1);
        let flags = &message.flags;

        self.with_conn(ctx, |conn| {
            conn.execute(
                "INSERT INTO messages
                 (owner, mailbox_id, raw, seen, flagged, deleted, answered, important, pinned,
                  priority, tags, thread_id, received_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    owner,
                    mailbox,
                    message.literal,
                    flags.seen,
                    flags.flagged,
                    flags.deleted,
                    flags.answered,
                    flags.important,
                    flags.pinned,
                    flags.priority.as_str(),
                    mapping::tags_to_json(&flags.tags),
                    message.thread_id,
                    format_timestamp(&message.received_at),
                ],
            )?;
            let id = conn.last_insert_rowid();
            load_message(conn, owner, id)?
                .ok_or_else(|| StoreError::NoSuchMessage(MessageId::new(id.to_string())))
        })
    }

    fn get_message(
        &self,
        ctx: &Context,
        owner: &str,
        id: &MessageId,
    ) -> Result<Option<MessageRecord>> {
        let Some(id) = row_id(id.as_str()) else {
            return Ok(None);
        };
        self.with_conn(ctx, |conn| load_message(conn, owner, id))
    }

    fn get_literal(&self, ctx: &Context, owner: &str, id: &MessageId) -> Result<Option<Vec<u8>>> {
        let Some(id) = row_id(id.as_str()) else {
            return Ok(None);
        };
        self.with_conn(ctx, |conn| {
            Ok(conn
                .query_row(
                    "SELECT raw FROM messages WHERE id = ?1 AND owner = ?2",
                    params![id, owner],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn list_messages(
        &self,
        ctx: &Context,
        owner: &str,
        mailbox_id: &MailboxId,
    ) -> Result<Vec<MessageRecord>> {
        let Some(mailbox) = row_id(mailbox_id.as_str()) else {
            return Ok(Vec::new());
        };
        self.with_conn(ctx, |conn| {
            let sql = format!(
                "SELECT {} FROM messages m
                 WHERE m.owner = ?1
                   AND (m.mailbox_id = ?2
                        OR m.id IN (SELECT message_id FROM message_mailbox WHERE mailbox_id = ?2))
                 ORDER BY m.received_at ASC, m.id ASC",
                MESSAGE_COLUMNS
            );
            let rows = {
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![owner, mailbox], message_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut messages = Vec::with_capacity(rows.len());
            for (id, mut record) in rows {
                load_memberships(conn, &mut record, id)?;
                messages.push(record);
            }
            Ok(messages)
        })
    }

    fn add_to_mailbox(
        &self,
        ctx: &Context,
        owner: &str,
        ids: &[MessageId],
        mailbox_id: &MailboxId,
    ) -> Result<()> {
        let mailbox = row_id(mailbox_id.as_str()).unwrap_or(-1);
        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;
            for id in ids {
                let message = row_id(id.as_str())
                    .ok_or_else(|| StoreError::NoSuchMessage(id.clone()))?;
                let primary = primary_mailbox(&tx, owner, message)?
                    .ok_or_else(|| StoreError::NoSuchMessage(id.clone()))?;
                if primary != mailbox {
                    tx.execute(
                        "INSERT OR IGNORE INTO message_mailbox (message_id, mailbox_id)
                         VALUES (?1, ?2)",
                        params![message, mailbox],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn remove_from_mailbox(
        &self,
        ctx: &Context,
        owner: &str,
        ids: &[MessageId],
        mailbox_id: &MailboxId,
    ) -> Result<Removal> {
        let Some(mailbox) = row_id(mailbox_id.as_str()) else {
            return Ok(Removal::default());
        };
        let messages: Vec<i64> = ids.iter().filter_map(|id| row_id(id.as_str())).collect();

        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;
            let removal = detach_all(&tx, owner, &messages, mailbox)?;
            tx.commit()?;
            Ok(removal)
        })
    }

    fn move_messages(
        &self,
        ctx: &Context,
        owner: &str,
        ids: &[MessageId],
        from: &MailboxId,
        to: &MailboxId,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let from = row_id(from.as_str()).unwrap_or(-1);
        let to = row_id(to.as_str()).unwrap_or(-1);

        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;

            for id in ids {
                let message = row_id(id.as_str())
                    .ok_or_else(|| StoreError::NoSuchMessage(id.clone()))?;

                let moved = tx.execute(
                    "UPDATE messages SET mailbox_id = ?1
                     WHERE id = ?2 AND owner = ?3 AND mailbox_id = ?4",
                    params![to, message, owner, from],
                )?;
                if moved == 1 {
                    tx.execute(
                        "DELETE FROM message_mailbox WHERE message_id = ?1 AND mailbox_id = ?2",
                        params![message, to],
                    )?;
                    continue;
                }

                // Not its primary mailbox: move the label membership instead
                let detached = tx.execute(
                    "DELETE FROM message_mailbox
                     WHERE message_id = ?1 AND mailbox_id = ?2
                       AND message_id IN (SELECT id FROM messages WHERE owner = ?3)",
                    params![message, from, owner],
                )?;
                if detached == 0 {
                    return Err(StoreError::NoSuchMessage(id.clone()));
                }
                tx.execute(
                    "INSERT OR IGNORE INTO message_mailbox (message_id, mailbox_id)
                     SELECT ?1, ?2
                     WHERE NOT EXISTS (SELECT 1 FROM messages WHERE id = ?1 AND mailbox_id = ?2)",
                    params![message, to],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    fn update_flags(
        &self,
        ctx: &Context,
        owner: &str,
        ids: &[MessageId],
        change: FlagChange,
    ) -> Result<()> {
        let (sql, value) = match change {
            FlagChange::Seen(v) => {
                ("UPDATE messages SET seen = ?1 WHERE id = ?2 AND owner = ?3", v)
            }
            FlagChange::Flagged(v) => {
                ("UPDATE messages SET flagged = ?1 WHERE id = ?2 AND owner = ?3", v)
            }
            FlagChange::Deleted(v) => {
                ("UPDATE messages SET deleted = ?1 WHERE id = ?2 AND owner = ?3", v)
            }
            FlagChange::Answered(v) => {
                ("UPDATE messages SET answered = ?1 WHERE id = ?2 AND owner = ?3", v)
            }
        };

        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(sql)?;
                for id in ids {
                    let message = row_id(id.as_str())
                        .ok_or_else(|| StoreError::NoSuchMessage(id.clone()))?;
                    if stmt.execute(params![value, message, owner])? == 0 {
                        return Err(StoreError::NoSuchMessage(id.clone()));
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn expunge(&self, ctx: &Context, owner: &str, mailbox_id: &MailboxId) -> Result<Removal> {
        let Some(mailbox) = row_id(mailbox_id.as_str()) else {
            return Ok(Removal::default());
        };
        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;
            let doomed = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM messages
                     WHERE owner = ?1 AND deleted = 1
                       AND (mailbox_id = ?2
                            OR id IN (SELECT message_id FROM message_mailbox WHERE mailbox_id = ?2))
                     ORDER BY id",
                )?;
                stmt.query_map(params![owner, mailbox], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            let removal = detach_all(&tx, owner, &doomed, mailbox)?;
            tx.commit()?;
            Ok(removal)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    const OWNER: &str = "alice@example.com";

    fn create_test_store() -> (SqliteMailStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        // Use .test.sqlite extension to clearly distinguish from production databases
        let db_path = dir.path().join("bridge.test.sqlite");
        let store = SqliteMailStore::new(&db_path).unwrap();
        (store, dir)
    }

    fn ctx() -> Context {
        Context::background()
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn insert(
        store: &SqliteMailStore,
        mailbox: &MailboxId,
        body: &str,
        minutes: i64,
    ) -> MessageRecord {
        store
            .insert_message(
                &ctx(),
                OWNER,
                &NewMessage {
                    mailbox_id: mailbox.clone(),
                    literal: body.as_bytes().to_vec(),
                    flags: StoredFlags::default(),
                    thread_id: None,
                    received_at: base_time() + Duration::minutes(minutes),
                },
            )
            .unwrap()
    }

    fn ids_in(store: &SqliteMailStore, mailbox: &MailboxId) -> Vec<MessageId> {
        store
            .list_messages(&ctx(), OWNER, mailbox)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    #[test]
    fn test_account_lookup() {
        let (store, _dir) = create_test_store();
        let account = store
            .insert_account(
                &ctx(),
                &NewAccount {
                    email: OWNER.into(),
                    password_hash: "aa:bb".into(),
                    tenant_name: "acme".into(),
                    mailbox_size: 1024,
                    imap_enabled: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(account.email, OWNER);
        assert_eq!(account.engine_user_id, None);

        let found = store.find_account(&ctx(), OWNER).unwrap().unwrap();
        assert_eq!(found, account);
        assert!(store.find_account(&ctx(), "bob@example.com").unwrap().is_none());
        assert!(store.find_account(&ctx(), "no-at-sign").unwrap().is_none());

        assert!(store.set_engine_user_id(&ctx(), OWNER, "engine-1").unwrap());
        let found = store.find_account(&ctx(), OWNER).unwrap().unwrap();
        assert_eq!(found.engine_user_id.as_deref(), Some("engine-1"));
    }

    #[test]
    fn test_list_imap_accounts_skips_disabled() {
        let (store, _dir) = create_test_store();
        for (email, enabled) in [("b@x.io", true), ("a@x.io", true), ("c@x.io", false)] {
            store
                .insert_account(
                    &ctx(),
                    &NewAccount {
                        email: email.into(),
                        imap_enabled: enabled,
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        let emails: Vec<_> = store
            .list_imap_accounts(&ctx())
            .unwrap()
            .into_iter()
            .map(|a| a.email)
            .collect();
        assert_eq!(emails, vec!["a@x.io", "b@x.io"]);
    }

    #[test]
    fn test_mailbox_crud() {
        let (store, _dir) = create_test_store();
        let sent = store.create_mailbox(&ctx(), OWNER, "Sent").unwrap();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        store.create_mailbox(&ctx(), "bob@example.com", "INBOX").unwrap();

        // Same name twice for one owner is a constraint violation
        assert!(store.create_mailbox(&ctx(), OWNER, "INBOX").is_err());

        let names: Vec<_> = store
            .list_mailboxes(&ctx(), OWNER)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["INBOX", "Sent"]);

        assert!(store.rename_mailbox(&ctx(), OWNER, &sent.id, "Outbox").unwrap());
        let found = store.find_mailbox_by_name(&ctx(), OWNER, "Outbox").unwrap();
        assert_eq!(found.map(|m| m.id), Some(sent.id.clone()));

        // Other owners cannot touch it
        assert!(!store.rename_mailbox(&ctx(), "bob@example.com", &sent.id, "x").unwrap());
        assert!(store.get_mailbox(&ctx(), "bob@example.com", &inbox.id).unwrap().is_none());

        assert!(store.set_mailbox_hidden(&ctx(), OWNER, &inbox.id, true).unwrap());
        assert!(store.get_mailbox(&ctx(), OWNER, &inbox.id).unwrap().unwrap().hidden);

        assert_eq!(store.bump_uid_validity(&ctx(), OWNER, &inbox.id).unwrap(), Some(2));
        assert_eq!(store.bump_uid_validity(&ctx(), OWNER, &inbox.id).unwrap(), Some(3));
        assert_eq!(
            store
                .bump_uid_validity(&ctx(), OWNER, &MailboxId::new("999"))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_messages_ordered_by_received_time() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let late = insert(&store, &inbox.id, "late", 10);
        let early = insert(&store, &inbox.id, "early", 1);

        assert_eq!(ids_in(&store, &inbox.id), vec![early.id.clone(), late.id.clone()]);
        assert_eq!(early.size, 5);
        assert_eq!(early.received_at, base_time() + Duration::minutes(1));

        let literal = store.get_literal(&ctx(), OWNER, &late.id).unwrap();
        assert_eq!(literal.as_deref(), Some(&b"late"[..]));
        assert!(store.get_literal(&ctx(), "bob@example.com", &late.id).unwrap().is_none());
    }

    #[test]
    fn test_stored_flags_round_trip() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let flags = StoredFlags {
            seen: true,
            pinned: true,
            priority: Priority::High,
            tags: vec!["$Work".into()],
            ..Default::default()
        };
        let record = store
            .insert_message(
                &ctx(),
                OWNER,
                &NewMessage {
                    mailbox_id: inbox.id.clone(),
                    literal: b"x".to_vec(),
                    flags: flags.clone(),
                    thread_id: Some("t1".into()),
                    received_at: base_time(),
                },
            )
            .unwrap();
        assert_eq!(record.flags, flags);
        assert_eq!(record.thread_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_labels_and_removal() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let work = store.create_mailbox(&ctx(), OWNER, "Work").unwrap();
        let msg = insert(&store, &inbox.id, "m", 0);

        store
            .add_to_mailbox(&ctx(), OWNER, &[msg.id.clone()], &work.id)
            .unwrap();
        // Adding twice is harmless
        store
            .add_to_mailbox(&ctx(), OWNER, &[msg.id.clone()], &work.id)
            .unwrap();
        let record = store.get_message(&ctx(), OWNER, &msg.id).unwrap().unwrap();
        assert_eq!(record.mailbox_ids, vec![inbox.id.clone(), work.id.clone()]);
        assert_eq!(ids_in(&store, &work.id), vec![msg.id.clone()]);

        // Leaving the primary mailbox promotes the label
        let removal = store
            .remove_from_mailbox(&ctx(), OWNER, &[msg.id.clone()], &inbox.id)
            .unwrap();
        assert_eq!(removal.detached, vec![msg.id.clone()]);
        let record = store.get_message(&ctx(), OWNER, &msg.id).unwrap().unwrap();
        assert_eq!(record.mailbox_ids, vec![work.id.clone()]);

        // Leaving the last mailbox deletes the message
        let removal = store
            .remove_from_mailbox(&ctx(), OWNER, &[msg.id.clone()], &work.id)
            .unwrap();
        assert_eq!(removal.deleted, vec![msg.id.clone()]);
        assert!(store.get_message(&ctx(), OWNER, &msg.id).unwrap().is_none());
    }

    #[test]
    fn test_add_unknown_message_rolls_back() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let work = store.create_mailbox(&ctx(), OWNER, "Work").unwrap();
        let msg = insert(&store, &inbox.id, "m", 0);

        let result = store.add_to_mailbox(
            &ctx(),
            OWNER,
            &[msg.id.clone(), MessageId::new("404")],
            &work.id,
        );
        assert!(matches!(result, Err(StoreError::NoSuchMessage(_))));
        assert!(ids_in(&store, &work.id).is_empty());
    }

    #[test]
    fn test_move_messages() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let archive = store.create_mailbox(&ctx(), OWNER, "Archive").unwrap();
        let a = insert(&store, &inbox.id, "a", 0);
        let b = insert(&store, &inbox.id, "b", 1);

        store
            .move_messages(&ctx(), OWNER, &[a.id.clone(), b.id.clone()], &inbox.id, &archive.id)
            .unwrap();
        assert!(ids_in(&store, &inbox.id).is_empty());
        assert_eq!(ids_in(&store, &archive.id), vec![a.id, b.id]);
    }

    #[test]
    fn test_move_label_membership() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let work = store.create_mailbox(&ctx(), OWNER, "Work").unwrap();
        let home = store.create_mailbox(&ctx(), OWNER, "Home").unwrap();
        let msg = insert(&store, &inbox.id, "m", 0);
        store
            .add_to_mailbox(&ctx(), OWNER, &[msg.id.clone()], &work.id)
            .unwrap();

        store
            .move_messages(&ctx(), OWNER, &[msg.id.clone()], &work.id, &home.id)
            .unwrap();
        let record = store.get_message(&ctx(), OWNER, &msg.id).unwrap().unwrap();
        assert_eq!(record.mailbox_ids, vec![inbox.id, home.id]);
    }

    #[test]
    fn test_move_is_all_or_nothing() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let archive = store.create_mailbox(&ctx(), OWNER, "Archive").unwrap();
        let a = insert(&store, &inbox.id, "a", 0);
        let b = insert(&store, &inbox.id, "b", 1);
        let c = insert(&store, &inbox.id, "c", 2);

        // Refuse to move the second message
        store
            .with_conn(&ctx(), |conn| {
                conn.execute_batch(&format!(
                    "CREATE TRIGGER block_move BEFORE UPDATE OF mailbox_id ON messages
                     WHEN NEW.id = {}
                     BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
                    b.id
                ))?;
                Ok(())
            })
            .unwrap();

        let result = store.move_messages(
            &ctx(),
            OWNER,
            &[a.id.clone(), b.id.clone(), c.id.clone()],
            &inbox.id,
            &archive.id,
        );
        assert!(result.is_err());
        assert_eq!(ids_in(&store, &inbox.id), vec![a.id, b.id, c.id]);
        assert!(ids_in(&store, &archive.id).is_empty());
    }

    #[test]
    fn test_move_unknown_message_changes_nothing() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let archive = store.create_mailbox(&ctx(), OWNER, "Archive").unwrap();
        let a = insert(&store, &inbox.id, "a", 0);

        let result = store.move_messages(
            &ctx(),
            OWNER,
            &[a.id.clone(), MessageId::new("404")],
            &inbox.id,
            &archive.id,
        );
        assert!(matches!(result, Err(StoreError::NoSuchMessage(_))));
        assert_eq!(ids_in(&store, &inbox.id), vec![a.id]);
    }

    #[test]
    fn test_update_flags_is_transactional() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let a = insert(&store, &inbox.id, "a", 0);
        let b = insert(&store, &inbox.id, "b", 1);

        store
            .update_flags(&ctx(), OWNER, &[a.id.clone(), b.id.clone()], FlagChange::Seen(true))
            .unwrap();
        let status = store.mailbox_status(&ctx(), OWNER, &inbox.id).unwrap();
        assert_eq!(status, MailboxStatus { messages: 2, unseen: 0 });

        let result = store.update_flags(
            &ctx(),
            OWNER,
            &[a.id.clone(), MessageId::new("404")],
            FlagChange::Flagged(true),
        );
        assert!(result.is_err());
        let record = store.get_message(&ctx(), OWNER, &a.id).unwrap().unwrap();
        assert!(!record.flags.flagged);
    }

    #[test]
    fn test_expunge() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let work = store.create_mailbox(&ctx(), OWNER, "Work").unwrap();
        let keep = insert(&store, &inbox.id, "keep", 0);
        let gone = insert(&store, &inbox.id, "gone", 1);
        let labelled = insert(&store, &inbox.id, "labelled", 2);
        store
            .add_to_mailbox(&ctx(), OWNER, &[labelled.id.clone()], &work.id)
            .unwrap();
        store
            .update_flags(
                &ctx(),
                OWNER,
                &[gone.id.clone(), labelled.id.clone()],
                FlagChange::Deleted(true),
            )
            .unwrap();

        let removal = store.expunge(&ctx(), OWNER, &inbox.id).unwrap();
        assert_eq!(removal.deleted, vec![gone.id]);
        assert_eq!(removal.detached, vec![labelled.id.clone()]);
        assert_eq!(ids_in(&store, &inbox.id), vec![keep.id]);
        assert_eq!(ids_in(&store, &work.id), vec![labelled.id]);
    }

    #[test]
    fn test_delete_mailbox_keeps_labelled_messages() {
        let (store, _dir) = create_test_store();
        let inbox = store.create_mailbox(&ctx(), OWNER, "INBOX").unwrap();
        let work = store.create_mailbox(&ctx(), OWNER, "Work").unwrap();
        let only = insert(&store, &inbox.id, "only", 0);
        let shared = insert(&store, &inbox.id, "shared", 1);
        store
            .add_to_mailbox(&ctx(), OWNER, &[shared.id.clone()], &work.id)
            .unwrap();

        let removal = store.delete_mailbox(&ctx(), OWNER, &inbox.id).unwrap().unwrap();
        assert_eq!(removal.deleted, vec![only.id.clone()]);
        assert_eq!(removal.detached, vec![shared.id.clone()]);
        assert!(store.delete_mailbox(&ctx(), OWNER, &inbox.id).unwrap().is_none());
        assert!(store.get_message(&ctx(), OWNER, &only.id).unwrap().is_none());
        assert_eq!(ids_in(&store, &work.id), vec![shared.id.clone()]);

        // Deleting the label detaches the message from it as well
        let removal = store.delete_mailbox(&ctx(), OWNER, &work.id).unwrap().unwrap();
        assert_eq!(removal.deleted, vec![shared.id]);
        assert!(removal.detached.is_empty());
    }

    #[test]
    fn test_cancelled_context_is_rejected() {
        let (store, _dir) = create_test_store();
        let ctx = Context::background();
        ctx.cancel();
        assert!(matches!(
            store.list_mailboxes(&ctx, OWNER),
            Err(StoreError::Cancelled)
        ));
    }

    #[test]
    fn test_deadline_interrupts_running_statement() {
        let store = SqliteMailStore::in_memory().unwrap();
        let ctx = Context::background().with_timeout(std::time::Duration::from_millis(50));
        let result = store.with_conn(&ctx, |conn| {
            let n: i64 = conn.query_row(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c)
                 SELECT count(*) FROM c",
                [],
                |row| row.get(0),
            )?;
            Ok(n)
        });
        assert!(matches!(result, Err(StoreError::Cancelled)));

        // The handler is cleared afterwards
        assert!(store.list_mailboxes(&Context::background(), OWNER).is_ok());
    }
}
