use super::*;
use crate::auth::generate_password;
use crate::engine::Connector;
use crate::models::flags::{FLAG_FLAGGED, FLAG_SEEN};
use crate::storage::{NewAccount, NewMessage, SqliteMailStore};
use crate::updates::{OverflowPolicy, UpdateStream};
use std::thread;
use std::time::Duration;

const EMAIL: &str = "alice@example.com";
const PASSWORD: &str = "correct horse";

struct Harness {
    store: Arc<SqliteMailStore>,
    connector: DbConnector,
    seen: Arc<Mutex<Vec<UpdateKind>>>,
}

impl Harness {
    /// Deliver everything queued and return every update seen so far
    fn updates(&self) -> Vec<UpdateKind> {
        self.connector.dispatcher().flush(&ctx()).unwrap();
        self.seen.lock().unwrap().clone()
    }

    fn clear_updates(&self) {
        self.connector.dispatcher().flush(&ctx()).unwrap();
        self.seen.lock().unwrap().clear();
    }

    fn mailbox(&self, segments: &[&str]) -> MailboxId {
        self.connector.create_mailbox(&ctx(), &path(segments)).unwrap().id
    }

    fn append(&self, mailbox: &MailboxId, body: &str) -> MessageId {
        let (message, _) = self
            .connector
            .create_message(&ctx(), mailbox, body.as_bytes(), &FlagSet::new(), Utc::now())
            .unwrap();
        message.id
    }

    fn memberships(&self, id: &MessageId) -> Vec<MailboxId> {
        self.store
            .get_message(&ctx(), EMAIL, id)
            .unwrap()
            .unwrap()
            .mailbox_ids
    }
}

fn ctx() -> Context {
    Context::background()
}

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

/// Acknowledge every update, recording it first
fn spawn_engine(stream: UpdateStream) -> Arc<Mutex<Vec<UpdateKind>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    thread::spawn(move || {
        for update in stream {
            log.lock().unwrap().push(update.kind().clone());
            update.done();
        }
    });
    seen
}

fn manual_flush() -> DispatcherConfig {
    DispatcherConfig {
        flush_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn setup_with(dispatcher: DispatcherConfig, resync_cooldown_secs: u64) -> Harness {
    let store = Arc::new(SqliteMailStore::in_memory().unwrap());
    store
        .insert_account(
            &ctx(),
            &NewAccount {
                email: EMAIL.to_string(),
                password_hash: generate_password(PASSWORD).unwrap(),
                tenant_name: "acme".to_string(),
                mailbox_size: 10_000,
                imap_enabled: true,
                ..Default::default()
            },
        )
        .unwrap();

    let connector = DbConnector::new(
        store.clone(),
        EMAIL,
        ConnectorOptions {
            naming: NamingPolicy::new("INBOX", "[Labels]"),
            dispatcher,
            resync_cooldown_secs,
            ..Default::default()
        },
    );
    let seen = spawn_engine(connector.get_updates());
    Harness {
        store,
        connector,
        seen,
    }
}

fn setup() -> Harness {
    setup_with(manual_flush(), 0)
}

#[test]
fn test_authorize() {
    let h = setup();
    let c = &h.connector;

    assert!(!c.authorize(&ctx(), EMAIL, b"wrong"));
    assert!(!c.authorize(&ctx(), "mallory@example.com", PASSWORD.as_bytes()));
    assert!(c.user().is_none());
    assert!(matches!(c.quota(), Err(ConnectorError::NotAuthorized)));

    assert!(c.authorize(&ctx(), "Alice@Example.com", PASSWORD.as_bytes()));
    let user = c.user().unwrap();
    assert_eq!(user.email, EMAIL);
    assert_eq!(user.tenant_name, "acme");
    assert_eq!(c.quota().unwrap().1, 10_000);

    // A later authorize verifies but keeps the first context
    assert!(c.authorize(&ctx(), EMAIL, PASSWORD.as_bytes()));
    assert_eq!(c.user().unwrap(), user);
}

#[test]
fn test_authorize_unknown_account() {
    let store = Arc::new(SqliteMailStore::in_memory().unwrap());
    let connector = DbConnector::new(store, "nobody@example.com", ConnectorOptions::default());
    assert!(!connector.authorize(&ctx(), "nobody@example.com", b"anything"));
    assert!(connector.user().is_none());
}

#[test]
fn test_create_mailbox_announces_and_caches() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let work = h.mailbox(&["[Labels]", "Work"]);

    assert!(h.connector.state.is_exclusive(&inbox).unwrap());
    assert!(!h.connector.state.is_exclusive(&work).unwrap());

    let names: Vec<&str> = h.updates().iter().map(|u| u.name()).collect();
    assert_eq!(names, vec!["MailboxCreated", "MailboxCreated"]);
}

#[test]
fn test_invalid_prefix_touches_nothing() {
    let h = setup();
    let err = h
        .connector
        .create_mailbox(&ctx(), &path(&["Other"]))
        .unwrap_err();
    assert!(matches!(err, ConnectorError::InvalidPrefix { .. }));
    assert!(h.store.list_mailboxes(&ctx(), EMAIL).unwrap().is_empty());
    assert!(h.connector.state.is_empty());
    assert!(h.updates().is_empty());
}

#[test]
fn test_inbox_cannot_be_renamed_or_deleted() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);

    assert!(matches!(
        h.connector
            .update_mailbox_name(&ctx(), &inbox, &path(&["INBOX", "Old"])),
        Err(ConnectorError::RenameForbidden(_))
    ));
    assert!(matches!(
        h.connector.delete_mailbox(&ctx(), &inbox),
        Err(ConnectorError::DeleteForbidden(_))
    ));
}

#[test]
fn test_rename_and_delete_mailbox() {
    let h = setup();
    let work = h.mailbox(&["[Labels]", "Work"]);
    h.clear_updates();

    h.connector
        .update_mailbox_name(&ctx(), &work, &path(&["[Labels]", "Office"]))
        .unwrap();
    let stored = h.store.get_mailbox(&ctx(), EMAIL, &work).unwrap().unwrap();
    assert_eq!(stored.name, "[Labels]/Office");
    assert_eq!(h.connector.state.name(&work).unwrap(), path(&["[Labels]", "Office"]));

    h.connector.delete_mailbox(&ctx(), &work).unwrap();
    assert!(h.store.get_mailbox(&ctx(), EMAIL, &work).unwrap().is_none());
    assert!(h.connector.state.get_mailbox(&work).is_err());

    assert_eq!(
        h.updates(),
        vec![
            UpdateKind::MailboxRenamed {
                mailbox_id: work.clone(),
                name: path(&["[Labels]", "Office"]),
            },
            UpdateKind::MailboxDeleted(work.clone()),
        ]
    );
    assert!(matches!(
        h.connector.delete_mailbox(&ctx(), &work),
        Err(ConnectorError::NoSuchMailbox(_))
    ));
}

#[test]
fn test_delete_mailbox_announces_its_messages() {
    let h = setup();
    let archive = h.mailbox(&["INBOX", "Archive"]);
    let work = h.mailbox(&["[Labels]", "Work"]);
    let only = h.append(&archive, "only here");
    let shared = h.append(&archive, "also labelled");
    h.connector
        .add_messages_to_mailbox(&ctx(), std::slice::from_ref(&shared), &work)
        .unwrap();
    h.clear_updates();

    h.connector.delete_mailbox(&ctx(), &archive).unwrap();
    assert_eq!(h.memberships(&shared), vec![work.clone()]);

    let updates = h.updates();
    assert_eq!(updates.len(), 3);
    assert!(matches!(
        &updates[0],
        UpdateKind::MessageMailboxesUpdated { message_id, mailbox_ids, .. }
            if *message_id == shared && *mailbox_ids == vec![work.clone()]
    ));
    assert_eq!(updates[1], UpdateKind::MessageDeleted(only));
    assert_eq!(updates[2], UpdateKind::MailboxDeleted(archive));
}

#[test]
fn test_create_message_and_literal() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    h.clear_updates();

    let flags = FlagSet::new().with(FLAG_SEEN).with("$Receipt");
    let (message, literal) = h
        .connector
        .create_message(&ctx(), &inbox, b"Subject: hi\r\n\r\nbody", &flags, Utc::now())
        .unwrap();
    assert_eq!(literal, b"Subject: hi\r\n\r\nbody");
    assert!(message.flags.contains(FLAG_SEEN));
    assert!(message.flags.contains("$Receipt"));
    assert!(message.flags.contains(mapping::KEYWORD_NORMAL_PRIORITY));

    assert_eq!(
        h.connector.get_message_literal(&ctx(), &message.id).unwrap(),
        literal
    );
    assert!(matches!(
        h.connector
            .get_message_literal(&ctx(), &MessageId::new("999")),
        Err(ConnectorError::NoSuchMessage(_))
    ));

    match h.updates().as_slice() {
        [UpdateKind::MessagesCreated(batch)] => {
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].message, message);
            assert_eq!(batch[0].mailbox_ids, vec![inbox]);
        }
        other => panic!("unexpected updates: {:?}", other),
    }
}

#[test]
fn test_create_message_in_unknown_mailbox() {
    let h = setup();
    let err = h
        .connector
        .create_message(&ctx(), &MailboxId::new("42"), b"x", &FlagSet::new(), Utc::now())
        .unwrap_err();
    assert!(matches!(err, ConnectorError::NoSuchMailbox(_)));
}

#[test]
fn test_flag_updates_carry_full_flag_set() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let id = h.append(&inbox, "one");
    h.clear_updates();

    h.connector
        .mark_messages_seen(&ctx(), std::slice::from_ref(&id), true)
        .unwrap();
    h.connector
        .mark_messages_flagged(&ctx(), std::slice::from_ref(&id), true)
        .unwrap();

    let updates = h.updates();
    assert_eq!(updates.len(), 2);
    match &updates[1] {
        UpdateKind::MessageFlagsUpdated { message_id, flags } => {
            assert_eq!(message_id, &id);
            assert!(flags.contains(FLAG_SEEN));
            assert!(flags.contains(FLAG_FLAGGED));
        }
        other => panic!("unexpected update: {:?}", other),
    }
}

#[test]
fn test_flag_batch_is_all_or_nothing() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let id = h.append(&inbox, "one");
    h.clear_updates();

    let err = h
        .connector
        .mark_messages_flagged(&ctx(), &[id.clone(), MessageId::new("999")], true)
        .unwrap_err();
    assert!(matches!(err, ConnectorError::NoSuchMessage(_)));

    let record = h.store.get_message(&ctx(), EMAIL, &id).unwrap().unwrap();
    assert!(!record.flags.flagged);
    assert!(h.updates().is_empty());
}

#[test]
fn test_move_folder_to_label_is_a_copy() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let work = h.mailbox(&["[Labels]", "Work"]);
    let id = h.append(&inbox, "one");

    let remove_source = h
        .connector
        .move_messages(&ctx(), std::slice::from_ref(&id), &inbox, &work)
        .unwrap();
    assert!(!remove_source);
    assert_eq!(h.memberships(&id), vec![inbox, work]);
}

#[test]
fn test_move_between_folders() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let archive = h.mailbox(&["INBOX", "Archive"]);
    let id = h.append(&inbox, "one");
    h.clear_updates();

    let remove_source = h
        .connector
        .move_messages(&ctx(), std::slice::from_ref(&id), &inbox, &archive)
        .unwrap();
    assert!(remove_source);
    assert_eq!(h.memberships(&id), vec![archive.clone()]);

    match h.updates().as_slice() {
        [UpdateKind::MessageMailboxesUpdated { message_id, mailbox_ids, .. }] => {
            assert_eq!(message_id, &id);
            assert_eq!(mailbox_ids, &vec![archive]);
        }
        other => panic!("unexpected updates: {:?}", other),
    }
}

#[test]
fn test_move_into_same_mailbox_keeps_source() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let id = h.append(&inbox, "one");
    h.clear_updates();

    let remove_source = h
        .connector
        .move_messages(&ctx(), std::slice::from_ref(&id), &inbox, &inbox)
        .unwrap();
    assert!(!remove_source);
    assert_eq!(h.memberships(&id), vec![inbox]);
    assert!(h.updates().is_empty());
}

#[test]
fn test_failed_move_changes_nothing() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let archive = h.mailbox(&["INBOX", "Archive"]);
    let first = h.append(&inbox, "one");
    let second = h.append(&inbox, "two");

    let err = h
        .connector
        .move_messages(
            &ctx(),
            &[first.clone(), MessageId::new("999"), second.clone()],
            &inbox,
            &archive,
        )
        .unwrap_err();
    assert!(matches!(err, ConnectorError::NoSuchMessage(_)));
    assert_eq!(h.memberships(&first), vec![inbox.clone()]);
    assert_eq!(h.memberships(&second), vec![inbox]);
}

#[test]
fn test_remove_and_expunge() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let work = h.mailbox(&["[Labels]", "Work"]);
    let keep = h.append(&inbox, "keep");
    let doomed = h.append(&inbox, "doomed");
    h.connector
        .add_messages_to_mailbox(&ctx(), std::slice::from_ref(&keep), &work)
        .unwrap();

    // Removing from the label only detaches
    h.connector
        .remove_messages_from_mailbox(&ctx(), std::slice::from_ref(&keep), &work)
        .unwrap();
    assert_eq!(h.memberships(&keep), vec![inbox.clone()]);

    h.connector
        .mark_messages_deleted(&ctx(), std::slice::from_ref(&doomed), true)
        .unwrap();
    h.clear_updates();

    let removal = h.connector.expunge(&ctx(), &inbox).unwrap();
    assert_eq!(removal.deleted, vec![doomed.clone()]);
    assert!(removal.detached.is_empty());
    assert_eq!(h.updates(), vec![UpdateKind::MessageDeleted(doomed.clone())]);
    assert!(h.store.get_message(&ctx(), EMAIL, &doomed).unwrap().is_none());
    assert!(h.store.get_message(&ctx(), EMAIL, &keep).unwrap().is_some());
}

#[test]
fn test_visibility_status_and_uid_validity() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let id = h.append(&inbox, "one");
    h.append(&inbox, "two");
    h.connector
        .mark_messages_seen(&ctx(), &[id], true)
        .unwrap();

    assert_eq!(h.connector.mailbox_visibility(&inbox), MailboxVisibility::Visible);
    h.connector
        .set_mailbox_visibility(&ctx(), &inbox, MailboxVisibility::Hidden)
        .unwrap();
    assert_eq!(h.connector.mailbox_visibility(&inbox), MailboxVisibility::Hidden);
    assert!(h.store.get_mailbox(&ctx(), EMAIL, &inbox).unwrap().unwrap().hidden);

    let status = h.connector.mailbox_status(&ctx(), &inbox).unwrap();
    assert_eq!(status, MailboxStatus { messages: 2, unseen: 1 });

    h.clear_updates();
    assert_eq!(h.connector.bump_uid_validity(&ctx(), &inbox).unwrap(), 2);
    assert_eq!(
        h.updates(),
        vec![UpdateKind::UidValidityBumped {
            mailbox_id: inbox,
            uid_validity: 2,
        }]
    );
}

#[test]
fn test_list_messages_carries_thread_reference() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let threaded = h
        .store
        .insert_message(
            &ctx(),
            EMAIL,
            &NewMessage {
                mailbox_id: inbox.clone(),
                literal: b"reply".to_vec(),
                flags: Default::default(),
                thread_id: Some("thread-7".into()),
                received_at: Utc::now(),
            },
        )
        .unwrap();
    let loose = h.append(&inbox, "standalone");

    let listed = h.connector.list_messages(&ctx(), &inbox).unwrap();
    let thread_of = |id: &MessageId| {
        listed
            .iter()
            .find(|created| &created.message.id == id)
            .map(|created| created.message.thread_id.clone())
    };
    assert_eq!(thread_of(&threaded.id), Some(Some("thread-7".to_string())));
    assert_eq!(thread_of(&loose), Some(None));
}

#[test]
fn test_receive_message_by_name() {
    let h = setup();
    let sent = h.mailbox(&["INBOX", "Sent"]);
    h.clear_updates();

    let message = h
        .connector
        .receive_message(&ctx(), &path(&["INBOX", "Sent"]), b"From: bob\r\n\r\nhi")
        .unwrap();
    assert!(!message.flags.contains(FLAG_SEEN));
    assert_eq!(h.memberships(&message.id), vec![sent]);
    assert_eq!(h.updates().len(), 1);

    assert!(matches!(
        h.connector
            .receive_message(&ctx(), &path(&["INBOX", "Nope"]), b"x"),
        Err(ConnectorError::NoSuchMailbox(_))
    ));
}

#[test]
fn test_cancelled_context() {
    let h = setup();
    let cancelled = Context::background();
    cancelled.cancel();

    let err = h
        .connector
        .create_mailbox(&cancelled, &path(&["INBOX"]))
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Cancelled));
    assert!(err.is_temporary());
    assert!(h.connector.state.is_empty());
}

#[test]
fn test_full_queue_marks_connector_stale() {
    let h = setup_with(
        DispatcherConfig {
            pending_limit: Some(1),
            overflow_policy: OverflowPolicy::Reject,
            ..manual_flush()
        },
        3600,
    );

    h.mailbox(&["INBOX"]);
    h.mailbox(&["INBOX", "Sent"]);
    assert!(h.connector.is_stale());
    assert_eq!(h.store.list_mailboxes(&ctx(), EMAIL).unwrap().len(), 2);

    // Stale connectors resync regardless of the cooldown
    h.connector.mark_resynced(Utc::now());
    let stats = h.connector.resync_if_due(&ctx()).unwrap().unwrap();
    assert_eq!(stats.mailboxes, 2);
    assert!(!h.connector.is_stale());
}

#[test]
fn test_failed_resync_keeps_connector_stale() {
    let h = setup_with(
        DispatcherConfig {
            pending_limit: Some(1),
            overflow_policy: OverflowPolicy::Reject,
            ..manual_flush()
        },
        3600,
    );
    h.mailbox(&["INBOX"]);
    h.mailbox(&["INBOX", "Sent"]);
    h.connector.mark_resynced(Utc::now());
    assert!(h.connector.is_stale());

    let cancelled = Context::background();
    cancelled.cancel();
    assert!(matches!(
        h.connector.resync(&cancelled),
        Err(ConnectorError::Cancelled)
    ));
    assert!(h.connector.is_stale());

    // Still inside the cooldown, but the lost update forces a resync
    let stats = h.connector.resync_if_due(&ctx()).unwrap();
    assert_eq!(stats.map(|s| s.mailboxes), Some(2));
    assert!(!h.connector.is_stale());
}

#[test]
fn test_resync_cooldown() {
    let store = Arc::new(SqliteMailStore::in_memory().unwrap());
    let connector = DbConnector::new(
        store,
        EMAIL,
        ConnectorOptions {
            resync_cooldown_secs: 3600,
            dispatcher: manual_flush(),
            ..Default::default()
        },
    );

    assert!(connector.resync_if_due(&ctx()).unwrap().is_some());
    assert!(connector.resync_if_due(&ctx()).unwrap().is_none());
}

#[test]
fn test_resync_announces_shared_message_once() {
    let h = setup();
    let inbox = h.mailbox(&["INBOX"]);
    let work = h.mailbox(&["[Labels]", "Work"]);
    let id = h.append(&inbox, "shared");
    h.connector
        .add_messages_to_mailbox(&ctx(), std::slice::from_ref(&id), &work)
        .unwrap();
    // Stored but unusable under the naming policy
    h.store.create_mailbox(&ctx(), EMAIL, "Elsewhere").unwrap();
    h.clear_updates();

    let stats = h.connector.resync(&ctx()).unwrap();
    assert_eq!(stats.mailboxes, 2);
    assert_eq!(stats.messages, 1);
    assert_eq!(stats.memberships, 1);
    assert_eq!(stats.skipped_mailboxes, 1);

    let updates = h.updates();
    let names: Vec<&str> = updates.iter().map(|u| u.name()).collect();
    assert_eq!(
        names,
        vec![
            "MailboxCreated",
            "MessagesCreated",
            "MailboxCreated",
            "MessageMailboxesUpdated"
        ]
    );
    match &updates[1] {
        UpdateKind::MessagesCreated(batch) => {
            assert_eq!(batch[0].mailbox_ids, vec![inbox.clone()]);
            assert_eq!(batch[0].literal, b"shared");
        }
        other => panic!("unexpected update: {:?}", other),
    }
    match &updates[3] {
        UpdateKind::MessageMailboxesUpdated { mailbox_ids, .. } => {
            assert_eq!(mailbox_ids, &vec![inbox, work]);
        }
        other => panic!("unexpected update: {:?}", other),
    }
}

#[test]
fn test_close_clears_state_and_ends_stream() {
    let h = setup();
    assert!(h.connector.authorize(&ctx(), EMAIL, PASSWORD.as_bytes()));
    h.mailbox(&["INBOX"]);

    let stream = h.connector.get_updates();
    h.connector.close(&ctx()).unwrap();

    assert!(h.connector.user().is_none());
    assert!(h.connector.state.is_empty());
    assert!(stream.recv().is_none());
    assert!(matches!(
        h.connector.create_mailbox(&ctx(), &path(&["INBOX", "Late"])),
        Err(ConnectorError::Dispatch(DispatchError::Closed))
    ));
}
