//! Scripted mailbox doubles for orchestrator and scheduler tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use crate::config::SyncConfig;
use crate::db::MemoryStore;
use crate::error::{Error, Result};
use crate::mailbox::{
    FolderStatus, MailboxConnector, MailboxCredentials, MailboxSession, MessageFlag, UidRange,
};
use crate::models::Department;
use crate::secrets::PlaintextDecryptor;
use crate::sync::SyncOrchestrator;

/// How a scripted connect fails
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectFailure {
    Refused,
    Timeout,
    Rejected,
}

#[derive(Default)]
struct Script {
    messages: BTreeMap<u32, Vec<u8>>,
    listing_order: Option<Vec<u32>>,
    connect_failure: Option<ConnectFailure>,
    connect_delay: Option<Duration>,
    select_failure: bool,
    fetch_failures: HashSet<u32>,
    disconnect_at: Option<u32>,
    fetch_delay: Option<Duration>,
    fetch_barrier: Option<Arc<Barrier>>,
    flag_failures: bool,
    move_failures: bool,
}

#[derive(Default)]
struct Record {
    connect_attempts: usize,
    connects: usize,
    active_sessions: usize,
    max_active_sessions: usize,
    logouts: usize,
    unselects: usize,
    fetched: Vec<u32>,
    flags: Vec<(u32, MessageFlag, bool)>,
    moved: Vec<(u32, String)>,
}

/// One scripted mailbox, shared by every session opened against it
#[derive(Default)]
pub(crate) struct FakeMailbox {
    script: Mutex<Script>,
    record: Mutex<Record>,
}

impl FakeMailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_messages(messages: impl IntoIterator<Item = (u32, Vec<u8>)>) -> Arc<Self> {
        let mailbox = Self::new();
        for (uid, raw) in messages {
            mailbox.deliver(uid, raw);
        }
        mailbox
    }

    pub fn deliver(&self, uid: u32, raw: Vec<u8>) {
        self.script.lock().messages.insert(uid, raw);
    }

    /// UIDs in the order the server reports them
    pub fn list_in_order(&self, order: Vec<u32>) {
        self.script.lock().listing_order = Some(order);
    }

    pub fn fail_connect(&self, failure: ConnectFailure) {
        self.script.lock().connect_failure = Some(failure);
    }

    pub fn delay_connect(&self, delay: Duration) {
        self.script.lock().connect_delay = Some(delay);
    }

    pub fn fail_select(&self) {
        self.script.lock().select_failure = true;
    }

    pub fn fail_fetch(&self, uid: u32) {
        self.script.lock().fetch_failures.insert(uid);
    }

    /// Let a previously failing UID be fetched again
    pub fn heal_fetch(&self, uid: u32) {
        self.script.lock().fetch_failures.remove(&uid);
    }

    /// Drop the connection when this UID is fetched
    pub fn disconnect_at(&self, uid: u32) {
        self.script.lock().disconnect_at = Some(uid);
    }

    pub fn delay_fetch(&self, delay: Duration) {
        self.script.lock().fetch_delay = Some(delay);
    }

    /// Every fetch waits on the barrier before returning
    pub fn gate_fetch(&self, barrier: Arc<Barrier>) {
        self.script.lock().fetch_barrier = Some(barrier);
    }

    pub fn fail_flags(&self) {
        self.script.lock().flag_failures = true;
    }

    pub fn fail_moves(&self) {
        self.script.lock().move_failures = true;
    }

    pub fn connect_attempts(&self) -> usize {
        self.record.lock().connect_attempts
    }

    /// Successful connects
    pub fn connects(&self) -> usize {
        self.record.lock().connects
    }

    pub fn active_sessions(&self) -> usize {
        self.record.lock().active_sessions
    }

    pub fn max_active_sessions(&self) -> usize {
        self.record.lock().max_active_sessions
    }

    pub fn logouts(&self) -> usize {
        self.record.lock().logouts
    }

    pub fn unselects(&self) -> usize {
        self.record.lock().unselects
    }

    pub fn fetched(&self) -> Vec<u32> {
        self.record.lock().fetched.clone()
    }

    pub fn flags(&self) -> Vec<(u32, MessageFlag, bool)> {
        self.record.lock().flags.clone()
    }

    pub fn moved(&self) -> Vec<(u32, String)> {
        self.record.lock().moved.clone()
    }
}

/// Routes connects to mailboxes by username
#[derive(Default)]
pub(crate) struct FakeConnector {
    mailboxes: Mutex<HashMap<String, Arc<FakeMailbox>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, username: &str, mailbox: Arc<FakeMailbox>) {
        self.mailboxes.lock().insert(username.to_string(), mailbox);
    }
}

#[async_trait]
impl MailboxConnector for FakeConnector {
    async fn connect(&self, credentials: &MailboxCredentials) -> Result<Box<dyn MailboxSession>> {
        let mailbox = self
            .mailboxes
            .lock()
            .get(&credentials.username)
            .cloned()
            .ok_or_else(|| Error::connection(&credentials.host, "unknown user"))?;

        mailbox.record.lock().connect_attempts += 1;
        let (failure, delay) = {
            let script = mailbox.script.lock();
            (script.connect_failure, script.connect_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(ConnectFailure::Refused) => {
                return Err(Error::connection(&credentials.host, "connection refused"))
            }
            Some(ConnectFailure::Timeout) => return Err(Error::timeout("connect", 20)),
            Some(ConnectFailure::Rejected) => {
                return Err(Error::AuthenticationFailed {
                    host: credentials.host.clone(),
                    username: credentials.username.clone(),
                    reason: "invalid credentials".to_string(),
                })
            }
            None => {}
        }

        {
            let mut record = mailbox.record.lock();
            record.connects += 1;
            record.active_sessions += 1;
            record.max_active_sessions = record.max_active_sessions.max(record.active_sessions);
        }

        Ok(Box::new(FakeSession {
            mailbox,
            selected: None,
            logged_out: false,
        }))
    }
}

struct FakeSession {
    mailbox: Arc<FakeMailbox>,
    selected: Option<String>,
    logged_out: bool,
}

#[async_trait]
impl MailboxSession for FakeSession {
    async fn select_folder(&mut self, name: &str) -> Result<FolderStatus> {
        let script = self.mailbox.script.lock();
        if script.select_failure {
            return Err(Error::Imap(format!("SELECT {} failed", name)));
        }
        self.selected = Some(name.to_string());
        Ok(FolderStatus {
            name: name.to_string(),
            exists: script.messages.len() as u32,
            unseen: None,
            uid_next: script.messages.keys().next_back().map(|uid| uid + 1),
            uid_validity: Some(1),
        })
    }

    async fn list_folders(&mut self) -> Result<Vec<String>> {
        Ok(vec!["INBOX".to_string()])
    }

    async fn list_uids(&mut self, range: UidRange) -> Result<Vec<u32>> {
        let script = self.mailbox.script.lock();
        let uids: Vec<u32> = match &script.listing_order {
            Some(order) => order.clone(),
            None => script.messages.keys().copied().collect(),
        };
        Ok(uids.into_iter().filter(|uid| range.contains(*uid)).collect())
    }

    async fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>> {
        let (barrier, delay) = {
            let script = self.mailbox.script.lock();
            (script.fetch_barrier.clone(), script.fetch_delay)
        };
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.mailbox.record.lock().fetched.push(uid);
        let script = self.mailbox.script.lock();
        if script.disconnect_at == Some(uid) {
            return Err(Error::connection("imap.example.com", "connection reset"));
        }
        if script.fetch_failures.contains(&uid) {
            return Err(Error::fetch(uid, "message no longer exists"));
        }
        script
            .messages
            .get(&uid)
            .cloned()
            .ok_or_else(|| Error::fetch(uid, "message no longer exists"))
    }

    async fn mutate_flags(&mut self, uid: u32, flag: MessageFlag, on: bool) -> bool {
        if self.mailbox.script.lock().flag_failures {
            return false;
        }
        self.mailbox.record.lock().flags.push((uid, flag, on));
        true
    }

    async fn move_message(&mut self, uid: u32, folder: &str) -> bool {
        if self.mailbox.script.lock().move_failures {
            return false;
        }
        self.mailbox.record.lock().moved.push((uid, folder.to_string()));
        true
    }

    async fn unselect(&mut self) -> Result<()> {
        if self.selected.take().is_some() {
            self.mailbox.record.lock().unselects += 1;
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        if !self.logged_out {
            self.logged_out = true;
            let mut record = self.mailbox.record.lock();
            record.logouts += 1;
            record.active_sessions -= 1;
        }
        Ok(())
    }
}

/// Minimal RFC 822 message
pub(crate) fn raw_message(uid: u32, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Ana Souza <ana@example.com>\r\n\
         To: support@example.com\r\n\
         Subject: {subject}\r\n\
         Message-ID: <msg-{uid}@example.com>\r\n\
         Date: Mon, 5 Oct 2026 10:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

/// Reply to `<msg-{parent}@example.com>`
pub(crate) fn raw_reply(uid: u32, parent: u32, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Ana Souza <ana@example.com>\r\n\
         To: support@example.com\r\n\
         Subject: {subject}\r\n\
         Message-ID: <msg-{uid}@example.com>\r\n\
         In-Reply-To: <msg-{parent}@example.com>\r\n\
         References: <msg-{parent}@example.com>\r\n\
         Date: Mon, 5 Oct 2026 11:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

/// Vacation responder
pub(crate) fn raw_auto_reply(uid: u32) -> Vec<u8> {
    format!(
        "From: Bruno <bruno@example.com>\r\n\
         To: support@example.com\r\n\
         Subject: Out of office\r\n\
         Message-ID: <msg-{uid}@example.com>\r\n\
         Auto-Submitted: auto-replied\r\n\
         Date: Mon, 5 Oct 2026 12:00:00 +0000\r\n\
         \r\n\
         I am away until Monday.\r\n"
    )
    .into_bytes()
}

/// Department whose mailbox username is `{id}@example.com`, password stored in plaintext
pub(crate) fn department(id: &str) -> Department {
    Department::new(id, format!("{} desk", id)).with_mailbox(
        "imap.example.com",
        993,
        format!("{}@example.com", id),
        "secret",
    )
}

/// Sync settings with millisecond backoff
pub(crate) fn settings() -> SyncConfig {
    SyncConfig {
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 4,
        ..SyncConfig::default()
    }
}

pub(crate) fn orchestrator(
    connector: Arc<FakeConnector>,
    store: Arc<MemoryStore>,
    settings: SyncConfig,
) -> SyncOrchestrator {
    SyncOrchestrator::new(connector, store, Arc::new(PlaintextDecryptor), settings)
}
