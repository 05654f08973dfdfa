//! Mailbox Connection Adapter
//!
//! One authenticated session per mailbox per pass. The adapter reports every
//! failure as a typed error and never retries; retry policy belongs to the
//! orchestrator.

mod command_budget;
mod imap;

pub use command_budget::{CommandBudget, ImapCommand};
pub use imap::ImapConnector;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::Department;
use crate::secrets::SecretDecryptor;

/// Everything needed to open one mailbox session
#[derive(Clone)]
pub struct MailboxCredentials {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when true, plain TCP otherwise
    pub secure: bool,
    pub username: String,
    pub password: String,
}

impl MailboxCredentials {
    /// Resolve a department's stored settings, decrypting the password
    pub fn for_department(department: &Department, decryptor: &dyn SecretDecryptor) -> Result<Self> {
        let missing = |field: &str| {
            Error::Credentials(format!(
                "department {} has no {} configured",
                department.id, field
            ))
        };

        let host = department.imap_host.clone().ok_or_else(|| missing("imap_host"))?;
        let username = department.imap_email.clone().ok_or_else(|| missing("imap_email"))?;
        let stored = department
            .imap_password_encrypted
            .as_deref()
            .ok_or_else(|| missing("imap_password"))?;

        Ok(Self {
            host,
            port: department.imap_port,
            secure: department.imap_secure,
            username,
            password: decryptor.decrypt(stored)?,
        })
    }
}

impl std::fmt::Debug for MailboxCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Snapshot taken when a folder is selected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderStatus {
    pub name: String,
    pub exists: u32,
    pub unseen: Option<u32>,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
}

/// Which UIDs to enumerate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidRange {
    /// Every message in the folder
    All,
    /// UIDs strictly greater than the given cursor
    After(u32),
}

impl UidRange {
    /// IMAP sequence-set syntax
    pub fn to_imap_set(self) -> String {
        match self {
            UidRange::All => "1:*".to_string(),
            UidRange::After(cursor) => format!("{}:*", cursor.saturating_add(1)),
        }
    }

    /// `n:*` always matches the highest UID, even below `n`; filter it out
    pub fn contains(self, uid: u32) -> bool {
        match self {
            UidRange::All => true,
            UidRange::After(cursor) => uid > cursor,
        }
    }
}

/// System flags the pipeline touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFlag {
    Seen,
    Flagged,
    Answered,
    Deleted,
}

impl MessageFlag {
    pub fn as_imap(&self) -> &'static str {
        match self {
            MessageFlag::Seen => "\\Seen",
            MessageFlag::Flagged => "\\Flagged",
            MessageFlag::Answered => "\\Answered",
            MessageFlag::Deleted => "\\Deleted",
        }
    }
}

/// Opens authenticated sessions
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Fails with `Connection` on TCP/TLS failure, `AuthenticationFailed` when LOGIN is refused, or `Timeout`
    async fn connect(&self, credentials: &MailboxCredentials) -> Result<Box<dyn MailboxSession>>;
}

/// One live mailbox session
#[async_trait]
pub trait MailboxSession: Send {
    /// Select a folder for exclusive enumeration
    async fn select_folder(&mut self, name: &str) -> Result<FolderStatus>;

    async fn list_folders(&mut self) -> Result<Vec<String>>;

    /// Ascending UIDs within `range`
    async fn list_uids(&mut self, range: UidRange) -> Result<Vec<u32>>;

    /// Raw RFC 822 bytes; `Fetch` error when the message vanished
    async fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>>;

    /// Best effort; returns false on failure
    async fn mutate_flags(&mut self, uid: u32, flag: MessageFlag, on: bool) -> bool;

    /// Best effort; creates the destination when missing
    async fn move_message(&mut self, uid: u32, folder: &str) -> bool;

    /// Release the selected folder
    async fn unselect(&mut self) -> Result<()>;

    async fn logout(&mut self) -> Result<()>;
}
