//! Department data structures

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default IMAPS port when a department leaves it unset
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// An organizational unit owning one shared support mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Department {
    /// Primary key
    pub id: String,

    /// Display name
    pub name: String,

    /// Whether the department is active at all
    pub active: bool,

    /// Whether mailbox sync is enabled
    pub sync_enabled: bool,

    /// IMAP server host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imap_host: Option<String>,

    /// IMAP server port
    pub imap_port: u16,

    /// Use implicit TLS for the IMAP connection
    pub imap_secure: bool,

    /// Mailbox login (usually the support address)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imap_email: Option<String>,

    /// Encrypted mailbox password, opaque to everything but the decryptor
    #[serde(skip_serializing)]
    pub imap_password_encrypted: Option<String>,

    /// Sync interval in seconds (<= 0 means "use the worker default")
    pub sync_interval_secs: i64,

    /// Last completed pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,

    /// Optional owning hierarchical group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl Department {
    /// Create an active, sync-enabled department without mailbox settings
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            active: true,
            sync_enabled: true,
            imap_host: None,
            imap_port: DEFAULT_IMAP_PORT,
            imap_secure: true,
            imap_email: None,
            imap_password_encrypted: None,
            sync_interval_secs: 0,
            last_sync: None,
            group_id: None,
        }
    }

    /// Set the mailbox settings
    pub fn with_mailbox(
        mut self,
        host: impl Into<String>,
        port: u16,
        email: impl Into<String>,
        password_encrypted: impl Into<String>,
    ) -> Self {
        self.imap_host = Some(host.into());
        self.imap_port = port;
        self.imap_email = Some(email.into());
        self.imap_password_encrypted = Some(password_encrypted.into());
        self
    }

    /// Set the sync interval
    pub fn with_interval_secs(mut self, secs: i64) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    /// True when every mailbox credential field is populated
    pub fn has_mailbox_credentials(&self) -> bool {
        fn filled(value: &Option<String>) -> bool {
            value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
        }

        filled(&self.imap_host)
            && filled(&self.imap_email)
            && filled(&self.imap_password_encrypted)
            && self.imap_port != 0
    }

    /// active AND sync enabled AND credentials fully populated
    pub fn is_eligible(&self) -> bool {
        self.active && self.sync_enabled && self.has_mailbox_credentials()
    }

    /// Interval between passes, falling back to `default_secs` and never below `min_secs`
    pub fn effective_interval(&self, default_secs: u64, min_secs: u64) -> Duration {
        let secs = if self.sync_interval_secs > 0 {
            self.sync_interval_secs as u64
        } else {
            default_secs
        };
        Duration::from_secs(secs.max(min_secs))
    }

    /// Identity of one folder of this department's mailbox, stored on tickets
    pub fn mailbox_identity(&self, folder: &str) -> String {
        format!(
            "{}/{}/{}",
            self.imap_host.as_deref().unwrap_or("unknown"),
            self.imap_email.as_deref().unwrap_or("unknown"),
            folder
        )
    }
}

impl std::fmt::Display for Department {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
