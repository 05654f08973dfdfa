//! Inbound message data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl Address {
    /// Create a new address with just an email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new address with name and email
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Display name, falling back to the local part of the address
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self
                .email
                .split('@')
                .next()
                .filter(|local| !local.is_empty())
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

/// One fetched message, alive only for a single pipeline pass
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// IMAP UID within the synced folder
    pub uid: u32,

    /// RFC 5322 Message-ID
    pub message_id: Option<String>,

    /// In-Reply-To header
    pub in_reply_to: Option<String>,

    /// References header
    pub references: Vec<String>,

    pub from: Address,

    /// Subject, never empty (placeholder when missing)
    pub subject: String,

    /// Plain text body, never empty (placeholder when missing)
    pub body: String,

    /// HTML body, when the message had one
    pub body_html: Option<String>,

    pub date: DateTime<Utc>,

    /// Auto-Submitted / Precedence style automatic message
    pub is_auto_reply: bool,

    pub attachment_count: usize,

    /// The raw bytes could not be parsed; fields hold placeholders
    pub parse_failed: bool,
}

impl InboundMessage {
    /// Message-IDs this message answers, In-Reply-To first
    pub fn thread_parents(&self) -> Vec<&str> {
        let mut parents: Vec<&str> = Vec::new();
        if let Some(id) = self.in_reply_to.as_deref() {
            parents.push(id);
        }
        for id in self.references.iter().rev() {
            if !parents.contains(&id.as_str()) {
                parents.push(id);
            }
        }
        parents
    }
}
