//! Ticket and ticket thread data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ticket lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    InProgress,
    AwaitingClient,
    Resolved,
    Closed,
    AwaitingApproval,
    Approved,
    Rejected,
}

impl TicketStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::InProgress => "IN_PROGRESS",
            Self::AwaitingClient => "AWAITING_CLIENT",
            Self::Resolved => "RESOLVED",
            Self::Closed => "CLOSED",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Parse the database representation
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "IN_PROGRESS" => Some(Self::InProgress),
            "AWAITING_CLIENT" => Some(Self::AwaitingClient),
            "RESOLVED" => Some(Self::Resolved),
            "CLOSED" => Some(Self::Closed),
            "AWAITING_APPROVAL" => Some(Self::AwaitingApproval),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Resolved or closed tickets no longer accept work
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }
}

impl Default for TicketStatus {
    fn default() -> Self {
        Self::Open
    }
}

/// Ticket priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TicketPriority {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
        }
    }

    /// Parse the database representation
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "URGENT" => Some(Self::Urgent),
            _ => None,
        }
    }
}

impl Default for TicketPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// A helpdesk ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// Internal UUID
    pub id: String,

    /// Human-facing sequential number (strictly increasing, gaps allowed)
    pub number: i64,

    pub subject: String,

    pub description: String,

    pub status: TicketStatus,

    pub priority: TicketPriority,

    pub requester_name: String,

    pub requester_email: String,

    /// Owning department
    pub department_id: String,

    /// Linked client, when the requester is a known client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// IMAP UID of the originating message (dedup key together with department_id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailbox_uid: Option<u32>,

    /// Originating mailbox/folder
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailbox_identity: Option<String>,

    /// RFC 5322 Message-ID of the originating message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Created from a message that could not be parsed
    #[serde(default)]
    pub needs_review: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Reference token used in outgoing subjects, e.g. `[#42]`
    pub fn reference(&self) -> String {
        format!("[#{}]", self.number)
    }
}

/// Fields for a ticket materialized from a mailbox message
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub department_id: String,
    pub subject: String,
    pub description: String,
    pub priority: TicketPriority,
    pub requester_name: String,
    pub requester_email: String,
    pub mailbox_uid: u32,
    pub mailbox_identity: String,
    pub message_id: Option<String>,
    pub needs_review: bool,
}

/// One entry in a ticket's thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketMessage {
    pub id: String,

    pub ticket_id: String,

    pub department_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailbox_uid: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    pub sender_name: String,

    pub sender_email: String,

    pub body: String,

    /// Internal notes are never sent to the requester
    #[serde(default)]
    pub internal: bool,

    pub created_at: DateTime<Utc>,
}

/// Fields for a reply appended to an existing ticket
#[derive(Debug, Clone)]
pub struct NewTicketMessage {
    pub ticket_id: String,
    pub department_id: String,
    pub mailbox_uid: u32,
    pub message_id: Option<String>,
    pub sender_name: String,
    pub sender_email: String,
    pub body: String,
}
