//! Department registry and ticket store
//!
//! The dedup namespace is `(department_id, mailbox_uid)`. Tickets, thread replies
//! and skipped messages all claim a UID through the same uniqueness rule, and a
//! rejected claim surfaces as `Error::DuplicateTicket`.

mod memory;
mod postgres;
mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Department, NewTicket, NewTicketMessage, Ticket, TicketMessage};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use schema::{SCHEMA_STATEMENTS, TICKET_NUMBER_SEQUENCE};

/// Read-only view of configured departments
#[async_trait]
pub trait DepartmentRegistry: Send + Sync {
    /// active AND sync enabled AND mailbox credentials fully populated; empty is not an error
    async fn eligible_departments(&self) -> Result<Vec<Department>>;

    async fn list_departments(&self) -> Result<Vec<Department>>;

    async fn get_department(&self, id: &str) -> Result<Option<Department>>;
}

/// Persisted tickets and their threads
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn find_ticket_by_department_and_uid(
        &self,
        department_id: &str,
        uid: u32,
    ) -> Result<Option<Ticket>>;

    /// True when the UID already produced a ticket, a reply, or a skip record
    async fn is_processed(&self, department_id: &str, uid: u32) -> Result<bool>;

    /// Ticket owning a Message-ID, either as its origin or as one of its replies
    async fn find_ticket_by_message_id(
        &self,
        department_id: &str,
        message_id: &str,
    ) -> Result<Option<Ticket>>;

    async fn find_ticket_by_number(&self, department_id: &str, number: i64) -> Result<Option<Ticket>>;

    /// Non-terminal tickets opened by a requester, newest first
    async fn find_open_tickets_by_requester(
        &self,
        department_id: &str,
        requester_email: &str,
    ) -> Result<Vec<Ticket>>;

    /// Known client id for a requester address
    async fn find_client_by_email(&self, email: &str) -> Result<Option<String>>;

    /// Insert a ticket and its first thread entry atomically.
    /// Fails with `DuplicateTicket` when the UID is already claimed.
    async fn create_ticket(&self, ticket: NewTicket) -> Result<Ticket>;

    /// Fails with `DuplicateTicket` when the UID is already claimed
    async fn append_message(&self, message: NewTicketMessage) -> Result<TicketMessage>;

    /// Claim a UID without producing a ticket; claiming twice is a no-op
    async fn record_skipped(&self, department_id: &str, uid: u32, reason: &str) -> Result<()>;

    /// Count one more failed pass over an unclaimed UID, returning the attempts so far
    async fn record_failure(&self, department_id: &str, uid: u32, reason: &str) -> Result<u32>;

    /// Lowest failed UID that no claim has resolved yet
    async fn oldest_unresolved_failure(&self, department_id: &str) -> Result<Option<u32>>;

    /// Highest UID claimed for a department
    async fn last_processed_uid(&self, department_id: &str) -> Result<Option<u32>>;

    async fn update_department_last_sync(&self, department_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Atomic increment-and-fetch of the ticket number counter
    async fn next_ticket_number(&self) -> Result<i64>;
}
