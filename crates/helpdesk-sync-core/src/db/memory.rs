//! In-memory registry and ticket store
//!
//! The uniqueness indexes and the ticket counter live under one lock, so the
//! check-and-insert of a claim is atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{
    Department, NewTicket, NewTicketMessage, Ticket, TicketMessage, TicketStatus,
};

use super::{DepartmentRegistry, TicketStore};

type ClaimKey = (String, u32);

struct Failure {
    attempts: u32,
    last_error: String,
}

#[derive(Default)]
struct State {
    departments: BTreeMap<String, Department>,
    tickets: Vec<Ticket>,
    messages: Vec<TicketMessage>,
    ticket_claims: HashSet<ClaimKey>,
    message_claims: HashSet<ClaimKey>,
    skipped: HashMap<ClaimKey, String>,
    failures: HashMap<ClaimKey, Failure>,
    clients: HashMap<String, String>,
    last_number: i64,
}

impl State {
    fn claimed(&self, key: &ClaimKey) -> bool {
        self.ticket_claims.contains(key)
            || self.message_claims.contains(key)
            || self.skipped.contains_key(key)
    }

    fn allocate_number(&mut self) -> i64 {
        self.last_number += 1;
        self.last_number
    }
}

/// Registry and store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    registry_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering after `last_number`
    pub fn with_last_ticket_number(self, last_number: i64) -> Self {
        self.state.lock().last_number = last_number;
        self
    }

    /// Insert or replace a department
    pub fn upsert_department(&self, department: Department) {
        self.state
            .lock()
            .departments
            .insert(department.id.clone(), department);
    }

    /// Register a known client
    pub fn add_client(&self, email: &str, client_id: &str) {
        self.state
            .lock()
            .clients
            .insert(email.to_lowercase(), client_id.to_string());
    }

    /// Make registry reads fail, simulating an unreachable configuration store
    pub fn set_registry_unavailable(&self, unavailable: bool) {
        self.registry_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Tickets of one department, ordered by number
    pub fn tickets(&self, department_id: &str) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self
            .state
            .lock()
            .tickets
            .iter()
            .filter(|t| t.department_id == department_id)
            .cloned()
            .collect();
        tickets.sort_by_key(|t| t.number);
        tickets
    }

    pub fn ticket_count(&self) -> usize {
        self.state.lock().tickets.len()
    }

    /// Thread of one ticket, oldest first
    pub fn messages(&self, ticket_id: &str) -> Vec<TicketMessage> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.ticket_id == ticket_id)
            .cloned()
            .collect()
    }

    /// Skip reason recorded for a UID
    pub fn skip_reason(&self, department_id: &str, uid: u32) -> Option<String> {
        self.state
            .lock()
            .skipped
            .get(&(department_id.to_string(), uid))
            .cloned()
    }

    /// Failed passes recorded for a UID and the last error seen
    pub fn failure(&self, department_id: &str, uid: u32) -> Option<(u32, String)> {
        self.state
            .lock()
            .failures
            .get(&(department_id.to_string(), uid))
            .map(|f| (f.attempts, f.last_error.clone()))
    }

    pub fn last_sync(&self, department_id: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .departments
            .get(department_id)
            .and_then(|d| d.last_sync)
    }

    fn check_registry(&self) -> Result<()> {
        if self.registry_unavailable.load(Ordering::SeqCst) {
            return Err(Error::Registry("in-memory registry marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DepartmentRegistry for MemoryStore {
    async fn eligible_departments(&self) -> Result<Vec<Department>> {
        self.check_registry()?;
        Ok(self
            .state
            .lock()
            .departments
            .values()
            .filter(|d| d.is_eligible())
            .cloned()
            .collect())
    }

    async fn list_departments(&self) -> Result<Vec<Department>> {
        self.check_registry()?;
        Ok(self.state.lock().departments.values().cloned().collect())
    }

    async fn get_department(&self, id: &str) -> Result<Option<Department>> {
        self.check_registry()?;
        Ok(self.state.lock().departments.get(id).cloned())
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn find_ticket_by_department_and_uid(
        &self,
        department_id: &str,
        uid: u32,
    ) -> Result<Option<Ticket>> {
        Ok(self
            .state
            .lock()
            .tickets
            .iter()
            .find(|t| t.department_id == department_id && t.mailbox_uid == Some(uid))
            .cloned())
    }

    async fn is_processed(&self, department_id: &str, uid: u32) -> Result<bool> {
        Ok(self.state.lock().claimed(&(department_id.to_string(), uid)))
    }

    async fn find_ticket_by_message_id(
        &self,
        department_id: &str,
        message_id: &str,
    ) -> Result<Option<Ticket>> {
        let state = self.state.lock();
        let in_department = |t: &&Ticket| t.department_id == department_id;

        if let Some(ticket) = state
            .tickets
            .iter()
            .filter(in_department)
            .find(|t| t.message_id.as_deref() == Some(message_id))
        {
            return Ok(Some(ticket.clone()));
        }

        let owner = state
            .messages
            .iter()
            .find(|m| m.department_id == department_id && m.message_id.as_deref() == Some(message_id))
            .map(|m| m.ticket_id.clone());

        Ok(owner.and_then(|ticket_id| {
            state
                .tickets
                .iter()
                .filter(in_department)
                .find(|t| t.id == ticket_id)
                .cloned()
        }))
    }

    async fn find_ticket_by_number(&self, department_id: &str, number: i64) -> Result<Option<Ticket>> {
        Ok(self
            .state
            .lock()
            .tickets
            .iter()
            .find(|t| t.department_id == department_id && t.number == number)
            .cloned())
    }

    async fn find_open_tickets_by_requester(
        &self,
        department_id: &str,
        requester_email: &str,
    ) -> Result<Vec<Ticket>> {
        let mut tickets: Vec<Ticket> = self
            .state
            .lock()
            .tickets
            .iter()
            .filter(|t| {
                t.department_id == department_id
                    && !t.status.is_terminal()
                    && t.requester_email.eq_ignore_ascii_case(requester_email)
            })
            .cloned()
            .collect();
        tickets.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(tickets)
    }

    async fn find_client_by_email(&self, email: &str) -> Result<Option<String>> {
        Ok(self.state.lock().clients.get(&email.to_lowercase()).cloned())
    }

    async fn create_ticket(&self, new: NewTicket) -> Result<Ticket> {
        let client_id = self.find_client_by_email(&new.requester_email).await?;

        let mut state = self.state.lock();
        let key = (new.department_id.clone(), new.mailbox_uid);
        if state.ticket_claims.contains(&key) || state.message_claims.contains(&key) {
            debug!(
                "Rejecting duplicate ticket for department {}, UID {}",
                new.department_id, new.mailbox_uid
            );
            return Err(Error::DuplicateTicket {
                department_id: new.department_id,
                uid: new.mailbox_uid,
            });
        }

        let now = Utc::now();
        let ticket = Ticket {
            id: uuid::Uuid::new_v4().to_string(),
            number: state.allocate_number(),
            subject: new.subject,
            description: new.description.clone(),
            status: TicketStatus::Open,
            priority: new.priority,
            requester_name: new.requester_name.clone(),
            requester_email: new.requester_email.clone(),
            department_id: new.department_id.clone(),
            client_id,
            mailbox_uid: Some(new.mailbox_uid),
            mailbox_identity: Some(new.mailbox_identity),
            message_id: new.message_id.clone(),
            needs_review: new.needs_review,
            created_at: now,
            updated_at: now,
        };
        let first_message = TicketMessage {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_id: ticket.id.clone(),
            department_id: new.department_id,
            mailbox_uid: Some(new.mailbox_uid),
            message_id: new.message_id,
            sender_name: new.requester_name,
            sender_email: new.requester_email,
            body: new.description,
            internal: false,
            created_at: now,
        };

        state.ticket_claims.insert(key.clone());
        state.message_claims.insert(key);
        state.tickets.push(ticket.clone());
        state.messages.push(first_message);
        Ok(ticket)
    }

    async fn append_message(&self, new: NewTicketMessage) -> Result<TicketMessage> {
        let mut state = self.state.lock();
        let key = (new.department_id.clone(), new.mailbox_uid);
        if state.message_claims.contains(&key) || state.ticket_claims.contains(&key) {
            return Err(Error::DuplicateTicket {
                department_id: new.department_id,
                uid: new.mailbox_uid,
            });
        }

        let now = Utc::now();
        let message = TicketMessage {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_id: new.ticket_id,
            department_id: new.department_id,
            mailbox_uid: Some(new.mailbox_uid),
            message_id: new.message_id,
            sender_name: new.sender_name,
            sender_email: new.sender_email,
            body: new.body,
            internal: false,
            created_at: now,
        };

        if let Some(ticket) = state.tickets.iter_mut().find(|t| t.id == message.ticket_id) {
            ticket.updated_at = now;
        }
        state.message_claims.insert(key);
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn record_skipped(&self, department_id: &str, uid: u32, reason: &str) -> Result<()> {
        self.state
            .lock()
            .skipped
            .entry((department_id.to_string(), uid))
            .or_insert_with(|| reason.to_string());
        Ok(())
    }

    async fn record_failure(&self, department_id: &str, uid: u32, reason: &str) -> Result<u32> {
        let mut state = self.state.lock();
        let failure = state
            .failures
            .entry((department_id.to_string(), uid))
            .or_insert_with(|| Failure {
                attempts: 0,
                last_error: String::new(),
            });
        failure.attempts += 1;
        failure.last_error = reason.to_string();
        Ok(failure.attempts)
    }

    async fn oldest_unresolved_failure(&self, department_id: &str) -> Result<Option<u32>> {
        let state = self.state.lock();
        Ok(state
            .failures
            .keys()
            .filter(|key| key.0 == department_id && !state.claimed(key))
            .map(|(_, uid)| *uid)
            .min())
    }

    async fn last_processed_uid(&self, department_id: &str) -> Result<Option<u32>> {
        let state = self.state.lock();
        Ok(state
            .ticket_claims
            .iter()
            .chain(state.message_claims.iter())
            .chain(state.skipped.keys())
            .filter(|(dept, _)| dept == department_id)
            .map(|(_, uid)| *uid)
            .max())
    }

    async fn update_department_last_sync(&self, department_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        let department = state
            .departments
            .get_mut(department_id)
            .ok_or_else(|| Error::DepartmentNotFound(department_id.to_string()))?;
        department.last_sync = Some(at);
        Ok(())
    }

    async fn next_ticket_number(&self) -> Result<i64> {
        Ok(self.state.lock().allocate_number())
    }
}
