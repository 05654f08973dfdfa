//! Notifications fired after tickets change

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::NotificationConfig;
use crate::error::{Error, Result};
use crate::models::{Department, Ticket, TicketMessage};

/// Told about new tickets and replies; failures never affect the pass
#[async_trait]
pub trait TicketNotifier: Send + Sync {
    async fn ticket_created(&self, department: &Department, ticket: &Ticket) -> Result<()>;

    async fn reply_appended(
        &self,
        department: &Department,
        ticket: &Ticket,
        message: &TicketMessage,
    ) -> Result<()>;
}

/// Writes a log line per event
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl TicketNotifier for LogNotifier {
    async fn ticket_created(&self, department: &Department, ticket: &Ticket) -> Result<()> {
        debug!(
            department = %department.id,
            ticket = ticket.number,
            priority = ticket.priority.as_str(),
            "New ticket from {}: {}",
            ticket.requester_email,
            ticket.subject
        );
        Ok(())
    }

    async fn reply_appended(
        &self,
        department: &Department,
        ticket: &Ticket,
        message: &TicketMessage,
    ) -> Result<()> {
        debug!(
            department = %department.id,
            ticket = ticket.number,
            "Reply from {} on {}",
            message.sender_email,
            ticket.reference()
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum WebhookEvent {
    TicketCreated,
    ReplyAppended,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: WebhookEvent,
    department_id: &'a str,
    department_name: &'a str,
    ticket_id: &'a str,
    ticket_number: i64,
    subject: &'a str,
    priority: &'static str,
    sender_email: &'a str,
    needs_review: bool,
    occurred_at: DateTime<Utc>,
}

/// POSTs a JSON payload per event
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| Error::Notification(format!("Failed to create HTTP client: {}", e)))?;

        info!("Ticket webhook enabled: {}", url);
        Ok(Self { client, url })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Notification(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Notification(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        debug!("Webhook accepted ticket {}", payload.ticket_number);
        Ok(())
    }
}

#[async_trait]
impl TicketNotifier for WebhookNotifier {
    async fn ticket_created(&self, department: &Department, ticket: &Ticket) -> Result<()> {
        self.post(&WebhookPayload {
            event: WebhookEvent::TicketCreated,
            department_id: &department.id,
            department_name: &department.name,
            ticket_id: &ticket.id,
            ticket_number: ticket.number,
            subject: &ticket.subject,
            priority: ticket.priority.as_str(),
            sender_email: &ticket.requester_email,
            needs_review: ticket.needs_review,
            occurred_at: ticket.created_at,
        })
        .await
    }

    async fn reply_appended(
        &self,
        department: &Department,
        ticket: &Ticket,
        message: &TicketMessage,
    ) -> Result<()> {
        self.post(&WebhookPayload {
            event: WebhookEvent::ReplyAppended,
            department_id: &department.id,
            department_name: &department.name,
            ticket_id: &ticket.id,
            ticket_number: ticket.number,
            subject: &ticket.subject,
            priority: ticket.priority.as_str(),
            sender_email: &message.sender_email,
            needs_review: ticket.needs_review,
            occurred_at: message.created_at,
        })
        .await
    }
}

/// Webhook when configured, log lines otherwise
pub fn notifier_from_config(config: &NotificationConfig) -> Result<Arc<dyn TicketNotifier>> {
    match config.webhook_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Ok(Arc::new(WebhookNotifier::new(
            url.to_string(),
            config.webhook_timeout_ms,
        )?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}
