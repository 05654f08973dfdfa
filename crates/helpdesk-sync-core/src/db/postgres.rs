//! PostgreSQL-backed registry and ticket store
//!
//! Uniqueness of `(department_id, mailbox_uid)` is enforced by database
//! constraints and ticket numbers come from a sequence, so the guarantees hold
//! across any number of worker processes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{
    Department, NewTicket, NewTicketMessage, Ticket, TicketMessage, TicketPriority, TicketStatus,
};

use super::schema::{
    MESSAGE_UID_CONSTRAINT, SCHEMA_STATEMENTS, TICKET_NUMBER_SEQUENCE, TICKET_UID_CONSTRAINT,
};
use super::{DepartmentRegistry, TicketStore};

/// External clients table used for requester linking, when the deployment has one
const CLIENTS_TABLE: &str = "clientes";

const DEPARTMENT_COLUMNS: &str = "id, name, active, sync_enabled, imap_host, imap_port, imap_secure, \
     imap_email, imap_password_encrypted, sync_interval_seconds, last_sync, group_id";

const TICKET_COLUMNS: &str = "id, numero, subject, description, status, priority, requester_name, \
     requester_email, department_id, client_id, mailbox_uid, mailbox_identity, message_id, \
     needs_review, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, ticket_id, department_id, mailbox_uid, message_id, sender_name, \
     sender_email, body, internal, created_at";

#[derive(Debug, sqlx::FromRow)]
struct DepartmentRow {
    id: String,
    name: String,
    active: bool,
    sync_enabled: bool,
    imap_host: Option<String>,
    imap_port: i32,
    imap_secure: bool,
    imap_email: Option<String>,
    imap_password_encrypted: Option<String>,
    sync_interval_seconds: i64,
    last_sync: Option<DateTime<Utc>>,
    group_id: Option<String>,
}

impl From<DepartmentRow> for Department {
    fn from(row: DepartmentRow) -> Self {
        Department {
            id: row.id,
            name: row.name,
            active: row.active,
            sync_enabled: row.sync_enabled,
            imap_host: row.imap_host,
            // Out-of-range ports make the department ineligible instead of failing the read
            imap_port: u16::try_from(row.imap_port).unwrap_or(0),
            imap_secure: row.imap_secure,
            imap_email: row.imap_email,
            imap_password_encrypted: row.imap_password_encrypted,
            sync_interval_secs: row.sync_interval_seconds,
            last_sync: row.last_sync,
            group_id: row.group_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TicketRow {
    id: String,
    numero: i64,
    subject: String,
    description: String,
    status: String,
    priority: String,
    requester_name: String,
    requester_email: String,
    department_id: String,
    client_id: Option<String>,
    mailbox_uid: Option<i64>,
    mailbox_identity: Option<String>,
    message_id: Option<String>,
    needs_review: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = Error;

    fn try_from(row: TicketRow) -> Result<Self> {
        let status = TicketStatus::from_str(&row.status)
            .ok_or_else(|| Error::Other(format!("Unknown ticket status '{}' on {}", row.status, row.id)))?;
        let priority = TicketPriority::from_str(&row.priority)
            .ok_or_else(|| Error::Other(format!("Unknown ticket priority '{}' on {}", row.priority, row.id)))?;

        Ok(Ticket {
            id: row.id,
            number: row.numero,
            subject: row.subject,
            description: row.description,
            status,
            priority,
            requester_name: row.requester_name,
            requester_email: row.requester_email,
            department_id: row.department_id,
            client_id: row.client_id,
            mailbox_uid: row.mailbox_uid.and_then(|uid| u32::try_from(uid).ok()),
            mailbox_identity: row.mailbox_identity,
            message_id: row.message_id,
            needs_review: row.needs_review,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: String,
    ticket_id: String,
    department_id: String,
    mailbox_uid: Option<i64>,
    message_id: Option<String>,
    sender_name: String,
    sender_email: String,
    body: String,
    internal: bool,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for TicketMessage {
    fn from(row: MessageRow) -> Self {
        TicketMessage {
            id: row.id,
            ticket_id: row.ticket_id,
            department_id: row.department_id,
            mailbox_uid: row.mailbox_uid.and_then(|uid| u32::try_from(uid).ok()),
            message_id: row.message_id,
            sender_name: row.sender_name,
            sender_email: row.sender_email,
            body: row.body,
            internal: row.internal,
            created_at: row.created_at,
        }
    }
}

/// True for the constraints that guard `(department_id, mailbox_uid)` claims
fn is_claim_constraint(constraint: Option<&str>) -> bool {
    matches!(constraint, Some(TICKET_UID_CONSTRAINT) | Some(MESSAGE_UID_CONSTRAINT))
}

/// Map an insert failure, turning a rejected UID claim into `DuplicateTicket`.
/// Other unique violations (ticket number, primary key) stay database errors.
fn classify_insert_error(e: sqlx::Error, department_id: &str, uid: u32) -> Error {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() && is_claim_constraint(db_err.constraint()) {
            return Error::DuplicateTicket {
                department_id: department_id.to_string(),
                uid,
            };
        }
    }
    Error::Database(e)
}

/// Registry reads failing means the configuration store is unreachable
fn registry_error(e: sqlx::Error) -> Error {
    Error::Registry(e.to_string())
}

/// PostgreSQL registry and ticket store
pub struct PostgresStore {
    pool: PgPool,
    clients_table_present: bool,
}

impl PostgresStore {
    /// Connect, optionally bootstrap the schema, and check for the clients table
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config.resolve_url()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .map_err(|e| Error::Registry(format!("Failed to connect to database: {}", e)))?;

        let mut store = Self {
            pool,
            clients_table_present: false,
        };

        if config.ensure_schema {
            store.ensure_schema().await?;
        }

        let (present,): (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
            .bind(CLIENTS_TABLE)
            .fetch_one(&store.pool)
            .await
            .map_err(registry_error)?;
        store.clients_table_present = present;

        info!(
            "PostgreSQL ticket store ready (client linking {})",
            if present { "enabled" } else { "disabled" }
        );
        Ok(store)
    }

    /// Create tables, constraints and the ticket number sequence if missing
    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Registry(format!("Failed to create schema: {}", e)))?;
        }
        debug!("Ensured helpdesk schema exists");
        Ok(())
    }

    async fn fetch_ticket(&self, filter: &str, department_id: &str, value: i64) -> Result<Option<Ticket>> {
        let query = format!(
            "SELECT {} FROM helpdesk_tickets WHERE department_id = $1 AND {} = $2 LIMIT 1",
            TICKET_COLUMNS, filter
        );
        let row: Option<TicketRow> = sqlx::query_as(&query)
            .bind(department_id)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Ticket::try_from).transpose()
    }
}

#[async_trait]
impl DepartmentRegistry for PostgresStore {
    async fn eligible_departments(&self) -> Result<Vec<Department>> {
        let query = format!(
            "SELECT {} FROM helpdesk_departments WHERE active AND sync_enabled ORDER BY name",
            DEPARTMENT_COLUMNS
        );
        let rows: Vec<DepartmentRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(registry_error)?;

        Ok(rows
            .into_iter()
            .map(Department::from)
            .filter(Department::is_eligible)
            .collect())
    }

    async fn list_departments(&self) -> Result<Vec<Department>> {
        let query = format!("SELECT {} FROM helpdesk_departments ORDER BY name", DEPARTMENT_COLUMNS);
        let rows: Vec<DepartmentRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(registry_error)?;
        Ok(rows.into_iter().map(Department::from).collect())
    }

    async fn get_department(&self, id: &str) -> Result<Option<Department>> {
        let query = format!("SELECT {} FROM helpdesk_departments WHERE id = $1", DEPARTMENT_COLUMNS);
        let row: Option<DepartmentRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(registry_error)?;
        Ok(row.map(Department::from))
    }
}

#[async_trait]
impl TicketStore for PostgresStore {
    async fn find_ticket_by_department_and_uid(
        &self,
        department_id: &str,
        uid: u32,
    ) -> Result<Option<Ticket>> {
        self.fetch_ticket("mailbox_uid", department_id, i64::from(uid)).await
    }

    async fn is_processed(&self, department_id: &str, uid: u32) -> Result<bool> {
        let (processed,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (SELECT 1 FROM helpdesk_tickets WHERE department_id = $1 AND mailbox_uid = $2)
                OR EXISTS (SELECT 1 FROM helpdesk_ticket_messages WHERE department_id = $1 AND mailbox_uid = $2)
                OR EXISTS (SELECT 1 FROM helpdesk_skipped_messages WHERE department_id = $1 AND mailbox_uid = $2)
            "#,
        )
        .bind(department_id)
        .bind(i64::from(uid))
        .fetch_one(&self.pool)
        .await?;
        Ok(processed)
    }

    async fn find_ticket_by_message_id(
        &self,
        department_id: &str,
        message_id: &str,
    ) -> Result<Option<Ticket>> {
        let query = format!(
            r#"
            SELECT {} FROM helpdesk_tickets
            WHERE department_id = $1
              AND (message_id = $2 OR id IN (
                    SELECT ticket_id FROM helpdesk_ticket_messages
                    WHERE department_id = $1 AND message_id = $2))
            ORDER BY numero
            LIMIT 1
            "#,
            TICKET_COLUMNS
        );
        let row: Option<TicketRow> = sqlx::query_as(&query)
            .bind(department_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Ticket::try_from).transpose()
    }

    async fn find_ticket_by_number(&self, department_id: &str, number: i64) -> Result<Option<Ticket>> {
        self.fetch_ticket("numero", department_id, number).await
    }

    async fn find_open_tickets_by_requester(
        &self,
        department_id: &str,
        requester_email: &str,
    ) -> Result<Vec<Ticket>> {
        let query = format!(
            r#"
            SELECT {} FROM helpdesk_tickets
            WHERE department_id = $1
              AND lower(requester_email) = lower($2)
              AND status NOT IN ($3, $4)
            ORDER BY numero DESC
            LIMIT 50
            "#,
            TICKET_COLUMNS
        );
        let rows: Vec<TicketRow> = sqlx::query_as(&query)
            .bind(department_id)
            .bind(requester_email)
            .bind(TicketStatus::Resolved.as_str())
            .bind(TicketStatus::Closed.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Ticket::try_from).collect()
    }

    async fn find_client_by_email(&self, email: &str) -> Result<Option<String>> {
        if !self.clients_table_present {
            return Ok(None);
        }
        let query = format!(
            "SELECT id::text FROM {} WHERE lower(email) = lower($1) LIMIT 1",
            CLIENTS_TABLE
        );
        let row: Option<(String,)> = sqlx::query_as(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn create_ticket(&self, new: NewTicket) -> Result<Ticket> {
        let client_id = self.find_client_by_email(&new.requester_email).await?;
        let department_id = new.department_id.clone();
        let uid = new.mailbox_uid;
        // Sequence values are never rolled back; a rejected claim leaves a gap
        let number = self.next_ticket_number().await?;

        let mut tx = self.pool.begin().await?;

        let query = format!(
            r#"
            INSERT INTO helpdesk_tickets (
                id, numero, subject, description, status, priority, requester_name, requester_email,
                department_id, client_id, mailbox_uid, mailbox_identity, message_id, needs_review
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {}
            "#,
            TICKET_COLUMNS
        );
        let row: TicketRow = sqlx::query_as(&query)
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(number)
            .bind(&new.subject)
            .bind(&new.description)
            .bind(TicketStatus::Open.as_str())
            .bind(new.priority.as_str())
            .bind(&new.requester_name)
            .bind(&new.requester_email)
            .bind(&new.department_id)
            .bind(&client_id)
            .bind(i64::from(uid))
            .bind(&new.mailbox_identity)
            .bind(&new.message_id)
            .bind(new.needs_review)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| classify_insert_error(e, &department_id, uid))?;

        sqlx::query(
            r#"
            INSERT INTO helpdesk_ticket_messages (
                id, ticket_id, department_id, mailbox_uid, message_id, sender_name, sender_email, body
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&row.id)
        .bind(&new.department_id)
        .bind(i64::from(uid))
        .bind(&new.message_id)
        .bind(&new.requester_name)
        .bind(&new.requester_email)
        .bind(&new.description)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify_insert_error(e, &department_id, uid))?;

        tx.commit().await?;

        debug!("Stored ticket #{} for department {}, UID {}", row.numero, department_id, uid);
        Ticket::try_from(row)
    }

    async fn append_message(&self, new: NewTicketMessage) -> Result<TicketMessage> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            r#"
            INSERT INTO helpdesk_ticket_messages (
                id, ticket_id, department_id, mailbox_uid, message_id, sender_name, sender_email, body
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        );
        let row: MessageRow = sqlx::query_as(&query)
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&new.ticket_id)
            .bind(&new.department_id)
            .bind(i64::from(new.mailbox_uid))
            .bind(&new.message_id)
            .bind(&new.sender_name)
            .bind(&new.sender_email)
            .bind(&new.body)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| classify_insert_error(e, &new.department_id, new.mailbox_uid))?;

        sqlx::query("UPDATE helpdesk_tickets SET updated_at = NOW() WHERE id = $1")
            .bind(&new.ticket_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(TicketMessage::from(row))
    }

    async fn record_skipped(&self, department_id: &str, uid: u32, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO helpdesk_skipped_messages (department_id, mailbox_uid, reason)
            VALUES ($1, $2, $3)
            ON CONFLICT (department_id, mailbox_uid) DO NOTHING
            "#,
        )
        .bind(department_id)
        .bind(i64::from(uid))
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, department_id: &str, uid: u32, reason: &str) -> Result<u32> {
        let (attempts,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO helpdesk_failed_messages (department_id, mailbox_uid, last_error)
            VALUES ($1, $2, $3)
            ON CONFLICT (department_id, mailbox_uid) DO UPDATE
            SET attempts = helpdesk_failed_messages.attempts + 1,
                last_error = EXCLUDED.last_error,
                updated_at = NOW()
            RETURNING attempts
            "#,
        )
        .bind(department_id)
        .bind(i64::from(uid))
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(attempts).unwrap_or(0))
    }

    async fn oldest_unresolved_failure(&self, department_id: &str) -> Result<Option<u32>> {
        let (min,): (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MIN(f.mailbox_uid) FROM helpdesk_failed_messages f
            WHERE f.department_id = $1
              AND NOT EXISTS (SELECT 1 FROM helpdesk_tickets t
                              WHERE t.department_id = $1 AND t.mailbox_uid = f.mailbox_uid)
              AND NOT EXISTS (SELECT 1 FROM helpdesk_ticket_messages m
                              WHERE m.department_id = $1 AND m.mailbox_uid = f.mailbox_uid)
              AND NOT EXISTS (SELECT 1 FROM helpdesk_skipped_messages s
                              WHERE s.department_id = $1 AND s.mailbox_uid = f.mailbox_uid)
            "#,
        )
        .bind(department_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(min.and_then(|uid| u32::try_from(uid).ok()))
    }

    async fn last_processed_uid(&self, department_id: &str) -> Result<Option<u32>> {
        let (max,): (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MAX(uid) FROM (
                SELECT MAX(mailbox_uid) AS uid FROM helpdesk_tickets WHERE department_id = $1
                UNION ALL
                SELECT MAX(mailbox_uid) FROM helpdesk_ticket_messages WHERE department_id = $1
                UNION ALL
                SELECT MAX(mailbox_uid) FROM helpdesk_skipped_messages WHERE department_id = $1
            ) claims
            "#,
        )
        .bind(department_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.and_then(|uid| u32::try_from(uid).ok()))
    }

    async fn update_department_last_sync(&self, department_id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE helpdesk_departments SET last_sync = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(department_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::DepartmentNotFound(department_id.to_string()));
        }
        Ok(())
    }

    async fn next_ticket_number(&self) -> Result<i64> {
        let query = format!("SELECT nextval('{}')", TICKET_NUMBER_SEQUENCE);
        let (number,): (i64,) = sqlx::query_as(&query).fetch_one(&self.pool).await?;
        Ok(number)
    }
}
