//! PostgreSQL schema bootstrap

/// Sequence backing `helpdesk_tickets.numero`
pub const TICKET_NUMBER_SEQUENCE: &str = "helpdesk_ticket_numero_seq";

/// Name of the unique constraint guarding one ticket per mailbox UID
pub const TICKET_UID_CONSTRAINT: &str = "helpdesk_tickets_department_uid_key";

/// Name of the unique constraint guarding one thread entry per mailbox UID
pub const MESSAGE_UID_CONSTRAINT: &str = "helpdesk_ticket_messages_department_uid_key";

/// Statements run in order when `database.ensure_schema` is set; all idempotent
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE SEQUENCE IF NOT EXISTS helpdesk_ticket_numero_seq",
    r#"
    CREATE TABLE IF NOT EXISTS helpdesk_departments (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        sync_enabled BOOLEAN NOT NULL DEFAULT FALSE,
        imap_host TEXT,
        imap_port INTEGER NOT NULL DEFAULT 993,
        imap_secure BOOLEAN NOT NULL DEFAULT TRUE,
        imap_email TEXT,
        imap_password_encrypted TEXT,
        sync_interval_seconds BIGINT NOT NULL DEFAULT 300,
        last_sync TIMESTAMPTZ,
        group_id TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS helpdesk_tickets (
        id TEXT PRIMARY KEY,
        numero BIGINT NOT NULL UNIQUE DEFAULT nextval('helpdesk_ticket_numero_seq'),
        subject TEXT NOT NULL,
        description TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'OPEN',
        priority TEXT NOT NULL DEFAULT 'MEDIUM',
        requester_name TEXT NOT NULL,
        requester_email TEXT NOT NULL,
        department_id TEXT NOT NULL REFERENCES helpdesk_departments(id),
        client_id TEXT,
        mailbox_uid BIGINT,
        mailbox_identity TEXT,
        message_id TEXT,
        needs_review BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT helpdesk_tickets_department_uid_key UNIQUE (department_id, mailbox_uid)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS helpdesk_tickets_message_id_idx ON helpdesk_tickets (department_id, message_id)",
    r#"
    CREATE TABLE IF NOT EXISTS helpdesk_ticket_messages (
        id TEXT PRIMARY KEY,
        ticket_id TEXT NOT NULL REFERENCES helpdesk_tickets(id) ON DELETE CASCADE,
        department_id TEXT NOT NULL,
        mailbox_uid BIGINT,
        message_id TEXT,
        sender_name TEXT NOT NULL,
        sender_email TEXT NOT NULL,
        body TEXT NOT NULL,
        internal BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT helpdesk_ticket_messages_department_uid_key UNIQUE (department_id, mailbox_uid)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS helpdesk_ticket_messages_message_id_idx ON helpdesk_ticket_messages (department_id, message_id)",
    r#"
    CREATE TABLE IF NOT EXISTS helpdesk_skipped_messages (
        department_id TEXT NOT NULL,
        mailbox_uid BIGINT NOT NULL,
        reason TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (department_id, mailbox_uid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS helpdesk_failed_messages (
        department_id TEXT NOT NULL,
        mailbox_uid BIGINT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 1,
        last_error TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (department_id, mailbox_uid)
    )
    "#,
];
