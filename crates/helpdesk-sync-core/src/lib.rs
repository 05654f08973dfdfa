//! Helpdesk Sync Core Library
//!
//! Turns department mailboxes into helpdesk tickets: IMAP polling, message
//! parsing, deduplicated ticket creation in PostgreSQL, and the scheduler that
//! runs it all per department.

pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod mailbox;
pub mod models;
pub mod notify;
pub mod secrets;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
pub use models::*;

/// Application name for config paths
pub const APP_NAME: &str = "helpdesk-sync";
