//! Data models for the helpdesk sync engine
//!
//! Departments (mailbox owners), tickets with their thread entries,
//! and the transient inbound message produced by one fetch.

mod department;
mod message;
mod ticket;

pub use department::*;
pub use message::*;
pub use ticket::*;
