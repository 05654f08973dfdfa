//! Mailbox-to-ticket sync engine
//!
//! [`SyncOrchestrator`] runs one pass for one department; [`Scheduler`] fans a
//! shared timer out to every eligible department while keeping each
//! department's passes strictly serialized.

mod orchestrator;
pub mod parser;
mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use orchestrator::SyncOrchestrator;
pub use scheduler::{Scheduler, WorkerState, WorkerStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Sync event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A department pass began
    PassStarted { department_id: String },
    /// A message became a new ticket
    TicketCreated {
        department_id: String,
        ticket_id: String,
        number: i64,
        uid: u32,
    },
    /// A message was threaded onto an existing ticket
    ReplyAppended {
        department_id: String,
        ticket_id: String,
        number: i64,
        uid: u32,
    },
    /// A pass reached the end of its folder, or was interrupted after connecting
    PassCompleted { summary: PassSummary },
    /// A pass never got to enumerate the folder
    PassFailed {
        department_id: String,
        code: String,
        error: String,
    },
    /// A tick found the department still running its previous pass
    TickSkipped { department_id: String },
}

impl SyncEvent {
    pub fn department_id(&self) -> &str {
        match self {
            SyncEvent::PassStarted { department_id }
            | SyncEvent::TicketCreated { department_id, .. }
            | SyncEvent::ReplyAppended { department_id, .. }
            | SyncEvent::PassFailed { department_id, .. }
            | SyncEvent::TickSkipped { department_id } => department_id,
            SyncEvent::PassCompleted { summary } => &summary.department_id,
        }
    }
}

/// How a pass ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PassOutcome {
    /// Every candidate UID was visited; `last_sync` advanced
    Completed,
    /// Credentials, connect or select failed; nothing was touched
    Aborted { code: String, error: String },
    /// Stopped early (disconnect, store failure or cancellation); committed tickets stay
    Interrupted { reason: String },
}

/// A message that could not be handled this pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFailure {
    pub uid: u32,
    pub code: String,
    pub reason: String,
}

/// Result of one department pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub department_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Candidate UIDs after cursor and cap were applied
    pub listed: usize,
    /// New tickets, placeholders included
    pub created: usize,
    /// Replies threaded onto existing tickets
    pub appended: usize,
    pub already_processed: usize,
    /// Lost a race to another pass for the same UID
    pub duplicates: usize,
    /// Tickets created from unparseable messages
    pub placeholders: usize,
    /// Auto-replies and re-delivered Message-IDs
    pub skipped: usize,
    pub failed: usize,
    pub flag_failures: usize,

    #[serde(default)]
    pub failures: Vec<MessageFailure>,

    pub outcome: PassOutcome,
}

impl PassSummary {
    pub fn new(department_id: impl Into<String>) -> Self {
        Self {
            department_id: department_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            listed: 0,
            created: 0,
            appended: 0,
            already_processed: 0,
            duplicates: 0,
            placeholders: 0,
            skipped: 0,
            failed: 0,
            flag_failures: 0,
            failures: Vec::new(),
            outcome: PassOutcome::Completed,
        }
    }

    pub(crate) fn record_failure(&mut self, uid: u32, error: &Error) {
        self.failed += 1;
        self.failures.push(MessageFailure {
            uid,
            code: error.code().to_string(),
            reason: error.to_string(),
        });
    }

    pub(crate) fn finish(&mut self, outcome: PassOutcome) {
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == PassOutcome::Completed
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, PassOutcome::Aborted { .. })
    }

    /// Error code of an aborted pass
    pub fn error_code(&self) -> Option<&str> {
        match &self.outcome {
            PassOutcome::Aborted { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.finished_at
            .map(|finished| (finished - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_records_failures() {
        let mut summary = PassSummary::new("support");
        summary.record_failure(7, &Error::fetch(7, "message no longer exists"));
        summary.finish(PassOutcome::Completed);

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].code, "FETCH_ERROR");
        assert!(summary.is_completed());
        assert!(summary.finished_at.is_some());
    }

    #[test]
    fn test_aborted_exposes_code() {
        let mut summary = PassSummary::new("support");
        let error = Error::timeout("connect", 20);
        summary.finish(PassOutcome::Aborted {
            code: error.code().to_string(),
            error: error.to_string(),
        });
        assert!(summary.is_aborted());
        assert_eq!(summary.error_code(), Some("TIMEOUT"));
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = SyncEvent::TickSkipped {
            department_id: "billing".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "tick_skipped");
        assert_eq!(event.department_id(), "billing");
    }
}
