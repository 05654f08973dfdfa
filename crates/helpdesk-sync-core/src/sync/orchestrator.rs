//! One department pass: mailbox UIDs in, tickets out

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AfterTicketAction, SyncConfig};
use crate::db::TicketStore;
use crate::error::{Error, ErrorScope, Result};
use crate::mailbox::{MailboxConnector, MailboxCredentials, MailboxSession, MessageFlag, UidRange};
use crate::models::{Department, InboundMessage, NewTicket, NewTicketMessage, Ticket, TicketMessage};
use crate::notify::{LogNotifier, TicketNotifier};
use crate::secrets::SecretDecryptor;

use super::parser::{detect_priority, normalize_subject, ticket_reference, InboundParser};
use super::{PassOutcome, PassSummary, SyncEvent};

/// Capacity of the sync event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Skip reasons recorded against a claimed UID
const SKIP_AUTO_REPLY: &str = "auto-reply";
const SKIP_DUPLICATE_MESSAGE_ID: &str = "duplicate message-id";

/// How the per-UID loop ended
enum FolderRun {
    Completed,
    Interrupted(String),
}

/// What happened to one UID
enum MessageOutcome {
    AlreadyProcessed,
    Created(Ticket),
    Appended(Ticket, TicketMessage),
    Skipped(&'static str),
    Duplicate,
}

/// Runs sync passes against a mailbox connector and a ticket store
pub struct SyncOrchestrator {
    connector: Arc<dyn MailboxConnector>,
    store: Arc<dyn TicketStore>,
    decryptor: Arc<dyn SecretDecryptor>,
    notifier: Arc<dyn TicketNotifier>,
    parser: InboundParser,
    settings: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        store: Arc<dyn TicketStore>,
        decryptor: Arc<dyn SecretDecryptor>,
        settings: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connector,
            store,
            decryptor,
            notifier: Arc::new(LogNotifier),
            parser: InboundParser::new(settings.max_description_chars),
            settings,
            events,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn TicketNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn settings(&self) -> &SyncConfig {
        &self.settings
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Run one pass for a department. Every failure is contained in the summary.
    pub async fn run_pass(&self, department: &Department, cancel: &CancellationToken) -> PassSummary {
        let mut summary = PassSummary::new(&department.id);
        self.emit(SyncEvent::PassStarted {
            department_id: department.id.clone(),
        });
        debug!("Starting pass for department {}", department);

        let outcome = self.sync_department(department, cancel, &mut summary).await;
        summary.finish(outcome);

        match &summary.outcome {
            PassOutcome::Completed => {
                if let Err(e) = self
                    .store
                    .update_department_last_sync(&department.id, Utc::now())
                    .await
                {
                    error!("Failed to record last sync for department {}: {}", department, e);
                }
                info!(
                    "Pass for department {} completed: {} listed, {} created, {} appended, {} already processed, {} skipped, {} failed ({}ms)",
                    department,
                    summary.listed,
                    summary.created,
                    summary.appended,
                    summary.already_processed,
                    summary.skipped,
                    summary.failed,
                    summary.elapsed_ms()
                );
                self.emit(SyncEvent::PassCompleted {
                    summary: summary.clone(),
                });
            }
            PassOutcome::Interrupted { reason } => {
                warn!(
                    "Pass for department {} interrupted after {} created, {} appended: {}",
                    department, summary.created, summary.appended, reason
                );
                self.emit(SyncEvent::PassCompleted {
                    summary: summary.clone(),
                });
            }
            PassOutcome::Aborted { code, error } => {
                error!("Pass for department {} aborted [{}]: {}", department, code, error);
                self.emit(SyncEvent::PassFailed {
                    department_id: department.id.clone(),
                    code: code.clone(),
                    error: error.clone(),
                });
            }
        }

        summary
    }

    async fn sync_department(
        &self,
        department: &Department,
        cancel: &CancellationToken,
        summary: &mut PassSummary,
    ) -> PassOutcome {
        let credentials = match MailboxCredentials::for_department(department, self.decryptor.as_ref()) {
            Ok(credentials) => credentials,
            Err(e) => return aborted(&e),
        };

        let mut session = match self.connect_with_retry(department, &credentials, cancel).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                return PassOutcome::Interrupted {
                    reason: "cancelled before connecting".to_string(),
                }
            }
            Err(e) => {
                if let Some(hint) = e.action_hint() {
                    warn!("Department {}: {}", department, hint);
                }
                return aborted(&e);
            }
        };

        let result = self
            .with_folder(session.as_mut(), department, cancel, summary)
            .await;

        if let Err(e) = session.logout().await {
            debug!("Logout failed for department {}: {}", department, e);
        }

        match result {
            Ok(FolderRun::Completed) => PassOutcome::Completed,
            Ok(FolderRun::Interrupted(reason)) => PassOutcome::Interrupted { reason },
            Err(e) => aborted(&e),
        }
    }

    /// Connect with exponential backoff. `Ok(None)` when cancelled.
    async fn connect_with_retry(
        &self,
        department: &Department,
        credentials: &MailboxCredentials,
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn MailboxSession>>> {
        let attempts = self.settings.connect_retries.saturating_add(1);
        let max_delay = Duration::from_millis(self.settings.retry_max_delay_ms);
        let mut delay = Duration::from_millis(self.settings.retry_initial_delay_ms).min(max_delay);
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                result = self.connector.connect(credentials) => result,
            };

            let error = match result {
                Ok(session) => return Ok(Some(session)),
                Err(e) => e,
            };

            if attempt >= attempts || !error.is_connection_loss() {
                return Err(error);
            }

            warn!(
                "Connect attempt {}/{} for department {} failed: {}; retrying in {:?}",
                attempt, attempts, department, error, delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(max_delay);
            attempt += 1;
        }
    }

    /// Select the inbox, run the UID loop, and always release the folder
    async fn with_folder(
        &self,
        session: &mut dyn MailboxSession,
        department: &Department,
        cancel: &CancellationToken,
        summary: &mut PassSummary,
    ) -> Result<FolderRun> {
        let folder = &self.settings.inbox_folder;
        let status = session.select_folder(folder).await?;
        debug!(
            "Department {}: {} has {} messages (uid_next {:?})",
            department, status.name, status.exists, status.uid_next
        );

        let result = self.process_folder(session, department, cancel, summary).await;

        if let Err(e) = session.unselect().await {
            debug!("Unselect failed for department {}: {}", department, e);
        }
        result
    }

    async fn process_folder(
        &self,
        session: &mut dyn MailboxSession,
        department: &Department,
        cancel: &CancellationToken,
        summary: &mut PassSummary,
    ) -> Result<FolderRun> {
        let claimed = self.store.last_processed_uid(&department.id).await?;
        let retry_from = self.store.oldest_unresolved_failure(&department.id).await?;
        let cursor = resume_cursor(claimed, retry_from);
        let range = match cursor {
            Some(uid) => UidRange::After(uid),
            None => UidRange::All,
        };

        let listed = session.list_uids(range).await?;
        let candidates = select_candidates(listed, range, &self.settings);
        summary.listed = candidates.len();
        if candidates.is_empty() {
            debug!("Department {}: nothing new after cursor {:?}", department, cursor);
            return Ok(FolderRun::Completed);
        }

        if let Some(uid) = retry_from {
            debug!("Department {}: retrying from failed UID {}", department, uid);
        }

        let identity = department.mailbox_identity(&self.settings.inbox_folder);
        let cap = match range {
            UidRange::After(_) if self.settings.max_messages_per_pass > 0 => {
                Some(self.settings.max_messages_per_pass)
            }
            _ => None,
        };
        let mut worked = 0;

        for uid in candidates {
            if cancel.is_cancelled() {
                return Ok(FolderRun::Interrupted("cancelled".to_string()));
            }
            if cap.is_some_and(|cap| worked >= cap) {
                debug!(
                    "Department {}: pass limit of {} reached before UID {}",
                    department, worked, uid
                );
                break;
            }

            match self.process_message(session, department, &identity, uid).await {
                Ok(outcome) => {
                    if !matches!(outcome, MessageOutcome::AlreadyProcessed) {
                        worked += 1;
                    }
                    self.record_outcome(session, department, uid, outcome, summary).await;
                }
                Err(e) if e.scope() == ErrorScope::Message => {
                    worked += 1;
                    warn!("Department {}: skipping UID {}: {}", department, uid, e);
                    summary.record_failure(uid, &e);
                    if let Err(store_error) = self.remember_failure(department, uid, &e).await {
                        return Ok(FolderRun::Interrupted(format!("UID {}: {}", uid, store_error)));
                    }
                }
                Err(e) => {
                    return Ok(FolderRun::Interrupted(format!("UID {}: {}", uid, e)));
                }
            }
        }

        Ok(FolderRun::Completed)
    }

    /// Persist a failed attempt so the next pass resumes at this UID; past the
    /// attempt limit the UID is claimed as skipped and the cursor moves on.
    async fn remember_failure(&self, department: &Department, uid: u32, failure: &Error) -> Result<()> {
        let attempts = self
            .store
            .record_failure(&department.id, uid, &failure.to_string())
            .await?;
        if attempts >= self.settings.max_message_attempts {
            error!(
                "Department {}: giving up on UID {} after {} attempts: {}",
                department, uid, attempts, failure
            );
            let reason = format!("gave up after {} attempts", attempts);
            self.store.record_skipped(&department.id, uid, &reason).await?;
        }
        Ok(())
    }

    async fn process_message(
        &self,
        session: &mut dyn MailboxSession,
        department: &Department,
        identity: &str,
        uid: u32,
    ) -> Result<MessageOutcome> {
        if self.store.is_processed(&department.id, uid).await? {
            return Ok(MessageOutcome::AlreadyProcessed);
        }

        let raw = session.fetch_body(uid).await?;
        let message = match self.parser.parse(uid, &raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Department {}: UID {} could not be parsed, creating placeholder: {}",
                    department, uid, e
                );
                self.parser.placeholder(uid, &e.to_string())
            }
        };

        if !message.parse_failed {
            if let Some(message_id) = message.message_id.as_deref() {
                if let Some(owner) = self.store.find_ticket_by_message_id(&department.id, message_id).await? {
                    if owner.mailbox_uid == Some(uid) {
                        return Ok(MessageOutcome::Duplicate);
                    }
                    debug!(
                        "Department {}: UID {} repeats Message-ID of ticket {}",
                        department, uid, owner.reference()
                    );
                    return self.skip(department, uid, SKIP_DUPLICATE_MESSAGE_ID).await;
                }
            }

            if self.settings.skip_auto_replies && message.is_auto_reply {
                return self.skip(department, uid, SKIP_AUTO_REPLY).await;
            }

            if self.settings.thread_replies {
                if let Some(ticket) = self.find_thread(department, &message).await? {
                    return self.append_reply(ticket, &message, department).await;
                }
            }
        }

        let new_ticket = NewTicket {
            department_id: department.id.clone(),
            subject: message.subject.clone(),
            description: message.body.clone(),
            priority: detect_priority(&message.subject, &message.body),
            requester_name: message.from.display_name(),
            requester_email: message.from.email.clone(),
            mailbox_uid: uid,
            mailbox_identity: identity.to_string(),
            message_id: message.message_id.clone(),
            needs_review: message.parse_failed,
        };

        match self.store.create_ticket(new_ticket).await {
            Ok(ticket) => Ok(MessageOutcome::Created(ticket)),
            Err(e) if e.is_duplicate() => {
                if let Some(winner) = self.store.find_ticket_by_department_and_uid(&department.id, uid).await? {
                    debug!(
                        "Department {}: UID {} already became ticket {}",
                        department, uid, winner.reference()
                    );
                }
                Ok(MessageOutcome::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    async fn skip(&self, department: &Department, uid: u32, reason: &'static str) -> Result<MessageOutcome> {
        self.store.record_skipped(&department.id, uid, reason).await?;
        Ok(MessageOutcome::Skipped(reason))
    }

    /// Open ticket this message answers: parent Message-IDs first, then a `[#N]`
    /// subject reference, then a reply-prefixed subject matching one of the
    /// sender's open tickets
    async fn find_thread(&self, department: &Department, message: &InboundMessage) -> Result<Option<Ticket>> {
        for parent in message.thread_parents() {
            if let Some(ticket) = self.store.find_ticket_by_message_id(&department.id, parent).await? {
                if !ticket.status.is_terminal() {
                    return Ok(Some(ticket));
                }
            }
        }

        if let Some(number) = ticket_reference(&message.subject) {
            if let Some(ticket) = self.store.find_ticket_by_number(&department.id, number).await? {
                if !ticket.status.is_terminal() {
                    return Ok(Some(ticket));
                }
            }
        }

        let topic = normalize_subject(&message.subject);
        if topic.is_empty() || topic == message.subject.trim() {
            return Ok(None);
        }
        let open = self
            .store
            .find_open_tickets_by_requester(&department.id, &message.from.email)
            .await?;
        Ok(open
            .into_iter()
            .find(|ticket| normalize_subject(&ticket.subject).eq_ignore_ascii_case(&topic)))
    }

    async fn append_reply(
        &self,
        ticket: Ticket,
        message: &InboundMessage,
        department: &Department,
    ) -> Result<MessageOutcome> {
        let reply = NewTicketMessage {
            ticket_id: ticket.id.clone(),
            department_id: department.id.clone(),
            mailbox_uid: message.uid,
            message_id: message.message_id.clone(),
            sender_name: message.from.display_name(),
            sender_email: message.from.email.clone(),
            body: message.body.clone(),
        };

        match self.store.append_message(reply).await {
            Ok(appended) => Ok(MessageOutcome::Appended(ticket, appended)),
            Err(e) if e.is_duplicate() => Ok(MessageOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }

    async fn record_outcome(
        &self,
        session: &mut dyn MailboxSession,
        department: &Department,
        uid: u32,
        outcome: MessageOutcome,
        summary: &mut PassSummary,
    ) {
        match outcome {
            MessageOutcome::AlreadyProcessed => summary.already_processed += 1,
            MessageOutcome::Duplicate => {
                debug!(
                    "Department {}: UID {} was claimed by a concurrent pass",
                    department, uid
                );
                summary.duplicates += 1;
            }
            MessageOutcome::Skipped(reason) => {
                debug!("Department {}: UID {} skipped ({})", department, uid, reason);
                summary.skipped += 1;
            }
            MessageOutcome::Created(ticket) => {
                summary.created += 1;
                if ticket.needs_review {
                    summary.placeholders += 1;
                }
                info!(
                    "Department {}: ticket {} created from UID {}",
                    department,
                    ticket.reference(),
                    uid
                );
                if !self.after_ticket(session, uid).await {
                    summary.flag_failures += 1;
                }
                self.emit(SyncEvent::TicketCreated {
                    department_id: department.id.clone(),
                    ticket_id: ticket.id.clone(),
                    number: ticket.number,
                    uid,
                });
                if let Err(e) = self.notifier.ticket_created(department, &ticket).await {
                    warn!("Notification for ticket {} failed: {}", ticket.reference(), e);
                }
            }
            MessageOutcome::Appended(ticket, message) => {
                summary.appended += 1;
                info!(
                    "Department {}: UID {} appended to ticket {}",
                    department,
                    uid,
                    ticket.reference()
                );
                if !self.after_ticket(session, uid).await {
                    summary.flag_failures += 1;
                }
                self.emit(SyncEvent::ReplyAppended {
                    department_id: department.id.clone(),
                    ticket_id: ticket.id.clone(),
                    number: ticket.number,
                    uid,
                });
                if let Err(e) = self.notifier.reply_appended(department, &ticket, &message).await {
                    warn!("Notification for ticket {} failed: {}", ticket.reference(), e);
                }
            }
        }
    }

    /// Best-effort mailbox action; false when the server refused it
    async fn after_ticket(&self, session: &mut dyn MailboxSession, uid: u32) -> bool {
        match self.settings.after_ticket {
            AfterTicketAction::Keep => true,
            AfterTicketAction::MarkSeen => {
                let ok = session.mutate_flags(uid, MessageFlag::Seen, true).await;
                if !ok {
                    warn!("Could not mark UID {} as seen", uid);
                }
                ok
            }
            AfterTicketAction::Move => {
                let folder = &self.settings.processed_folder;
                if session.move_message(uid, folder).await {
                    return true;
                }
                warn!("Could not move UID {} to {}, flagging as deleted", uid, folder);
                if !session.mutate_flags(uid, MessageFlag::Deleted, true).await {
                    warn!("Could not flag UID {} as deleted", uid);
                }
                false
            }
        }
    }
}

fn aborted(error: &Error) -> PassOutcome {
    PassOutcome::Aborted {
        code: error.code().to_string(),
        error: error.to_string(),
    }
}

/// Where listing resumes: the highest claim, held back below the oldest
/// failed UID that is still unclaimed.
fn resume_cursor(claimed: Option<u32>, retry_from: Option<u32>) -> Option<u32> {
    match (claimed, retry_from) {
        (Some(claimed), Some(failed)) => Some(claimed.min(failed.saturating_sub(1))),
        (claimed, _) => claimed,
    }
}

/// Ascending candidates for this pass. A first pass keeps the newest
/// `initial_backfill` UIDs (zero means unlimited). Later passes list everything
/// after the cursor and the per-UID loop enforces `max_messages_per_pass`.
fn select_candidates(mut uids: Vec<u32>, range: UidRange, settings: &SyncConfig) -> Vec<u32> {
    uids.retain(|uid| range.contains(*uid));
    uids.sort_unstable();
    uids.dedup();

    match range {
        UidRange::All if settings.initial_backfill > 0 && uids.len() > settings.initial_backfill => {
            uids.split_off(uids.len() - settings.initial_backfill)
        }
        _ => uids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::TicketPriority;
    use crate::secrets::PlaintextDecryptor;
    use crate::sync::parser::UNPARSEABLE_SUBJECT;
    use crate::sync::testing::{
        department, orchestrator, raw_auto_reply, raw_message, raw_reply, settings, ConnectFailure,
        FakeConnector, FakeMailbox,
    };
    use tokio::sync::Barrier;

    struct Fixture {
        connector: Arc<FakeConnector>,
        store: Arc<MemoryStore>,
        mailbox: Arc<FakeMailbox>,
        department: Department,
    }

    fn fixture(mailbox: Arc<FakeMailbox>) -> Fixture {
        let department = department("support");
        let connector = FakeConnector::new();
        connector.register("support@example.com", mailbox.clone());
        let store = Arc::new(MemoryStore::new());
        store.upsert_department(department.clone());
        Fixture {
            connector,
            store,
            mailbox,
            department,
        }
    }

    impl Fixture {
        fn orchestrator(&self) -> SyncOrchestrator {
            self.orchestrator_with(settings())
        }

        fn orchestrator_with(&self, settings: SyncConfig) -> SyncOrchestrator {
            orchestrator(self.connector.clone(), self.store.clone(), settings)
        }

        async fn run(&self) -> PassSummary {
            self.orchestrator()
                .run_pass(&self.department, &CancellationToken::new())
                .await
        }
    }

    fn messages(uids: &[u32]) -> Vec<(u32, Vec<u8>)> {
        uids.iter()
            .map(|uid| (*uid, raw_message(*uid, &format!("Issue {}", uid), "Something broke")))
            .collect()
    }

    #[test]
    fn test_select_candidates_backfill_keeps_newest() {
        let settings = SyncConfig {
            initial_backfill: 2,
            ..SyncConfig::default()
        };
        assert_eq!(select_candidates(vec![9, 3, 7, 5], UidRange::All, &settings), vec![7, 9]);
    }

    #[test]
    fn test_select_candidates_steady_state_lists_everything_after_cursor() {
        let settings = SyncConfig {
            max_messages_per_pass: 2,
            ..SyncConfig::default()
        };
        assert_eq!(
            select_candidates(vec![12, 11, 14, 10, 13], UidRange::After(10), &settings),
            vec![11, 12, 13, 14]
        );
    }

    #[test]
    fn test_resume_cursor_stays_below_unresolved_failure() {
        assert_eq!(resume_cursor(None, None), None);
        assert_eq!(resume_cursor(Some(103), None), Some(103));
        assert_eq!(resume_cursor(Some(103), Some(102)), Some(101));
        assert_eq!(resume_cursor(Some(103), Some(200)), Some(103));
        assert_eq!(resume_cursor(None, Some(102)), None);
        assert_eq!(resume_cursor(Some(5), Some(1)), Some(0));
    }

    #[test]
    fn test_select_candidates_zero_is_unlimited() {
        let settings = SyncConfig {
            initial_backfill: 0,
            max_messages_per_pass: 0,
            ..SyncConfig::default()
        };
        assert_eq!(select_candidates(vec![3, 1, 2], UidRange::All, &settings), vec![1, 2, 3]);
        assert_eq!(select_candidates(vec![3, 1, 2], UidRange::After(1), &settings), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_empty_mailbox_updates_last_sync() {
        let f = fixture(FakeMailbox::new());

        let summary = f.run().await;

        assert!(summary.is_completed());
        assert_eq!(summary.created, 0);
        assert_eq!(f.store.ticket_count(), 0);
        assert!(f.store.last_sync("support").is_some());
    }

    #[tokio::test]
    async fn test_new_messages_become_sequential_tickets() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101, 102, 103])));

        let summary = f.run().await;

        assert_eq!(summary.created, 3);
        let tickets = f.store.tickets("support");
        assert_eq!(tickets.len(), 3);
        let first = tickets[0].number;
        for (offset, ticket) in tickets.iter().enumerate() {
            assert_eq!(ticket.number, first + offset as i64);
            assert_eq!(ticket.mailbox_uid, Some(101 + offset as u32));
            assert_eq!(ticket.department_id, "support");
            assert_eq!(
                ticket.mailbox_identity.as_deref(),
                Some("imap.example.com/support@example.com/INBOX")
            );
        }
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101, 102, 103])));

        f.run().await;
        let before: Vec<String> = f.store.tickets("support").into_iter().map(|t| t.id).collect();
        let summary = f.run().await;
        let after: Vec<String> = f.store.tickets("support").into_iter().map(|t| t.id).collect();

        assert!(summary.is_completed());
        assert_eq!(summary.created, 0);
        assert_eq!(summary.listed, 0);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_only_unticketed_uid_is_created() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101])));
        f.run().await;
        let original = f.store.tickets("support")[0].clone();

        f.mailbox.deliver(102, raw_message(102, "Second issue", "Also broken"));
        let summary = f.run().await;

        assert_eq!(summary.created, 1);
        let tickets = f.store.tickets("support");
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].id, original.id);
        assert_eq!(tickets[0].updated_at, original.updated_at);
        assert_eq!(tickets[1].mailbox_uid, Some(102));
    }

    #[tokio::test]
    async fn test_claimed_uid_is_not_fetched_again() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101])));
        f.run().await;

        let credentials = MailboxCredentials::for_department(&f.department, &PlaintextDecryptor).unwrap();
        let mut session = f.connector.connect(&credentials).await.unwrap();
        let outcome = f
            .orchestrator()
            .process_message(session.as_mut(), &f.department, "INBOX", 101)
            .await
            .unwrap();
        session.logout().await.unwrap();

        assert!(matches!(outcome, MessageOutcome::AlreadyProcessed));
        assert_eq!(f.mailbox.fetched(), vec![101]);
    }

    #[tokio::test]
    async fn test_out_of_order_uids_processed_ascending() {
        let mailbox = FakeMailbox::with_messages(messages(&[3, 5, 8]));
        mailbox.list_in_order(vec![5, 3, 8]);
        let f = fixture(mailbox);

        f.run().await;

        assert_eq!(f.mailbox.fetched(), vec![3, 5, 8]);
        let tickets = f.store.tickets("support");
        let uids: Vec<Option<u32>> = tickets.iter().map(|t| t.mailbox_uid).collect();
        assert_eq!(uids, vec![Some(3), Some(5), Some(8)]);
        assert!(tickets.windows(2).all(|w| w[0].number < w[1].number));
    }

    #[tokio::test]
    async fn test_connect_timeout_aborts_without_last_sync() {
        let mailbox = FakeMailbox::with_messages(messages(&[101]));
        mailbox.fail_connect(ConnectFailure::Timeout);
        let f = fixture(mailbox);

        let summary = f.run().await;

        assert!(summary.is_aborted());
        assert_eq!(summary.error_code(), Some("TIMEOUT"));
        assert_eq!(f.store.ticket_count(), 0);
        assert!(f.store.last_sync("support").is_none());
    }

    #[tokio::test]
    async fn test_connect_is_retried_before_giving_up() {
        let mailbox = FakeMailbox::new();
        mailbox.fail_connect(ConnectFailure::Refused);
        let f = fixture(mailbox);
        let orchestrator = f.orchestrator_with(SyncConfig {
            connect_retries: 2,
            ..settings()
        });
        let mut events = orchestrator.subscribe();

        let summary = orchestrator
            .run_pass(&f.department, &CancellationToken::new())
            .await;

        assert_eq!(summary.error_code(), Some("CONNECTION_ERROR"));
        assert_eq!(f.mailbox.connect_attempts(), 3);
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::PassStarted { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::PassFailed { ref code, .. } if code == "CONNECTION_ERROR"
        ));
    }

    #[tokio::test]
    async fn test_bad_credentials_abort_before_connecting() {
        let f = fixture(FakeMailbox::new());
        let department = Department::new("support", "Support");

        let summary = f
            .orchestrator()
            .run_pass(&department, &CancellationToken::new())
            .await;

        assert_eq!(summary.error_code(), Some("CREDENTIALS_ERROR"));
        assert_eq!(f.mailbox.connects(), 0);
    }

    #[tokio::test]
    async fn test_select_failure_aborts_and_logs_out() {
        let mailbox = FakeMailbox::with_messages(messages(&[101]));
        mailbox.fail_select();
        let f = fixture(mailbox);

        let summary = f.run().await;

        assert_eq!(summary.error_code(), Some("IMAP_ERROR"));
        assert!(f.store.last_sync("support").is_none());
        assert_eq!(f.mailbox.logouts(), 1);
        assert_eq!(f.mailbox.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_message_becomes_placeholder() {
        let mut raw = messages(&[103]);
        raw.push((104, b"   \r\n".to_vec()));
        let f = fixture(FakeMailbox::with_messages(raw));

        let summary = f.run().await;

        assert!(summary.is_completed());
        assert_eq!(summary.created, 2);
        assert_eq!(summary.placeholders, 1);
        let placeholder = f
            .store
            .tickets("support")
            .into_iter()
            .find(|t| t.mailbox_uid == Some(104))
            .unwrap();
        assert!(placeholder.needs_review);
        assert_eq!(placeholder.subject, UNPARSEABLE_SUBJECT);
        assert!(placeholder.description.contains("104"));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_message_scoped() {
        let mailbox = FakeMailbox::with_messages(messages(&[101, 102, 103]));
        mailbox.fail_fetch(102);
        let f = fixture(mailbox);

        let summary = f.run().await;

        assert!(summary.is_completed());
        assert_eq!(summary.created, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].uid, 102);
        assert_eq!(summary.failures[0].code, "FETCH_ERROR");
        assert!(f.store.last_sync("support").is_some());
    }

    #[tokio::test]
    async fn test_failed_uid_is_retried_on_next_pass() {
        let mailbox = FakeMailbox::with_messages(messages(&[101, 102, 103]));
        mailbox.fail_fetch(102);
        let f = fixture(mailbox);

        let summary = f.run().await;
        assert_eq!(summary.created, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(f.store.failure("support", 102).map(|(n, _)| n), Some(1));

        f.mailbox.heal_fetch(102);
        let summary = f.run().await;

        assert!(summary.is_completed());
        assert_eq!(summary.created, 1);
        assert_eq!(summary.already_processed, 1);
        let retried = f
            .store
            .tickets("support")
            .into_iter()
            .find(|t| t.mailbox_uid == Some(102));
        assert!(retried.is_some());
        assert_eq!(f.mailbox.fetched(), vec![101, 102, 103, 102]);

        let summary = f.run().await;
        assert_eq!(summary.listed, 0);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_skipped_after_attempt_limit() {
        let mailbox = FakeMailbox::with_messages(messages(&[101, 102, 103]));
        mailbox.fail_fetch(102);
        let f = fixture(mailbox);
        let orchestrator = f.orchestrator_with(SyncConfig {
            max_message_attempts: 2,
            ..settings()
        });
        let cancel = CancellationToken::new();

        orchestrator.run_pass(&f.department, &cancel).await;
        assert!(f.store.skip_reason("support", 102).is_none());

        let summary = orchestrator.run_pass(&f.department, &cancel).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(
            f.store.skip_reason("support", 102).as_deref(),
            Some("gave up after 2 attempts")
        );

        let summary = orchestrator.run_pass(&f.department, &cancel).await;
        assert_eq!(summary.listed, 0);
        assert_eq!(f.store.ticket_count(), 2);
    }

    #[tokio::test]
    async fn test_claimed_uids_do_not_count_toward_pass_limit() {
        let mailbox = FakeMailbox::with_messages(messages(&[101, 102, 103, 104]));
        mailbox.fail_fetch(101);
        let f = fixture(mailbox);
        let orchestrator = f.orchestrator_with(SyncConfig {
            max_messages_per_pass: 2,
            ..settings()
        });
        let cancel = CancellationToken::new();

        orchestrator.run_pass(&f.department, &cancel).await;
        assert_eq!(f.store.ticket_count(), 3);

        f.mailbox.heal_fetch(101);
        for uid in [105, 106, 107] {
            f.mailbox.deliver(uid, raw_message(uid, &format!("Issue {}", uid), "Broken"));
        }
        let summary = orchestrator.run_pass(&f.department, &cancel).await;

        assert_eq!(summary.created, 2);
        assert_eq!(summary.already_processed, 3);
        let uids: Vec<Option<u32>> = f.store.tickets("support").iter().map(|t| t.mailbox_uid).collect();
        assert!(uids.contains(&Some(101)));
        assert!(uids.contains(&Some(105)));
        assert!(!uids.contains(&Some(106)));

        let summary = orchestrator.run_pass(&f.department, &cancel).await;
        assert_eq!(summary.created, 2);
        assert_eq!(summary.already_processed, 0);
    }

    #[tokio::test]
    async fn test_rejected_login_is_not_retried() {
        let mailbox = FakeMailbox::new();
        mailbox.fail_connect(ConnectFailure::Rejected);
        let f = fixture(mailbox);
        let orchestrator = f.orchestrator_with(SyncConfig {
            connect_retries: 2,
            ..settings()
        });

        let summary = orchestrator
            .run_pass(&f.department, &CancellationToken::new())
            .await;

        assert_eq!(summary.error_code(), Some("CONNECTION_ERROR"));
        assert_eq!(f.mailbox.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_mid_pass_keeps_committed_tickets() {
        let mailbox = FakeMailbox::with_messages(messages(&[101, 102, 103]));
        mailbox.disconnect_at(102);
        let f = fixture(mailbox);

        let summary = f.run().await;

        assert!(matches!(summary.outcome, PassOutcome::Interrupted { .. }));
        assert_eq!(summary.created, 1);
        assert_eq!(f.store.tickets("support")[0].mailbox_uid, Some(101));
        assert!(f.store.last_sync("support").is_none());
        assert_eq!(f.mailbox.unselects(), 1);
        assert_eq!(f.mailbox.logouts(), 1);
    }

    #[tokio::test]
    async fn test_folder_released_on_every_pass() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101])));

        f.run().await;
        f.run().await;

        assert_eq!(f.mailbox.unselects(), 2);
        assert_eq!(f.mailbox.logouts(), 2);
        assert_eq!(f.mailbox.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_marks_ticketed_messages_seen() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101])));

        f.run().await;

        assert_eq!(f.mailbox.flags(), vec![(101, MessageFlag::Seen, true)]);
    }

    #[tokio::test]
    async fn test_flag_failure_is_not_fatal() {
        let mailbox = FakeMailbox::with_messages(messages(&[101, 102]));
        mailbox.fail_flags();
        let f = fixture(mailbox);

        let summary = f.run().await;

        assert!(summary.is_completed());
        assert_eq!(summary.created, 2);
        assert_eq!(summary.flag_failures, 2);
    }

    #[tokio::test]
    async fn test_move_falls_back_to_deleted_flag() {
        let mailbox = FakeMailbox::with_messages(messages(&[101]));
        mailbox.fail_moves();
        let f = fixture(mailbox);
        let orchestrator = f.orchestrator_with(SyncConfig {
            after_ticket: AfterTicketAction::Move,
            ..settings()
        });

        let summary = orchestrator
            .run_pass(&f.department, &CancellationToken::new())
            .await;

        assert_eq!(summary.created, 1);
        assert_eq!(summary.flag_failures, 1);
        assert_eq!(f.mailbox.flags(), vec![(101, MessageFlag::Deleted, true)]);
    }

    #[tokio::test]
    async fn test_move_to_processed_folder() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101])));
        let orchestrator = f.orchestrator_with(SyncConfig {
            after_ticket: AfterTicketAction::Move,
            ..settings()
        });

        orchestrator
            .run_pass(&f.department, &CancellationToken::new())
            .await;

        assert_eq!(f.mailbox.moved(), vec![(101, "Processed".to_string())]);
    }

    #[tokio::test]
    async fn test_reply_is_threaded_onto_ticket() {
        let f = fixture(FakeMailbox::with_messages(vec![
            (101, raw_message(101, "VPN down", "Cannot connect")),
            (102, raw_reply(102, 101, "Re: VPN down", "Still down")),
        ]));

        let summary = f.run().await;

        assert_eq!(summary.created, 1);
        assert_eq!(summary.appended, 1);
        let ticket = &f.store.tickets("support")[0];
        let thread = f.store.messages(&ticket.id);
        assert_eq!(thread.len(), 2);
        assert!(thread.iter().any(|m| m.mailbox_uid == Some(102) && m.body == "Still down"));
    }

    #[tokio::test]
    async fn test_subject_reference_threads_reply() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101])));
        f.run().await;
        let ticket = f.store.tickets("support")[0].clone();

        f.mailbox.deliver(
            102,
            raw_message(102, &format!("Re: {} Issue 101", ticket.reference()), "Any news?"),
        );
        let summary = f.run().await;

        assert_eq!(summary.appended, 1);
        assert_eq!(f.store.ticket_count(), 1);
    }

    #[tokio::test]
    async fn test_reply_prefixed_subject_threads_onto_open_ticket() {
        let f = fixture(FakeMailbox::with_messages(vec![(
            101,
            raw_message(101, "Printer jammed", "Tray 2"),
        )]));
        f.run().await;

        // Client mail without In-Reply-To or a ticket reference
        f.mailbox.deliver(102, raw_message(102, "RE: Fwd: printer jammed", "Still jammed"));
        f.mailbox.deliver(103, raw_message(103, "Printer jammed", "Other floor"));
        let summary = f.run().await;

        assert_eq!(summary.appended, 1);
        assert_eq!(summary.created, 1);
        let tickets = f.store.tickets("support");
        let thread = f.store.messages(&tickets[0].id);
        assert!(thread.iter().any(|m| m.mailbox_uid == Some(102)));
        assert_eq!(tickets[1].mailbox_uid, Some(103));
    }

    #[tokio::test]
    async fn test_threading_disabled_opens_new_ticket() {
        let f = fixture(FakeMailbox::with_messages(vec![
            (101, raw_message(101, "VPN down", "Cannot connect")),
            (102, raw_reply(102, 101, "Re: VPN down", "Still down")),
        ]));
        let orchestrator = f.orchestrator_with(SyncConfig {
            thread_replies: false,
            ..settings()
        });

        let summary = orchestrator
            .run_pass(&f.department, &CancellationToken::new())
            .await;

        assert_eq!(summary.created, 2);
        assert_eq!(summary.appended, 0);
    }

    #[tokio::test]
    async fn test_auto_reply_is_skipped_and_claimed() {
        let f = fixture(FakeMailbox::with_messages(vec![(101, raw_auto_reply(101))]));

        let summary = f.run().await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(f.store.ticket_count(), 0);
        assert_eq!(f.store.skip_reason("support", 101).as_deref(), Some("auto-reply"));

        let summary = f.run().await;
        assert_eq!(summary.listed, 0);
    }

    #[tokio::test]
    async fn test_redelivered_message_id_is_skipped() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101])));
        f.run().await;

        // Same message copied back into the inbox under a new UID
        f.mailbox.deliver(102, raw_message(101, "Issue 101", "Something broke"));
        let summary = f.run().await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(f.store.ticket_count(), 1);
        assert_eq!(
            f.store.skip_reason("support", 102).as_deref(),
            Some("duplicate message-id")
        );
    }

    #[tokio::test]
    async fn test_priority_detected_from_subject() {
        let f = fixture(FakeMailbox::with_messages(vec![(
            101,
            raw_message(101, "URGENT: payroll server down", "Nobody can log in"),
        )]));

        f.run().await;

        assert_eq!(f.store.tickets("support")[0].priority, TicketPriority::Urgent);
    }

    #[tokio::test]
    async fn test_cancelled_pass_does_not_connect() {
        let f = fixture(FakeMailbox::with_messages(messages(&[101])));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = f.orchestrator().run_pass(&f.department, &cancel).await;

        assert!(matches!(summary.outcome, PassOutcome::Interrupted { .. }));
        assert_eq!(f.mailbox.connects(), 0);
        assert!(f.store.last_sync("support").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_passes_create_one_ticket() {
        let mailbox = FakeMailbox::with_messages(messages(&[101]));
        mailbox.gate_fetch(Arc::new(Barrier::new(2)));
        let f = fixture(mailbox);
        let first = f.orchestrator();
        let second = f.orchestrator();
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            first.run_pass(&f.department, &cancel),
            second.run_pass(&f.department, &cancel)
        );

        assert_eq!(f.store.ticket_count(), 1);
        assert_eq!(a.created + b.created, 1);
        assert_eq!(a.duplicates + b.duplicates, 1);
        assert!(f.store.failure("support", 101).is_none());
    }
}
