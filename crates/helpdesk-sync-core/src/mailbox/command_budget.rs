//! IMAP command pacing: a worker-wide quota plus an optional quota per server
//!
//! Departments hosted on the same provider (`imap.gmail.com`, one Exchange
//! front end) draw from that host's quota together.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::trace;

const DEFAULT_COMMANDS_PER_SECOND: NonZeroU32 = match NonZeroU32::new(10) {
    Some(n) => n,
    None => unreachable!(),
};

type WorkerLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type HostLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// IMAP commands the adapter paces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapCommand {
    Connect,
    Login,
    Select,
    List,
    Create,
    Search,
    Fetch,
    Store,
    Move,
}

impl ImapCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Login => "LOGIN",
            Self::Select => "SELECT",
            Self::List => "LIST",
            Self::Create => "CREATE",
            Self::Search => "UID SEARCH",
            Self::Fetch => "UID FETCH",
            Self::Store => "UID STORE",
            Self::Move => "UID MOVE",
        }
    }
}

impl fmt::Display for ImapCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared by every session the connector opens
#[derive(Clone)]
pub struct CommandBudget {
    worker: Arc<WorkerLimiter>,
    per_host: Option<Arc<HostLimiter>>,
}

impl CommandBudget {
    /// `per_worker` of zero falls back to the default; `per_host` of zero disables the host quota
    pub fn new(per_worker: u32, per_host: u32) -> Self {
        let worker = Quota::per_second(NonZeroU32::new(per_worker).unwrap_or(DEFAULT_COMMANDS_PER_SECOND));
        Self {
            worker: Arc::new(RateLimiter::direct(worker)),
            per_host: NonZeroU32::new(per_host)
                .map(|n| Arc::new(RateLimiter::keyed(Quota::per_second(n)))),
        }
    }

    /// Wait for the host quota, then the worker quota
    pub async fn acquire(&self, host: &str, command: ImapCommand) {
        if let Some(per_host) = &self.per_host {
            per_host.until_key_ready(&host.to_ascii_lowercase()).await;
        }
        self.worker.until_ready().await;
        trace!("{} to {} allowed", command, host);
    }

    /// Take a slot without waiting; false when either quota is spent
    pub fn try_acquire(&self, host: &str) -> bool {
        if let Some(per_host) = &self.per_host {
            if per_host.check_key(&host.to_ascii_lowercase()).is_err() {
                return false;
            }
        }
        self.worker.check().is_ok()
    }
}

impl Default for CommandBudget {
    fn default() -> Self {
        Self::new(DEFAULT_COMMANDS_PER_SECOND.get(), 0)
    }
}
