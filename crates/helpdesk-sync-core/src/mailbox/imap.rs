//! IMAP implementation of the mailbox adapter (password login, TLS or plain TCP)

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::{Client, Session};
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info, warn};

use crate::config::TimeoutConfig;
use crate::error::{Error, Result};

use super::{
    CommandBudget, FolderStatus, ImapCommand, MailboxConnector, MailboxCredentials,
    MailboxSession, MessageFlag, UidRange,
};

/// Run `fut` under a time budget, reporting overruns as `Timeout`
async fn bounded<T>(operation: &str, limit: Duration, fut: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::timeout(operation, limit.as_secs()))
}

/// Opens password-authenticated IMAP sessions
pub struct ImapConnector {
    timeouts: TimeoutConfig,
    budget: Arc<CommandBudget>,
}

impl ImapConnector {
    pub fn new(timeouts: TimeoutConfig, budget: Arc<CommandBudget>) -> Self {
        Self { timeouts, budget }
    }

    /// Read the server greeting and log in
    async fn authenticate<T>(
        &self,
        mut client: Client<T>,
        credentials: &MailboxCredentials,
    ) -> Result<Session<T>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
    {
        let host = &credentials.host;

        // The greeting must be consumed before the first command (see async-imap #84)
        debug!("  Reading server greeting from {}...", host);
        match bounded("greeting", self.timeouts.greeting(), client.read_response()).await? {
            Some(Ok(_greeting)) => debug!("  Server greeting received"),
            Some(Err(e)) => {
                return Err(Error::connection(host, format!("failed to read greeting: {:?}", e)));
            }
            None => {
                return Err(Error::connection(host, "connection closed before greeting"));
            }
        }

        self.budget.acquire(host, ImapCommand::Login).await;
        debug!("  Logging in as {}...", credentials.username);
        let session = bounded(
            "login",
            self.timeouts.greeting(),
            client.login(&credentials.username, &credentials.password),
        )
        .await?
        .map_err(|(e, _)| match e {
            async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost => {
                Error::connection(host, format!("connection lost during login: {:?}", e))
            }
            other => Error::AuthenticationFailed {
                host: host.to_string(),
                username: credentials.username.clone(),
                reason: format!("{:?}", other),
            },
        })?;

        Ok(session)
    }

    fn wrap<T>(&self, session: Session<T>, credentials: &MailboxCredentials) -> Box<dyn MailboxSession>
    where
        T: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
    {
        Box::new(ImapMailbox {
            session,
            host: credentials.host.clone(),
            socket_timeout: self.timeouts.socket(),
            budget: Arc::clone(&self.budget),
            selected: None,
        })
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self, credentials: &MailboxCredentials) -> Result<Box<dyn MailboxSession>> {
        let host = credentials.host.as_str();
        self.budget.acquire(host, ImapCommand::Connect).await;

        info!(
            "Connecting to IMAP {}:{} as {} ({})",
            host,
            credentials.port,
            credentials.username,
            if credentials.secure { "tls" } else { "plain" }
        );

        let tcp = bounded(
            "connect",
            self.timeouts.connect(),
            TcpStream::connect((host, credentials.port)),
        )
        .await?
        .map_err(|e| Error::connection(host, e))?;

        // Wrap TCP stream with compat layer for futures AsyncRead/Write
        let tcp_compat = tcp.compat();

        if credentials.secure {
            let tls = TlsConnector::new();
            let tls_stream = bounded("TLS handshake", self.timeouts.connect(), tls.connect(host, tcp_compat))
                .await?
                .map_err(|e| Error::connection(host, e))?;
            let session = self.authenticate(Client::new(tls_stream), credentials).await?;
            info!("Connected to IMAP {} as {}", host, credentials.username);
            Ok(self.wrap(session, credentials))
        } else {
            let session = self.authenticate(Client::new(tcp_compat), credentials).await?;
            info!("Connected to IMAP {} as {} (plain)", host, credentials.username);
            Ok(self.wrap(session, credentials))
        }
    }
}

/// A logged-in session over any transport
struct ImapMailbox<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    session: Session<T>,
    host: String,
    socket_timeout: Duration,
    budget: Arc<CommandBudget>,
    selected: Option<String>,
}

impl<T> ImapMailbox<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
{
    /// Dropped sockets surface as connection failures, everything else as protocol errors
    fn session_error(&self, operation: &str, e: async_imap::error::Error) -> Error {
        match e {
            async_imap::error::Error::Io(io) => Error::connection(&self.host, format!("{} failed: {}", operation, io)),
            async_imap::error::Error::ConnectionLost => {
                Error::connection(&self.host, format!("connection lost during {}", operation))
            }
            other => Error::Imap(format!("{} failed: {:?}", operation, other)),
        }
    }

    async fn ensure_folder(&mut self, folder: &str) -> Result<()> {
        let folders = self.list_folders().await?;
        if folders.iter().any(|f| f == folder) {
            return Ok(());
        }

        self.budget.acquire(&self.host, ImapCommand::Create).await;
        let limit = self.socket_timeout;
        bounded("create", limit, self.session.create(folder))
            .await?
            .map_err(|e| self.session_error("create", e))?;
        info!("Created folder {} on {}", folder, self.host);
        Ok(())
    }
}

#[async_trait]
impl<T> MailboxSession for ImapMailbox<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
{
    async fn select_folder(&mut self, name: &str) -> Result<FolderStatus> {
        self.budget.acquire(&self.host, ImapCommand::Select).await;
        let limit = self.socket_timeout;
        let mailbox = bounded("select", limit, self.session.select(name))
            .await?
            .map_err(|e| self.session_error("select", e))?;

        self.selected = Some(name.to_string());
        debug!(
            "Selected {} on {}: {} messages, uid_next {:?}",
            name, self.host, mailbox.exists, mailbox.uid_next
        );

        Ok(FolderStatus {
            name: name.to_string(),
            exists: mailbox.exists,
            unseen: mailbox.unseen,
            uid_next: mailbox.uid_next,
            uid_validity: mailbox.uid_validity,
        })
    }

    async fn list_folders(&mut self) -> Result<Vec<String>> {
        self.budget.acquire(&self.host, ImapCommand::List).await;
        let limit = self.socket_timeout;
        let names = bounded("list", limit, async {
            let stream = self.session.list(Some(""), Some("*")).await?;
            Ok::<_, async_imap::error::Error>(stream.collect::<Vec<_>>().await)
        })
        .await?
        .map_err(|e| self.session_error("list", e))?;

        let mut folders = Vec::new();
        for name in names {
            match name {
                Ok(name) => folders.push(name.name().to_string()),
                Err(e) => warn!("Error in LIST response from {}: {:?}", self.host, e),
            }
        }
        Ok(folders)
    }

    async fn list_uids(&mut self, range: UidRange) -> Result<Vec<u32>> {
        let query = match range {
            UidRange::All => "ALL".to_string(),
            UidRange::After(_) => format!("UID {}", range.to_imap_set()),
        };

        self.budget.acquire(&self.host, ImapCommand::Search).await;
        let limit = self.socket_timeout;
        let found = bounded("search", limit, self.session.uid_search(&query))
            .await?
            .map_err(|e| self.session_error("search", e))?;

        let mut uids: Vec<u32> = found.into_iter().filter(|uid| range.contains(*uid)).collect();
        uids.sort_unstable();
        debug!("UID SEARCH {} on {} matched {} messages", query, self.host, uids.len());
        Ok(uids)
    }

    async fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>> {
        self.budget.acquire(&self.host, ImapCommand::Fetch).await;
        let limit = self.socket_timeout;
        let fetches = bounded("fetch", limit, async {
            let stream = self.session.uid_fetch(uid.to_string(), "(UID BODY.PEEK[])").await?;
            Ok::<_, async_imap::error::Error>(stream.collect::<Vec<_>>().await)
        })
        .await?
        .map_err(|e| match e {
            async_imap::error::Error::No(reason) | async_imap::error::Error::Bad(reason) => {
                Error::fetch(uid, reason)
            }
            other => self.session_error("fetch", other),
        })?;

        for fetch in fetches {
            match fetch {
                Ok(fetch) if fetch.uid == Some(uid) => {
                    if let Some(body) = fetch.body() {
                        return Ok(body.to_vec());
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(Error::fetch(uid, format!("{:?}", e))),
            }
        }

        Err(Error::fetch(uid, "message no longer exists"))
    }

    async fn mutate_flags(&mut self, uid: u32, flag: MessageFlag, on: bool) -> bool {
        let query = format!("{}FLAGS ({})", if on { "+" } else { "-" }, flag.as_imap());

        self.budget.acquire(&self.host, ImapCommand::Store).await;
        let limit = self.socket_timeout;
        let result = bounded("store", limit, async {
            let stream = self.session.uid_store(uid.to_string(), &query).await?;
            Ok::<_, async_imap::error::Error>(stream.collect::<Vec<_>>().await)
        })
        .await;

        match result {
            Ok(Ok(responses)) => {
                let mut ok = true;
                for response in responses {
                    if let Err(e) = response {
                        debug!("Error in STORE response for UID {}: {:?}", uid, e);
                        ok = false;
                    }
                }
                ok
            }
            Ok(Err(e)) => {
                debug!("STORE {} on UID {} failed: {:?}", query, uid, e);
                false
            }
            Err(e) => {
                debug!("STORE {} on UID {} failed: {}", query, uid, e);
                false
            }
        }
    }

    async fn move_message(&mut self, uid: u32, folder: &str) -> bool {
        if let Err(e) = self.ensure_folder(folder).await {
            debug!("Cannot prepare folder {} on {}: {}", folder, self.host, e);
            return false;
        }

        self.budget.acquire(&self.host, ImapCommand::Move).await;
        let limit = self.socket_timeout;
        match bounded("move", limit, self.session.uid_mv(uid.to_string(), folder)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("UID MOVE {} to {} failed: {:?}", uid, folder, e);
                false
            }
            Err(e) => {
                debug!("UID MOVE {} to {} failed: {}", uid, folder, e);
                false
            }
        }
    }

    async fn unselect(&mut self) -> Result<()> {
        let Some(folder) = self.selected.take() else {
            return Ok(());
        };

        let limit = self.socket_timeout;
        bounded("unselect", limit, self.session.run_command_and_check_ok("UNSELECT"))
            .await?
            .map_err(|e| self.session_error("unselect", e))?;
        debug!("Released {} on {}", folder, self.host);
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        let limit = self.socket_timeout;
        bounded("logout", limit, self.session.logout())
            .await?
            .map_err(|e| self.session_error("logout", e))?;
        debug!("Logged out of {}", self.host);
        Ok(())
    }
}
