//! Control surface: start/stop/restart/status/sync over line-delimited JSON
//!
//! Each request is one JSON object on its own line, answered by one line:
//!
//! ```text
//! -> {"action":"sync","department_id":"support"}
//! <- {"success":true,"message":"sync started for support","data":{...}}
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sync::{Scheduler, WorkerStatus};

/// Client-side budget for connecting and for each reply
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
    Status,
    Sync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
}

impl ControlRequest {
    pub fn new(action: ControlAction) -> Self {
        Self {
            action,
            department_id: None,
        }
    }

    pub fn sync(department_id: impl Into<String>) -> Self {
        Self {
            action: ControlAction::Sync,
            department_id: Some(department_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WorkerStatus>,
}

impl ControlResponse {
    fn ok(message: impl Into<String>, status: WorkerStatus) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(status),
        }
    }

    fn failed(message: impl Into<String>, status: Option<WorkerStatus>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: status,
        }
    }
}

/// Cloneable handle on the worker, shared with the control server
#[derive(Clone)]
pub struct WorkerHandle {
    scheduler: Arc<Scheduler>,
}

impl WorkerHandle {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    pub async fn start(&self) -> Result<usize> {
        self.scheduler.start().await
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await
    }

    pub async fn restart(&self) -> Result<usize> {
        self.scheduler.restart().await
    }

    pub fn status(&self) -> WorkerStatus {
        self.scheduler.status()
    }

    pub async fn trigger(&self, department_id: &str) -> Result<bool> {
        self.scheduler.trigger(department_id).await
    }

    /// Execute one control request
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        debug!("Control request: {:?}", request);
        match request.action {
            ControlAction::Start => match self.start().await {
                Ok(count) => ControlResponse::ok(
                    format!("worker running with {} departments", count),
                    self.status(),
                ),
                Err(e) => ControlResponse::failed(e.to_string(), Some(self.status())),
            },
            ControlAction::Stop => {
                self.stop().await;
                ControlResponse::ok("worker stopped", self.status())
            }
            ControlAction::Restart => match self.restart().await {
                Ok(count) => ControlResponse::ok(
                    format!("worker restarted with {} departments", count),
                    self.status(),
                ),
                Err(e) => ControlResponse::failed(e.to_string(), Some(self.status())),
            },
            ControlAction::Status => {
                let status = self.status();
                ControlResponse::ok(format!("worker is {}", status.state), status)
            }
            ControlAction::Sync => {
                let Some(department_id) = request.department_id.as_deref() else {
                    return ControlResponse::failed("sync requires department_id", Some(self.status()));
                };
                match self.trigger(department_id).await {
                    Ok(true) => ControlResponse::ok(format!("sync started for {}", department_id), self.status()),
                    Ok(false) => ControlResponse::failed(
                        format!("department {} is already syncing", department_id),
                        Some(self.status()),
                    ),
                    Err(e) => ControlResponse::failed(e.to_string(), Some(self.status())),
                }
            }
        }
    }
}

/// Bind and serve until cancelled
pub async fn serve(handle: WorkerHandle, bind: &str, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("Control surface listening on {}", listener.local_addr()?);
    serve_listener(handle, listener, cancel).await
}

pub async fn serve_listener(
    handle: WorkerHandle,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Control accept failed: {}", e);
                continue;
            }
        };

        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = serve_connection(handle, socket) => {
                    if let Err(e) = result {
                        debug!("Control connection {} closed: {}", peer, e);
                    }
                }
            }
        });
    }

    debug!("Control surface stopped");
    Ok(())
}

async fn serve_connection(handle: WorkerHandle, socket: TcpStream) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => handle.handle(request).await,
            Err(e) => ControlResponse::failed(format!("invalid request: {}", e), None),
        };
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}

/// Send one request to a running worker
pub async fn send_request(addr: &str, request: &ControlRequest) -> Result<ControlResponse> {
    let secs = CLIENT_TIMEOUT.as_secs();
    let stream = tokio::time::timeout(CLIENT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::timeout("control connect", secs))?
        .map_err(|e| Error::connection(addr, e))?;

    let (reader, mut writer) = stream.into_split();
    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;

    let mut lines = BufReader::new(reader).lines();
    let line = tokio::time::timeout(CLIENT_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| Error::timeout("control reply", secs))??
        .ok_or_else(|| Error::connection(addr, "worker closed the connection"))?;

    Ok(serde_json::from_str(&line)?)
}
