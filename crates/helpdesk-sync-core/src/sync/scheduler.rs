//! Worker runtime: one shared timer fanning out to every eligible department

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::db::DepartmentRegistry;
use crate::error::{Error, Result};
use crate::models::Department;

use super::{SyncEvent, SyncOrchestrator};

/// Global worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Snapshot served by the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub is_running: bool,
    pub state: WorkerState,
    pub sync_interval_seconds: u64,
    pub departments_tracked: usize,
    pub running_departments: Vec<String>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Marks a department RUNNING until dropped
struct RunningGuard {
    running: Arc<Mutex<HashSet<String>>>,
    department_id: String,
}

impl RunningGuard {
    /// None when the department already has a pass in flight
    fn acquire(running: &Arc<Mutex<HashSet<String>>>, department_id: &str) -> Option<Self> {
        if !running.lock().insert(department_id.to_string()) {
            return None;
        }
        Some(Self {
            running: running.clone(),
            department_id: department_id.to_string(),
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.department_id);
    }
}

struct Runtime {
    cancel: CancellationToken,
    tracker: TaskTracker,
    ticker: JoinHandle<()>,
}

struct Inner {
    registry: Arc<dyn DepartmentRegistry>,
    orchestrator: Arc<SyncOrchestrator>,
    tick_interval: Duration,
    default_interval_secs: u64,
    min_interval_secs: u64,
    max_registry_failures: u32,
    state: RwLock<WorkerState>,
    running: Arc<Mutex<HashSet<String>>>,
    next_due: Mutex<HashMap<String, Instant>>,
    departments_tracked: AtomicUsize,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    fatal: watch::Sender<Option<String>>,
}

/// Drives sync passes for every eligible department
pub struct Scheduler {
    inner: Arc<Inner>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

impl Scheduler {
    pub fn new(registry: Arc<dyn DepartmentRegistry>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        let settings = orchestrator.settings();
        let (fatal, _) = watch::channel(None);
        let inner = Inner {
            tick_interval: Duration::from_secs(settings.tick_interval_secs.max(1)),
            default_interval_secs: settings.default_interval_secs,
            min_interval_secs: settings.min_interval_secs,
            max_registry_failures: settings.max_registry_failures.max(1),
            registry,
            orchestrator,
            state: RwLock::new(WorkerState::Stopped),
            running: Arc::new(Mutex::new(HashSet::new())),
            next_due: Mutex::new(HashMap::new()),
            departments_tracked: AtomicUsize::new(0),
            last_tick_at: RwLock::new(None),
            last_error: RwLock::new(None),
            fatal,
        };

        Self {
            inner: Arc::new(inner),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.inner.orchestrator
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.orchestrator.subscribe()
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.read()
    }

    /// Read the registry and start the shared timer. Returns the number of
    /// eligible departments; a registry failure leaves the worker stopped.
    pub async fn start(&self) -> Result<usize> {
        let mut runtime = self.runtime.lock().await;
        // A tick loop that gave up on the registry leaves a finished runtime behind
        if runtime.as_ref().is_some_and(|r| !r.ticker.is_finished()) {
            return Ok(self.inner.departments_tracked.load(Ordering::Relaxed));
        }

        self.inner.set_state(WorkerState::Starting);
        let departments = match self.inner.registry.eligible_departments().await {
            Ok(departments) => departments,
            Err(e) => {
                let e = match e {
                    Error::Registry(_) => e,
                    other => Error::Registry(other.to_string()),
                };
                error!("Worker failed to start: {}", e);
                *self.inner.last_error.write() = Some(e.to_string());
                self.inner.set_state(WorkerState::Stopped);
                return Err(e);
            }
        };

        let count = departments.len();
        self.inner.departments_tracked.store(count, Ordering::Relaxed);
        self.inner.next_due.lock().clear();
        *self.inner.last_error.write() = None;
        self.inner.fatal.send_replace(None);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let ticker = tokio::spawn(self.inner.clone().tick_loop(cancel.clone(), tracker.clone()));
        *runtime = Some(Runtime {
            cancel,
            tracker,
            ticker,
        });

        self.inner.set_state(WorkerState::Running);
        info!(
            "Worker running: {} eligible departments, tick every {:?}",
            count, self.inner.tick_interval
        );
        Ok(count)
    }

    /// Cancel the timer and in-flight passes, then wait for them to release their mailboxes
    pub async fn stop(&self) {
        let mut runtime = self.runtime.lock().await;
        let Some(runtime) = runtime.take() else {
            return;
        };

        self.inner.set_state(WorkerState::Stopping);
        info!(
            "Stopping worker ({} passes in flight)",
            self.inner.running.lock().len()
        );

        runtime.cancel.cancel();
        if let Err(e) = runtime.ticker.await {
            warn!("Tick loop ended abnormally: {}", e);
        }
        runtime.tracker.close();
        runtime.tracker.wait().await;

        self.inner.set_state(WorkerState::Stopped);
        info!("Worker stopped");
    }

    pub async fn restart(&self) -> Result<usize> {
        self.stop().await;
        self.start().await
    }

    /// Run a department now. `Ok(false)` when it already has a pass in flight.
    pub async fn trigger(&self, department_id: &str) -> Result<bool> {
        let runtime = self.runtime.lock().await;
        let Some(runtime) = runtime.as_ref().filter(|_| self.state() == WorkerState::Running) else {
            return Err(Error::Other("worker is not running".to_string()));
        };

        let department = self
            .inner
            .registry
            .get_department(department_id)
            .await?
            .ok_or_else(|| Error::DepartmentNotFound(department_id.to_string()))?;
        if !department.is_eligible() {
            return Err(Error::Other(format!(
                "department {} is not eligible for sync",
                department
            )));
        }

        info!("Manual sync requested for department {}", department);
        Ok(self
            .inner
            .spawn_pass(department, &runtime.cancel, &runtime.tracker))
    }

    pub fn status(&self) -> WorkerStatus {
        let state = self.state();
        let mut running_departments: Vec<String> =
            self.inner.running.lock().iter().cloned().collect();
        running_departments.sort();

        WorkerStatus {
            is_running: state == WorkerState::Running,
            state,
            sync_interval_seconds: self.inner.default_interval_secs,
            departments_tracked: self.inner.departments_tracked.load(Ordering::Relaxed),
            running_departments,
            last_tick_at: *self.inner.last_tick_at.read(),
            last_error: self.inner.last_error.read().clone(),
        }
    }

    /// Resolves once the tick loop has given up on the registry
    pub async fn wait_fatal(&self) -> Error {
        let mut fatal = self.inner.fatal.subscribe();
        let error = match fatal.wait_for(Option::is_some).await {
            Ok(message) => Error::Registry(message.clone().unwrap_or_default()),
            Err(_) => Error::Other("worker dropped".to_string()),
        };
        error
    }
}

impl Inner {
    fn set_state(&self, state: WorkerState) {
        debug!("Worker state -> {}", state);
        *self.state.write() = state;
    }

    async fn tick_loop(self: Arc<Self>, cancel: CancellationToken, tracker: TaskTracker) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick(&cancel, &tracker).await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    error!(
                        "Tick failed ({}/{}): {}",
                        failures, self.max_registry_failures, e
                    );
                    *self.last_error.write() = Some(e.to_string());
                    if failures >= self.max_registry_failures {
                        let message = format!(
                            "registry unreadable for {} consecutive ticks: {}",
                            failures, e
                        );
                        error!("Worker giving up: {}", message);
                        self.set_state(WorkerState::Stopping);
                        cancel.cancel();
                        tracker.close();
                        tracker.wait().await;
                        self.set_state(WorkerState::Stopped);
                        self.fatal.send_replace(Some(message));
                        break;
                    }
                }
            }
        }

        debug!("Tick loop exited");
    }

    /// Re-read eligibility and start every due department that is idle
    async fn tick(&self, cancel: &CancellationToken, tracker: &TaskTracker) -> Result<()> {
        *self.last_tick_at.write() = Some(Utc::now());
        let departments = self.registry.eligible_departments().await?;
        self.departments_tracked
            .store(departments.len(), Ordering::Relaxed);

        let now = Instant::now();
        let due: Vec<Department> = {
            let mut next_due = self.next_due.lock();
            next_due.retain(|id, _| departments.iter().any(|d| &d.id == id));
            departments
                .into_iter()
                .filter(|d| next_due.get(&d.id).map_or(true, |at| now >= *at))
                .collect()
        };

        for department in due {
            self.spawn_pass(department, cancel, tracker);
        }
        Ok(())
    }

    fn spawn_pass(
        &self,
        department: Department,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> bool {
        let Some(guard) = RunningGuard::acquire(&self.running, &department.id) else {
            debug!("Department {} still running, skipping", department);
            self.orchestrator.emit(SyncEvent::TickSkipped {
                department_id: department.id.clone(),
            });
            return false;
        };

        let interval = department.effective_interval(self.default_interval_secs, self.min_interval_secs);
        self.next_due
            .lock()
            .insert(department.id.clone(), Instant::now() + interval);

        let orchestrator = self.orchestrator.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let _guard = guard;
            orchestrator.run_pass(&department, &cancel).await;
        });
        true
    }
}
