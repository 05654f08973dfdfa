//! Helpdesk Sync Daemon
//!
//! Long-running worker that turns department mailboxes into helpdesk tickets,
//! plus operational subcommands for one-off passes and worker control.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use helpdesk_sync_core::config::{Config, LogFormat};
use helpdesk_sync_core::control::{self, ControlAction, ControlRequest, WorkerHandle};
use helpdesk_sync_core::db::{DepartmentRegistry, PostgresStore};
use helpdesk_sync_core::mailbox::{CommandBudget, ImapConnector};
use helpdesk_sync_core::notify::notifier_from_config;
use helpdesk_sync_core::secrets::{decryptor_from_config, AesGcmDecryptor, SecretDecryptor};
use helpdesk_sync_core::sync::{PassOutcome, Scheduler, SyncEvent, SyncOrchestrator};

#[derive(Parser)]
#[command(name = "helpdesk-sync-daemon")]
#[command(about = "Helpdesk mailbox-to-ticket sync worker", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/helpdesk-sync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker (default if no command specified)
    Run,
    /// Run one pass per eligible department and print the summaries
    Once {
        /// Only sync this department
        #[arg(short, long)]
        department: Option<String>,
    },
    /// Show the status of a running worker
    Status,
    /// Send a control action to a running worker
    Control {
        action: ControlCommand,
        /// Department for `sync`
        #[arg(short, long)]
        department: Option<String>,
    },
    /// List departments with eligibility and last sync
    ListDepartments,
    /// Read a mailbox password from stdin and print its encrypted form
    EncryptSecret,
}

#[derive(Clone, Copy, ValueEnum)]
enum ControlCommand {
    Start,
    Stop,
    Restart,
    Sync,
}

impl From<ControlCommand> for ControlAction {
    fn from(command: ControlCommand) -> Self {
        match command {
            ControlCommand::Start => ControlAction::Start,
            ControlCommand::Stop => ControlAction::Stop,
            ControlCommand::Restart => ControlAction::Restart,
            ControlCommand::Sync => ControlAction::Sync,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    init_logging(&config)?;

    match cli.command {
        Some(Commands::Run) | None => run_worker(config).await,
        Some(Commands::Once { department }) => run_once(config, department).await,
        Some(Commands::Status) => send_control(&config, ControlRequest::new(ControlAction::Status)).await,
        Some(Commands::Control { action, department }) => {
            let request = ControlRequest {
                action: action.into(),
                department_id: department,
            };
            send_control(&config, request).await
        }
        Some(Commands::ListDepartments) => list_departments(config).await,
        Some(Commands::EncryptSecret) => encrypt_secret(&config),
    }
}

/// Console logging on stderr, plus a daily-rolling file when enabled
fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.general.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = match config.general.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    let file = if config.general.log_to_file {
        let log_dir = config.logs_dir();
        std::fs::create_dir_all(&log_dir)?;
        let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "worker.log");
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_ansi(false)
                .with_target(false),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<PostgresStore>> {
    let store = PostgresStore::connect(&config.database).await.map_err(|e| {
        error!("Ticket store unreachable: {}", e);
        e
    })?;
    Ok(Arc::new(store))
}

fn build_orchestrator(config: &Config, store: Arc<PostgresStore>) -> Result<SyncOrchestrator> {
    let decryptor: Arc<dyn SecretDecryptor> = Arc::from(decryptor_from_config(&config.secrets)?);
    let budget = Arc::new(CommandBudget::new(
        config.sync.rate_limit_per_second,
        config.sync.host_rate_limit_per_second,
    ));
    let connector = Arc::new(ImapConnector::new(config.timeouts.clone(), budget));
    let notifier = notifier_from_config(&config.notifications)?;

    Ok(SyncOrchestrator::new(connector, store, decryptor, config.sync.clone()).with_notifier(notifier))
}

/// Run the worker until a termination signal or a fatal registry failure
async fn run_worker(config: Config) -> Result<()> {
    info!("Starting helpdesk sync worker v{}", env!("CARGO_PKG_VERSION"));

    let store = open_store(&config).await?;
    let orchestrator = Arc::new(build_orchestrator(&config, store.clone())?);
    let scheduler = Arc::new(Scheduler::new(store, orchestrator));

    // Subscribe before the first tick fires
    let events = scheduler.subscribe();

    let eligible = scheduler.start().await?;
    if eligible == 0 {
        scheduler.stop().await;
        bail!("no departments are eligible for sync (active, sync enabled, mailbox configured)");
    }

    tokio::spawn(log_events(events));

    let control_cancel = CancellationToken::new();
    if config.control.enabled {
        let handle = WorkerHandle::new(scheduler.clone());
        let bind = config.control.bind.clone();
        let cancel = control_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = control::serve(handle, &bind, cancel).await {
                error!("Control surface on {} failed: {}", bind, e);
            }
        });
    }

    info!("Worker is running. Press Ctrl+C to stop.");

    let result = tokio::select! {
        received = shutdown_signal() => {
            received?;
            info!("Shutdown signal received");
            Ok(())
        }
        fatal = scheduler.wait_fatal() => {
            error!("Worker cannot continue: {}", fatal);
            Err(fatal.into())
        }
    };

    control_cancel.cancel();
    scheduler.stop().await;
    info!("Worker shut down");
    result
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c().await?;
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<SyncEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(SyncEvent::PassCompleted { summary }) => {
                if let PassOutcome::Interrupted { reason } = &summary.outcome {
                    warn!("Department {} pass interrupted: {}", summary.department_id, reason);
                } else if summary.failed > 0 {
                    warn!(
                        "Department {} pass finished with {} failed messages",
                        summary.department_id, summary.failed
                    );
                }
            }
            Ok(SyncEvent::PassFailed {
                department_id,
                code,
                error,
            }) => {
                error!("Department {} pass failed [{}]: {}", department_id, code, error);
            }
            Ok(SyncEvent::TickSkipped { department_id }) => {
                info!("Department {} still syncing, tick skipped", department_id);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!("Event log fell behind, {} events dropped", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// One pass per department, summaries printed as JSON
async fn run_once(config: Config, department: Option<String>) -> Result<()> {
    let store = open_store(&config).await?;
    let orchestrator = build_orchestrator(&config, store.clone())?;

    let departments = match department {
        Some(id) => {
            let department = store
                .get_department(&id)
                .await?
                .ok_or_else(|| anyhow!("department {} not found", id))?;
            if !department.is_eligible() {
                bail!("department {} is not eligible for sync", department);
            }
            vec![department]
        }
        None => store.eligible_departments().await?,
    };
    if departments.is_empty() {
        bail!("no departments are eligible for sync");
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let mut aborted = 0;
    for department in &departments {
        let summary = orchestrator.run_pass(department, &cancel).await;
        if summary.is_aborted() {
            aborted += 1;
        }
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if aborted > 0 {
        error!("{} of {} department passes aborted", aborted, departments.len());
        std::process::exit(1);
    }
    Ok(())
}

async fn send_control(config: &Config, request: ControlRequest) -> Result<()> {
    let response = control::send_request(&config.control.bind, &request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn list_departments(config: Config) -> Result<()> {
    let store = open_store(&config).await?;
    let departments = store.list_departments().await?;

    if departments.is_empty() {
        println!("No departments configured yet.");
        return Ok(());
    }

    println!("\nDepartments:\n");
    for department in &departments {
        let icon = if department.is_eligible() { "✓" } else { "○" };
        println!(
            "  {} {} - {}",
            icon,
            department,
            department.imap_email.as_deref().unwrap_or("no mailbox")
        );

        let interval = department.effective_interval(config.sync.default_interval_secs, config.sync.min_interval_secs);
        match department.last_sync {
            Some(last_sync) => println!(
                "    every {}s, last sync {}",
                interval.as_secs(),
                last_sync.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("    every {}s, never synced", interval.as_secs()),
        }
    }
    println!();

    Ok(())
}

fn encrypt_secret(config: &Config) -> Result<()> {
    let env = &config.secrets.encryption_key_env;
    let key = std::env::var(env).map_err(|_| anyhow!("{} is not set", env))?;
    let encryptor = AesGcmDecryptor::new(&key)?;

    let mut secret = String::new();
    std::io::stdin().lock().read_line(&mut secret)?;
    let secret = secret.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        bail!("no secret on stdin");
    }

    println!("{}", encryptor.encrypt(secret)?);
    Ok(())
}
