//! Long-running processes: the schedule engine, the queue worker, or both.
//!
//! Every process opens the same SQLite database, which holds the run state,
//! the claim locks, the async queue and the failed-message table. Several
//! scheduler processes may run against one database; the claim locks keep
//! each occurrence to a single dispatch.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use miette::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use cadence_messenger::{
    EventDispatcher, FailedMessageStore, HandlerRegistry, SqliteFailedMessageStore,
    SqliteTransport, SyncTransport, Transport, Worker,
};
use cadence_scheduler::{
    BackendLockFactory, LockBackend, MemoryLockBackend, ScheduleEngine, SqliteLockBackend,
    SqliteRunStateStore,
};

use crate::config::{Config, LockBackendKind, TransportMode};

/// Which loops a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    All,
    Scheduler,
    Worker,
}

impl Role {
    fn runs_scheduler(self) -> bool {
        matches!(self, Role::All | Role::Scheduler)
    }

    fn runs_worker(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

/// Components shared by the daemon and the operator commands.
pub struct Services {
    pub config: Config,
    pub events: Arc<EventDispatcher>,
    pub handlers: Arc<HandlerRegistry>,
    /// Set in async mode.
    pub queue: Option<Arc<SqliteTransport>>,
    pub transport: Arc<dyn Transport>,
    pub failed: Arc<dyn FailedMessageStore>,
}

impl Services {
    /// Open the database and build the configured transport.
    pub fn open(config: Config, database: &Path) -> Result<Self> {
        let events = Arc::new(config.event_dispatcher()?);
        let handlers = Arc::new(config.handlers());

        let failed: Arc<dyn FailedMessageStore> = Arc::new(
            SqliteFailedMessageStore::open(database).map_err(|e| miette::miette!("{}", e))?,
        );

        let (queue, transport): (Option<Arc<SqliteTransport>>, Arc<dyn Transport>) =
            match config.transport.mode {
                TransportMode::Async => {
                    let queue = Arc::new(
                        SqliteTransport::open(database).map_err(|e| miette::miette!("{}", e))?,
                    );
                    let transport: Arc<dyn Transport> = queue.clone();
                    (Some(queue), transport)
                }
                TransportMode::Sync => {
                    let transport: Arc<dyn Transport> =
                        Arc::new(SyncTransport::new(handlers.clone()));
                    (None, transport)
                }
            };

        Ok(Self {
            config,
            events,
            handlers,
            queue,
            transport,
            failed,
        })
    }

    /// The schedule engine over the shared run state and locks.
    pub fn engine(&self, database: &Path) -> Result<ScheduleEngine> {
        let run_state = SqliteRunStateStore::open(database).map_err(|e| miette::miette!("{}", e))?;

        let backend: Arc<dyn LockBackend> = match self.config.scheduler.lock_backend {
            LockBackendKind::Sqlite => Arc::new(
                SqliteLockBackend::open(database).map_err(|e| miette::miette!("{}", e))?,
            ),
            LockBackendKind::Memory => {
                warn!("in-memory locks only exclude engines within this process");
                Arc::new(MemoryLockBackend::new())
            }
        };

        Ok(ScheduleEngine::new(
            self.config.schedule_set(),
            Arc::new(run_state),
            Arc::new(BackendLockFactory::new(backend)),
            self.transport.clone(),
            self.events.clone(),
            self.config.engine_config(),
            Utc::now(),
        ))
    }

    /// A worker consuming the async queue.
    pub fn worker(&self) -> Result<Worker> {
        let queue = self
            .queue
            .clone()
            .ok_or_else(|| miette::miette!("the sync transport has no queue to consume"))?;

        Ok(Worker::new(
            queue.clone(),
            queue,
            self.handlers.clone(),
            Arc::new(self.config.retry_strategy()),
            self.failed.clone(),
            self.events.clone(),
            self.config.worker_config(),
        ))
    }
}

/// Run the requested loops until Ctrl-C.
pub async fn run(config: Config, database: &Path, role: Role) -> Result<()> {
    info!(database = %database.display(), ?role, "starting cadence");

    let services = Services::open(config, database)?;

    let engine = if role.runs_scheduler() {
        let engine = services.engine(database)?;
        if engine.schedules().is_empty() {
            warn!("no schedules configured");
        }
        Some(engine)
    } else {
        None
    };

    let worker = if !role.runs_worker() {
        None
    } else if role == Role::All && services.config.transport.mode == TransportMode::Sync {
        info!("sync transport handles messages inline, no worker started");
        None
    } else {
        Some(services.worker()?)
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let scheduler_rx = shutdown_rx.clone();
    let scheduler_loop = async {
        if let Some(engine) = &engine {
            engine.run(scheduler_rx).await;
        }
    };

    let worker_rx = shutdown_rx.clone();
    let worker_loop = async {
        match &worker {
            Some(worker) => worker.run(worker_rx).await,
            None => Ok(()),
        }
    };

    let ((), worker_result) = tokio::join!(scheduler_loop, worker_loop);
    worker_result.map_err(|e| miette::miette!("{}", e))?;

    info!("cadence shut down gracefully");
    Ok(())
}
