//! Persistent state behind typed facades.
//!
//! One background thread owns the DuckDB connection; async callers submit
//! typed commands over a bounded channel and await replies on oneshot
//! channels. Facades split the command surface into the three contracts:
//! [`tasks::TaskRegistry`], [`samples::SampleStore`], [`cache::CacheIndex`].
//!
//! Because every command executes on the single store thread, task creation
//! (with its unique-in-flight-fingerprint check) is linearizable without any
//! keyed lock in the dispatcher.

pub mod cache;
pub mod samples;
pub mod schema;
pub mod tasks;
mod worker;

use std::path::Path;
use std::sync::{Arc, mpsc};

use crate::error::RanklabError;
use crate::task::TaskStatus;

pub use worker::StoreStats;

/// Command channel depth. Writes beyond this apply backpressure to callers.
const COMMAND_QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
pub enum StoreError {
    Duckdb(duckdb::Error),
    Migration(schema::MigrationError),
    NotFound(String),
    DuplicateFingerprint { task_id: String },
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    Corrupt(String),
    WorkerGone,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duckdb(e) => write!(f, "duckdb error: {e}"),
            Self::Migration(e) => write!(f, "{e}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::DuplicateFingerprint { task_id } => {
                write!(f, "non-terminal task {task_id} already holds this fingerprint")
            }
            Self::InvalidTransition { task_id, from, to } => write!(
                f,
                "invalid transition for task {task_id}: {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            Self::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
            Self::WorkerGone => write!(f, "store worker is gone"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        Self::Duckdb(e)
    }
}

/// Map store failures onto the orchestrator error taxonomy. The duplicate
/// case keeps the winning task id so the dispatcher can coalesce.
impl StoreError {
    pub fn into_ranklab(self, fingerprint: &str) -> RanklabError {
        match self {
            Self::DuplicateFingerprint { task_id } => RanklabError::DuplicateInFlight {
                fingerprint: fingerprint.to_string(),
                task_id,
            },
            Self::NotFound(what) => RanklabError::NotFound(what),
            Self::InvalidTransition { task_id, from, to } => RanklabError::Conflict(format!(
                "task {task_id}: cannot transition {} -> {}",
                from.as_str(),
                to.as_str()
            )),
            Self::Duckdb(_) | Self::Migration(_) | Self::Corrupt(_) | Self::WorkerGone => {
                RanklabError::StorageUnavailable(self.to_string())
            }
        }
    }
}

/// Handle to the store thread. Cheap to share via `Arc`; dropping the last
/// handle shuts the thread down after a final flush.
pub struct Store {
    tx: mpsc::SyncSender<worker::DbCommand>,
    worker_handle: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Store {
    /// Open (or create) the database, apply migrations, and spawn the store
    /// thread. Fails fast if the database cannot be opened or migrated.
    pub fn open(db_path: &Path) -> Result<Arc<Self>, StoreError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupt(format!("cannot create db dir: {e}")))?;
        }

        let conn = duckdb::Connection::open(db_path)?;
        schema::apply_migrations(&conn).map_err(StoreError::Migration)?;

        Self::spawn(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Arc<Self>, StoreError> {
        let conn = duckdb::Connection::open_in_memory()?;
        schema::apply_migrations(&conn).map_err(StoreError::Migration)?;
        Self::spawn(conn)
    }

    fn spawn(conn: duckdb::Connection) -> Result<Arc<Self>, StoreError> {
        let (tx, rx) = mpsc::sync_channel(COMMAND_QUEUE_DEPTH);
        let builder = std::thread::Builder::new().name("ranklab-store".into());
        let handle = builder
            .spawn(move || worker::run(rx, conn))
            .map_err(|e| StoreError::Corrupt(format!("failed to spawn store thread: {e}")))?;

        Ok(Arc::new(Self {
            tx,
            worker_handle: std::sync::Mutex::new(Some(handle)),
        }))
    }

    /// Submit a command and await its reply.
    pub(crate) async fn call<T>(
        &self,
        make: impl FnOnce(tokio::sync::oneshot::Sender<Result<T, StoreError>>) -> worker::DbCommand,
    ) -> Result<T, StoreError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| StoreError::WorkerGone)?;
        reply_rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Liveness probe for `/health`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.call(|reply| worker::DbCommand::Ping { reply }).await
    }

    /// Aggregate counters for `/stats`.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.call(|reply| worker::DbCommand::Stats { reply }).await
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.tx.send(worker::DbCommand::Shutdown);
        if let Ok(mut guard) = self.worker_handle.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }
    }
}
