/// Store adapter: read-only access to the external chat log
///
/// One adapter owns one bounded pool at a time. The pool is opened lazily,
/// replaced on connection-level failure and dropped at the end of every
/// refresh cycle, so a file swapped out underneath us is picked up by the
/// next query.
use crate::error::{MirrorError, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Adapter settings, derived from [`crate::Config`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub path: PathBuf,
    pub pool_size: u32,
    pub query_timeout: Duration,
}

pub struct StoreAdapter {
    options: StoreOptions,
    pool: RwLock<Option<DbPool>>,
    opens: AtomicU64,
}

impl StoreAdapter {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            options,
            pool: RwLock::new(None),
            opens: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.options.path
    }

    /// How many times a pool has been opened over the adapter's lifetime
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.pool.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    fn build_pool(&self) -> Result<DbPool> {
        let busy = self.options.query_timeout;
        let manager = SqliteConnectionManager::file(&self.options.path)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_init(move |conn| conn.busy_timeout(busy));

        // Connections are created on demand, so opening never touches the file.
        let pool = Pool::builder()
            .max_size(self.options.pool_size)
            .min_idle(Some(0))
            .test_on_check_out(true)
            .connection_timeout(self.options.query_timeout)
            .build_unchecked(manager);
        Ok(pool)
    }

    /// Replace the pool with a fresh one
    pub fn reopen(&self) -> Result<()> {
        let pool = self.build_pool()?;
        let mut slot = self
            .pool
            .write()
            .map_err(|_| MirrorError::Store("pool lock poisoned".to_string()))?;
        *slot = Some(pool);
        let n = self.opens.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Opened connection pool #{} on {}", n, self.options.path.display());
        Ok(())
    }

    /// Drop the pool; idle connections close now, checked-out ones on return
    pub fn close(&self) {
        if let Ok(mut slot) = self.pool.write() {
            if slot.take().is_some() {
                debug!("Closed connection pool on {}", self.options.path.display());
            }
        }
    }

    fn current_pool(&self) -> Result<DbPool> {
        {
            let slot = self
                .pool
                .read()
                .map_err(|_| MirrorError::Store("pool lock poisoned".to_string()))?;
            if let Some(pool) = slot.as_ref() {
                return Ok(pool.clone());
            }
        }
        self.reopen()?;
        let slot = self
            .pool
            .read()
            .map_err(|_| MirrorError::Store("pool lock poisoned".to_string()))?;
        slot.clone()
            .ok_or_else(|| MirrorError::Store("connection pool unavailable".to_string()))
    }

    async fn checkout(&self) -> Result<DbConnection> {
        let pool = self.current_pool()?;
        tokio::task::spawn_blocking(move || pool.get())
            .await
            .map_err(|e| MirrorError::Store(format!("checkout task failed: {}", e)))?
            .map_err(MirrorError::Pool)
    }

    async fn run_once<T, F>(&self, label: &str, f: Arc<F>) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        let conn = self.checkout().await?;
        let interrupt = conn.get_interrupt_handle();
        let task = tokio::task::spawn_blocking(move || (*f)(&*conn));

        match timeout(self.options.query_timeout, task).await {
            Ok(Ok(result)) => result.map_err(MirrorError::Sqlite),
            Ok(Err(e)) => Err(MirrorError::Store(format!("{} task failed: {}", label, e))),
            Err(_) => {
                interrupt.interrupt();
                Err(MirrorError::Timeout(format!(
                    "{} exceeded {}ms",
                    label,
                    self.options.query_timeout.as_millis()
                )))
            }
        }
    }

    /// Run `f` against a pooled connection under the per-query deadline.
    ///
    /// A connection-level failure reopens the pool and retries exactly once;
    /// a failing query is returned as is.
    pub async fn execute<T, F>(&self, label: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        match self.run_once(label, f.clone()).await {
            Err(e) if e.is_connection_error() => {
                warn!("{}: connection failure ({}), reopening store", label, e);
                self.reopen()?;
                self.run_once(label, f).await
            }
            other => other,
        }
    }

    /// Fail fast when the source file is gone, instead of waiting out the
    /// pool's checkout timeout twice
    pub fn check_source(&self) -> Result<()> {
        if self.options.path.is_file() {
            Ok(())
        } else {
            Err(MirrorError::Store(format!(
                "source store {} is missing",
                self.options.path.display()
            )))
        }
    }

    /// Reopen now and close when the returned guard drops
    pub fn begin_cycle(&self) -> Result<CycleGuard<'_>> {
        self.reopen()?;
        Ok(CycleGuard { adapter: self })
    }
}

/// Scoped ownership of the adapter's connections for one refresh cycle
pub struct CycleGuard<'a> {
    adapter: &'a StoreAdapter,
}

impl CycleGuard<'_> {
    pub fn adapter(&self) -> &StoreAdapter {
        self.adapter
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.adapter.close();
    }
}
