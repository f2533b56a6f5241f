//! Physical connections.
//!
//! The [`ConnectionManager`] owns the pool. With auto-close enabled the pool
//! is closed after an idle period and recreated on next access; every close
//! bumps a generation counter, so a [`Lease`] can tell whether it outlived
//! the pool it came from.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::config::JournalMode;
use crate::error::{Error, Result};
use crate::invalidation::lock;

struct PoolState {
    pool: Option<SqlitePool>,
    generation: u64,
    active: usize,
    last_used: Instant,
}

/// Owns the connection pool of one database.
pub struct ConnectionManager {
    options: SqliteConnectOptions,
    in_memory: bool,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ConnectionManager")
            .field("in_memory", &self.in_memory)
            .field("open", &state.pool.is_some())
            .field("generation", &state.generation)
            .field("active", &state.active)
            .finish()
    }
}

impl ConnectionManager {
    /// Manager for a file database.
    pub(crate) fn file(path: &Path, journal_mode: JournalMode) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(journal_mode.as_sqlite())
            .foreign_keys(true);
        Self::new(options, false)
    }

    /// Manager for an in-memory database. Its single connection is never
    /// closed while the manager lives.
    pub(crate) fn memory() -> Self {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        Self::new(options, true)
    }

    fn new(options: SqliteConnectOptions, in_memory: bool) -> Self {
        Self {
            options,
            in_memory,
            state: Mutex::new(PoolState {
                pool: None,
                generation: 0,
                active: 0,
                last_used: Instant::now(),
            }),
        }
    }

    fn connect(&self) -> SqlitePool {
        let options = if self.in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };
        options.connect_lazy_with(self.options.clone())
    }

    /// Current generation. Incremented by every close.
    #[must_use]
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Returns true while the pool is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        lock(&self.state).pool.is_some()
    }

    /// Number of leases and transactions currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        lock(&self.state).active
    }

    fn claim(self: &Arc<Self>, reopen: bool, touch: bool) -> Option<(SqlitePool, u64, ActiveGuard)> {
        let mut state = lock(&self.state);
        if state.pool.is_none() {
            if !reopen {
                return None;
            }
            debug!(generation = state.generation, "Opening connection pool");
            state.pool = Some(self.connect());
        }
        let pool = state.pool.clone()?;
        state.active += 1;
        let guard = ActiveGuard {
            manager: Arc::clone(self),
            touch,
        };
        Some((pool, state.generation, guard))
    }

    /// Leases a connection, reopening the pool if it was closed.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease> {
        let (pool, generation, guard) = self.claim(true, true).ok_or(Error::Closed)?;
        let conn = pool.acquire().await?;
        Ok(Lease {
            conn,
            generation,
            manager: Arc::clone(self),
            _guard: guard,
        })
    }

    /// Leases a connection only if the pool is open, without counting as use
    /// for the idle timer.
    pub(crate) async fn acquire_if_open(self: &Arc<Self>) -> Result<Option<Lease>> {
        let Some((pool, generation, guard)) = self.claim(false, false) else {
            return Ok(None);
        };
        let conn = pool.acquire().await?;
        Ok(Some(Lease {
            conn,
            generation,
            manager: Arc::clone(self),
            _guard: guard,
        }))
    }

    /// Starts a transaction, reopening the pool if it was closed.
    pub(crate) async fn begin(self: &Arc<Self>) -> Result<(Transaction<'static, Sqlite>, ActiveGuard)> {
        let (pool, _, guard) = self.claim(true, true).ok_or(Error::Closed)?;
        let tx = pool.begin().await?;
        Ok((tx, guard))
    }

    /// Takes the pool out if it has been idle for `timeout`.
    fn take_idle(&self, timeout: Duration) -> Option<SqlitePool> {
        let mut state = lock(&self.state);
        if self.in_memory || state.active > 0 || state.last_used.elapsed() < timeout {
            return None;
        }
        let pool = state.pool.take()?;
        state.generation += 1;
        Some(pool)
    }

    /// Takes the pool out regardless of use. Outstanding leases become stale.
    fn take_all(&self) -> Option<SqlitePool> {
        let mut state = lock(&self.state);
        let pool = state.pool.take()?;
        state.generation += 1;
        Some(pool)
    }

    /// Closes the pool, waiting for outstanding leases to be returned. The
    /// next access reopens it.
    pub(crate) async fn close(&self) {
        if let Some(pool) = self.take_all() {
            pool.close().await;
        }
    }
}

/// Keeps the active count up while a connection is in use.
#[derive(Debug)]
pub(crate) struct ActiveGuard {
    manager: Arc<ConnectionManager>,
    touch: bool,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.manager.state);
        state.active = state.active.saturating_sub(1);
        if self.touch {
            state.last_used = Instant::now();
        }
    }
}

/// A leased connection.
///
/// Dereferences to the raw connection. After an idle close the lease is
/// stale: [`Lease::ensure_current`] reports it and the lease must be
/// dropped and re-acquired.
pub struct Lease {
    conn: PoolConnection<Sqlite>,
    generation: u64,
    manager: Arc<ConnectionManager>,
    _guard: ActiveGuard,
}

impl Lease {
    /// Generation the lease was taken in.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Fails with [`Error::StaleConnection`] if the pool was closed since
    /// the lease was taken.
    pub fn ensure_current(&self) -> Result<()> {
        let current = self.manager.generation();
        if current == self.generation {
            Ok(())
        } else {
            Err(Error::StaleConnection {
                held: self.generation,
                current,
            })
        }
    }
}

impl Deref for Lease {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.conn
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Starts the task closing idle connections. It stops when the manager is
/// dropped.
pub(crate) fn spawn_auto_closer(
    manager: &Arc<ConnectionManager>,
    timeout: Duration,
    handle: &Handle,
) -> AbortHandle {
    let manager: Weak<ConnectionManager> = Arc::downgrade(manager);
    let period = (timeout / 4).max(Duration::from_millis(10));
    handle
        .spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Some(pool) = manager.take_idle(timeout) {
                    info!(
                        idle_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Closing idle database connections"
                    );
                    pool.close().await;
                }
            }
        })
        .abort_handle()
}

struct OpenFile {
    handles: usize,
    shared: bool,
    wake: Arc<Notify>,
}

fn open_files() -> &'static Mutex<HashMap<PathBuf, OpenFile>> {
    static OPEN_FILES: OnceLock<Mutex<HashMap<PathBuf, OpenFile>>> = OnceLock::new();
    OPEN_FILES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Claim on a backing file within this process.
///
/// Only one exclusive claim may exist per file; shared claims (multi-instance
/// invalidation) coexist and share a wake signal.
#[derive(Debug)]
pub(crate) struct FileClaim {
    path: PathBuf,
    wake: Arc<Notify>,
}

impl FileClaim {
    pub(crate) fn acquire(path: &Path, shared: bool) -> Result<Self> {
        let mut files = lock(open_files());
        if let Some(file) = files.get_mut(path) {
            if !(shared && file.shared) {
                return Err(Error::AlreadyOpen(path.to_path_buf()));
            }
            file.handles += 1;
            return Ok(Self {
                path: path.to_path_buf(),
                wake: Arc::clone(&file.wake),
            });
        }
        let wake = Arc::new(Notify::new());
        files.insert(
            path.to_path_buf(),
            OpenFile {
                handles: 1,
                shared,
                wake: Arc::clone(&wake),
            },
        );
        Ok(Self {
            path: path.to_path_buf(),
            wake,
        })
    }

    /// Signal shared by every handle on the file.
    pub(crate) fn wake(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Wakes the other handles after a commit.
    pub(crate) fn notify_others(&self) {
        self.wake.notify_waiters();
    }
}

impl Drop for FileClaim {
    fn drop(&mut self) {
        let mut files = lock(open_files());
        if let Some(file) = files.get_mut(&self.path) {
            file.handles -= 1;
            if file.handles == 0 {
                files.remove(&self.path);
            }
        }
    }
}
