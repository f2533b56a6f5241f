//! The database handle.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use depot_schema::DatabaseBundle;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify, OnceCell, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::{DatabaseBuilder, DatabaseConfig, PrepackagedSource};
use crate::connection::{spawn_auto_closer, ActiveGuard, ConnectionManager, FileClaim, Lease};
use crate::convert::ConverterRegistry;
use crate::error::{Error, Result};
use crate::executor::{QueryExecutor, TransactionExecutor, WriteTicket};
use crate::invalidation::{
    lock, observer_fn, InvalidationObserver, InvalidationTracker, Subscription,
    BUMP_INVALIDATION_LOG,
};
use crate::live::{LiveQuery, QueryObserver};
use crate::migration::MigrationContainer;
use crate::open::{self, OpenOptions, OpenReport};

struct Inner {
    name: String,
    path: Option<PathBuf>,
    bundle: Arc<DatabaseBundle>,
    connections: Arc<ConnectionManager>,
    tracker: Arc<InvalidationTracker>,
    query_executor: QueryExecutor,
    transaction_executor: TransactionExecutor,
    converters: ConverterRegistry,
    migrations: MigrationContainer,
    require_migration: bool,
    allow_destructive_on_downgrade: bool,
    not_required_from: BTreeSet<u32>,
    multi_instance: bool,
    poll_interval: Duration,
    auto_close_timeout: Option<Duration>,
    prepackaged: Mutex<Option<PrepackagedSource>>,
    asset_root: Option<PathBuf>,
    opened: OnceCell<OpenReport>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
    claim: Mutex<Option<FileClaim>>,
    wake: Option<Arc<Notify>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Handle to one database.
///
/// Cheap to clone; clones share the connection pool, the invalidation
/// tracker and the executors. The database file is opened, and created or
/// migrated, on first use.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("version", &self.inner.bundle.version)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Builder for a file database named `name`.
    pub fn builder(name: impl Into<String>, bundle: DatabaseBundle) -> DatabaseBuilder {
        DatabaseBuilder::new(Some(name.into()), bundle)
    }

    /// Builder for an in-memory database.
    #[must_use]
    pub fn in_memory_builder(bundle: DatabaseBundle) -> DatabaseBuilder {
        DatabaseBuilder::new(None, bundle)
    }

    pub(crate) fn from_config(bundle: DatabaseBundle, config: DatabaseConfig) -> Result<Self> {
        let path = config.path()?;
        let DatabaseConfig {
            name,
            journal_mode,
            query_executor,
            transaction_executor,
            migrations,
            allow_destructive_on_downgrade,
            require_migration,
            migration_not_required_from,
            mut prepackaged,
            asset_root,
            converters,
            multi_instance_invalidation,
            invalidation_poll_interval,
            auto_close_timeout,
            ..
        } = config;

        let handle = match query_executor {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| {
                Error::Config("no tokio runtime is running; supply a query executor".into())
            })?,
        };
        let transaction_executor =
            transaction_executor.unwrap_or_else(|| TransactionExecutor::new(&handle));

        let claim = path
            .as_deref()
            .map(|p| FileClaim::acquire(p, multi_instance_invalidation))
            .transpose()?;
        let wake = claim.as_ref().map(FileClaim::wake);
        let connections = Arc::new(match &path {
            Some(path) => ConnectionManager::file(path, journal_mode),
            None => ConnectionManager::memory(),
        });

        let bundle = Arc::new(bundle);
        let tracker = Arc::new(InvalidationTracker::new(
            Arc::clone(&bundle),
            Some(handle.clone()),
        ));
        let name = name.unwrap_or_else(|| ":memory:".to_string());
        info!(
            name = %name,
            version = bundle.version,
            migrations = migrations.len(),
            multi_instance = multi_instance_invalidation,
            "Built database handle"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                path,
                bundle,
                connections,
                tracker,
                query_executor: QueryExecutor::new(handle),
                transaction_executor,
                converters,
                migrations,
                require_migration,
                allow_destructive_on_downgrade,
                not_required_from: migration_not_required_from,
                multi_instance: multi_instance_invalidation,
                poll_interval: invalidation_poll_interval,
                auto_close_timeout,
                prepackaged: Mutex::new(prepackaged.pop()),
                asset_root,
                opened: OnceCell::new(),
                write_lock: Arc::new(tokio::sync::Mutex::new(())),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                claim: Mutex::new(claim),
                wake,
            }),
        })
    }

    /// Database name, `:memory:` for an in-memory database.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Absolute path of the backing file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Schema the database is opened with.
    #[must_use]
    pub fn bundle(&self) -> &DatabaseBundle {
        &self.inner.bundle
    }

    /// Type converters available to generated code.
    #[must_use]
    pub fn converters(&self) -> &ConverterRegistry {
        &self.inner.converters
    }

    /// The invalidation tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<InvalidationTracker> {
        &self.inner.tracker
    }

    /// The connection manager.
    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.inner.connections
    }

    /// Returns true once [`Database::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Opens the database now instead of on first use.
    pub async fn open(&self) -> Result<OpenReport> {
        self.ensure_open().await.cloned()
    }

    async fn ensure_open(&self) -> Result<&OpenReport> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.opened.get_or_try_init(|| self.open_now()).await
    }

    async fn open_now(&self) -> Result<OpenReport> {
        let inner = &self.inner;
        if let Some(path) = &inner.path {
            let source = lock(&inner.prepackaged).take();
            if let Some(source) = source {
                open::copy_prepackaged(path, source, inner.asset_root.as_deref()).await?;
            }
        }

        let mut conn = inner.connections.acquire().await?;
        let options = OpenOptions {
            migrations: &inner.migrations,
            require_migration: inner.require_migration,
            allow_destructive_on_downgrade: inner.allow_destructive_on_downgrade,
            not_required_from: &inner.not_required_from,
            multi_instance: inner.multi_instance,
        };
        let report = open::open_database(&mut conn, &inner.bundle, &options).await?;
        if inner.multi_instance {
            inner.tracker.prime_mirror(&mut conn).await;
        }
        drop(conn);

        self.start_background_tasks();
        info!(name = %inner.name, state = ?report.state(), "Database open");
        Ok(report)
    }

    fn start_background_tasks(&self) {
        let handle = self.inner.query_executor.handle();
        let mut tasks = Vec::new();
        if let Some(timeout) = self.inner.auto_close_timeout {
            tasks.push(spawn_auto_closer(&self.inner.connections, timeout, handle));
        }
        if self.inner.multi_instance {
            tasks.push(spawn_invalidation_poller(
                Arc::downgrade(&self.inner),
                self.inner.wake.clone(),
                self.inner.poll_interval,
                handle,
            ));
        }
        lock(&self.inner.tasks).extend(tasks);
    }

    /// Leases a connection for reading.
    pub async fn acquire(&self) -> Result<Lease> {
        self.ensure_open().await?;
        self.inner.connections.acquire().await
    }

    /// Starts a write transaction. Write transactions of one handle never
    /// overlap.
    pub async fn begin_write(&self) -> Result<WriteTransaction> {
        self.ensure_open().await?;
        let write = Arc::clone(&self.inner.write_lock).lock_owned().await;
        let (tx, guard) = self.inner.connections.begin().await?;
        Ok(WriteTransaction {
            tx,
            touched: BTreeSet::new(),
            db: self.clone(),
            _guard: guard,
            _write: write,
        })
    }

    /// Runs a read on the query executor.
    pub async fn run_query<T, Fut>(&self, query: Fut) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.query_executor.run(query).await
    }

    /// Queues a write on the transaction executor.
    pub fn submit_write<T, Fut>(&self, write: Fut) -> WriteTicket<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.is_closed() {
            return WriteTicket::failed(Error::Closed);
        }
        self.inner.transaction_executor.submit(write)
    }

    /// Registers an invalidation observer.
    pub fn subscribe(&self, observer: Arc<dyn InvalidationObserver>) -> Result<Subscription> {
        self.inner.tracker.subscribe(observer)
    }

    /// A stream running `query` now and after every change to `tables`.
    ///
    /// The subscription is registered before this returns; a name that is
    /// neither a table nor a view yields a single error.
    pub fn live_query<T, F, Fut>(&self, tables: &[&str], query: F) -> LiveQuery<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(1);
        let observer = observer_fn(tables.iter().copied(), move |_: &BTreeSet<String>| {
            // A full channel already holds a re-run.
            let _ = sender.try_send(());
        });
        let subscription = match self.inner.tracker.subscribe(Arc::new(observer)) {
            Ok(subscription) => subscription,
            Err(e) => return LiveQuery::failed(e),
        };
        let db = self.clone();
        LiveQuery::new(subscription, receiver, move || {
            let db = db.clone();
            let run = query();
            async move { db.run_query(run).await }
        })
    }

    /// Calls `callback` with every result of `query` until the returned
    /// observer is cancelled or dropped.
    pub fn observe<T, F>(&self, query: LiveQuery<T>, callback: F) -> QueryObserver
    where
        T: Send + 'static,
        F: Fn(Result<T>) + Send + Sync + 'static,
    {
        QueryObserver::spawn(self.inner.query_executor.handle(), query, callback)
    }

    /// Closes the database. Background tasks stop, the pool closes once its
    /// connections are returned, and the backing file may be opened by
    /// another handle. Later calls fail with [`Error::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        self.inner.connections.close().await;
        drop(lock(&self.inner.claim).take());
        info!(name = %self.inner.name, "Database closed");
    }
}

fn spawn_invalidation_poller(
    inner: Weak<Inner>,
    wake: Option<Arc<Notify>>,
    interval: Duration,
    handle: &Handle,
) -> AbortHandle {
    handle
        .spawn(async move {
            loop {
                match &wake {
                    Some(wake) => {
                        tokio::select! {
                            () = wake.notified() => {}
                            () = tokio::time::sleep(interval) => {}
                        }
                    }
                    None => tokio::time::sleep(interval).await,
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let mut conn = match inner.connections.acquire_if_open().await {
                    Ok(Some(conn)) => conn,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "Invalidation poll could not get a connection");
                        continue;
                    }
                };
                inner.tracker.sync_mirror(&mut conn).await;
                drop(conn);
                inner.tracker.refresh();
            }
            debug!("Invalidation poller stopped");
        })
        .abort_handle()
}

/// A write transaction.
///
/// Generated code runs its statements on [`WriteTransaction::connection`]
/// and marks every table it changed with [`WriteTransaction::touch`]. On
/// commit the touched tables are reported to the invalidation tracker;
/// dropping the transaction rolls it back and reports nothing.
pub struct WriteTransaction {
    tx: Transaction<'static, Sqlite>,
    touched: BTreeSet<String>,
    db: Database,
    _guard: ActiveGuard,
    _write: OwnedMutexGuard<()>,
}

impl WriteTransaction {
    /// Connection the transaction runs on.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Marks `table` as changed.
    pub fn touch(&mut self, table: &str) {
        self.touched.insert(table.to_string());
    }

    /// Tables marked so far.
    #[must_use]
    pub const fn touched(&self) -> &BTreeSet<String> {
        &self.touched
    }

    /// Commits and notifies observers of the touched tables.
    pub async fn commit(mut self) -> Result<()> {
        let mut versions = Vec::new();
        if self.db.inner.multi_instance {
            for table in &self.touched {
                let version: i64 = sqlx::query_scalar(BUMP_INVALIDATION_LOG)
                    .bind(table)
                    .fetch_one(&mut *self.tx)
                    .await?;
                versions.push((table.clone(), version));
            }
        }

        let Self {
            tx,
            touched,
            db,
            _guard: guard,
            _write: write,
        } = self;
        tx.commit().await?;
        drop(write);
        drop(guard);

        if !touched.is_empty() {
            debug!(tables = ?touched, "Committed write");
            let tracker = &db.inner.tracker;
            for (table, version) in &versions {
                tracker.record_mirror(table, *version);
            }
            tracker.notify(&touched);
            tracker.refresh();
            if let Some(claim) = lock(&db.inner.claim).as_ref() {
                claim.notify_others();
            }
        }
        Ok(())
    }

    /// Rolls back.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("touched", &self.touched)
            .finish_non_exhaustive()
    }
}
