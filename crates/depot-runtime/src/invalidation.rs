//! Table invalidation tracking.
//!
//! Every committed write reports the tables it touched; the tracker bumps a
//! counter per table. A refresh pass compares the counters with what each
//! observer has seen and schedules the observer once, with the changed names
//! it subscribed to. Counters and registrations share one lock.
//!
//! With multi-instance invalidation, writes also bump a version row per table
//! in the `depot_invalidation_log` table; other handles re-read it on a wake
//! signal or a timer and treat every advanced version as a local change.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use depot_schema::DatabaseBundle;
use sqlx::SqliteConnection;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Name of the mirror table used by multi-instance invalidation.
pub const INVALIDATION_LOG_TABLE: &str = "depot_invalidation_log";

pub(crate) const CREATE_INVALIDATION_LOG: &str = "CREATE TABLE IF NOT EXISTS depot_invalidation_log \
     (table_name TEXT PRIMARY KEY NOT NULL, version INTEGER NOT NULL DEFAULT 0)";

pub(crate) const BUMP_INVALIDATION_LOG: &str = "INSERT INTO depot_invalidation_log (table_name, version) \
     VALUES (?, 1) ON CONFLICT(table_name) DO UPDATE SET version = version + 1 RETURNING version";

/// Locks a mutex, ignoring poisoning. Nothing guarded here is left
/// half-updated by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receives invalidation callbacks.
pub trait InvalidationObserver: Send + Sync + 'static {
    /// Tables or views observed.
    fn tables(&self) -> Vec<String>;

    /// Called with the observed names that changed.
    fn on_invalidated(&self, tables: &BTreeSet<String>);
}

/// Observer calling a closure.
pub struct FnObserver<F> {
    tables: Vec<String>,
    callback: F,
}

impl<F> InvalidationObserver for FnObserver<F>
where
    F: Fn(&BTreeSet<String>) + Send + Sync + 'static,
{
    fn tables(&self) -> Vec<String> {
        self.tables.clone()
    }

    fn on_invalidated(&self, tables: &BTreeSet<String>) {
        (self.callback)(tables);
    }
}

/// Builds an observer from a list of names and a closure.
pub fn observer_fn<F, S>(tables: impl IntoIterator<Item = S>, callback: F) -> FnObserver<F>
where
    F: Fn(&BTreeSet<String>) + Send + Sync + 'static,
    S: Into<String>,
{
    FnObserver {
        tables: tables.into_iter().map(Into::into).collect(),
        callback,
    }
}

static NEXT_GATE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DELIVERING: Cell<Option<u64>> = const { Cell::new(None) };
}

struct Delivering(Option<u64>);

impl Drop for Delivering {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(self.0));
    }
}

/// Serializes callbacks of one subscription against its cancellation.
///
/// Once [`CallbackGate::close`] returns, no callback runs and none will. A
/// callback closing its own gate does not wait for itself.
pub(crate) struct CallbackGate {
    id: u64,
    live: AtomicBool,
    running: Mutex<()>,
}

impl CallbackGate {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_GATE.fetch_add(1, Ordering::Relaxed),
            live: AtomicBool::new(true),
            running: Mutex::new(()),
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Runs `callback` unless the gate is closed.
    pub(crate) fn run(&self, callback: impl FnOnce()) -> bool {
        let _running = lock(&self.running);
        if !self.is_live() {
            return false;
        }
        let _delivering = Delivering(DELIVERING.with(|d| d.replace(Some(self.id))));
        callback();
        true
    }

    pub(crate) fn close(&self) {
        self.live.store(false, Ordering::SeqCst);
        if DELIVERING.with(Cell::get) == Some(self.id) {
            return;
        }
        drop(lock(&self.running));
    }
}

struct Entry {
    observer: Arc<dyn InvalidationObserver>,
    gate: Arc<CallbackGate>,
    /// Base table to the subscribed names it stands for.
    names: HashMap<String, BTreeSet<String>>,
    last_seen: HashMap<String, u64>,
    pending: BTreeSet<String>,
    scheduled: bool,
}

#[derive(Default)]
struct TrackerState {
    counters: HashMap<String, u64>,
    mirror_seen: HashMap<String, i64>,
    refresh_pending: bool,
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
}

/// Tracks table changes and notifies observers.
pub struct InvalidationTracker {
    bundle: Arc<DatabaseBundle>,
    handle: Option<Handle>,
    state: Mutex<TrackerState>,
}

impl fmt::Debug for InvalidationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InvalidationTracker")
            .field("observers", &state.entries.len())
            .field("refresh_pending", &state.refresh_pending)
            .finish_non_exhaustive()
    }
}

impl InvalidationTracker {
    /// Creates a tracker for the tables and views of `bundle`. Callbacks run
    /// on `handle`, or inline on the refreshing thread without one.
    #[must_use]
    pub fn new(bundle: Arc<DatabaseBundle>, handle: Option<Handle>) -> Self {
        Self {
            bundle,
            handle,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Registers an observer.
    ///
    /// The counters are snapshotted before the subscription becomes visible,
    /// so any change committed after this call returns is delivered.
    pub fn subscribe(self: &Arc<Self>, observer: Arc<dyn InvalidationObserver>) -> Result<Subscription> {
        let mut names: HashMap<String, BTreeSet<String>> = HashMap::new();
        for name in observer.tables() {
            let tables = self
                .bundle
                .resolve_tables(&name)
                .ok_or_else(|| Error::UnknownTable(name.clone()))?;
            for table in tables {
                names
                    .entry(table.to_ascii_lowercase())
                    .or_default()
                    .insert(name.clone());
            }
        }

        let gate = Arc::new(CallbackGate::new());
        let mut state = lock(&self.state);
        let last_seen = names
            .keys()
            .map(|table| (table.clone(), state.counters.get(table).copied().unwrap_or(0)))
            .collect();
        let id = state.next_id;
        state.next_id += 1;
        debug!(id, tables = ?names.keys().collect::<Vec<_>>(), "Observer subscribed");
        state.entries.insert(
            id,
            Entry {
                observer,
                gate: Arc::clone(&gate),
                names,
                last_seen,
                pending: BTreeSet::new(),
                scheduled: false,
            },
        );
        Ok(Subscription {
            tracker: Arc::downgrade(self),
            id,
            gate,
        })
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        lock(&self.state).entries.len()
    }

    /// Records that `tables` changed. Observers learn about it on the next
    /// [`InvalidationTracker::refresh`].
    pub fn notify<S: AsRef<str>>(&self, tables: impl IntoIterator<Item = S>) {
        let mut state = lock(&self.state);
        for table in tables {
            *state
                .counters
                .entry(table.as_ref().to_ascii_lowercase())
                .or_insert(0) += 1;
            state.refresh_pending = true;
        }
    }

    /// Compares counters with each observer's snapshot and schedules the
    /// observers that missed a change.
    pub fn refresh(self: &Arc<Self>) {
        let ready = {
            let mut state = lock(&self.state);
            if !state.refresh_pending {
                return;
            }
            state.refresh_pending = false;
            let TrackerState {
                counters, entries, ..
            } = &mut *state;

            let mut ready = Vec::new();
            for (id, entry) in entries.iter_mut() {
                for (table, seen) in &mut entry.last_seen {
                    let current = counters.get(table).copied().unwrap_or(0);
                    if current > *seen {
                        *seen = current;
                        if let Some(names) = entry.names.get(table) {
                            entry.pending.extend(names.iter().cloned());
                        }
                    }
                }
                if !entry.pending.is_empty() && !entry.scheduled {
                    entry.scheduled = true;
                    ready.push(*id);
                }
            }
            ready
        };

        for id in ready {
            let tracker = Arc::clone(self);
            match &self.handle {
                Some(handle) => {
                    handle.spawn(async move { tracker.deliver(id) });
                }
                None => tracker.deliver(id),
            }
        }
    }

    /// Runs the observer until nothing is pending for it.
    fn deliver(&self, id: u64) {
        loop {
            let (observer, gate, tables) = {
                let mut state = lock(&self.state);
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                if entry.pending.is_empty() {
                    entry.scheduled = false;
                    return;
                }
                (
                    Arc::clone(&entry.observer),
                    Arc::clone(&entry.gate),
                    std::mem::take(&mut entry.pending),
                )
            };
            gate.run(|| observer.on_invalidated(&tables));
        }
    }

    fn unsubscribe(&self, id: u64) {
        if lock(&self.state).entries.remove(&id).is_some() {
            debug!(id, "Observer unsubscribed");
        }
    }

    /// Records a mirror version written by this handle, so the next sync
    /// does not report it again.
    pub(crate) fn record_mirror(&self, table: &str, version: i64) {
        let mut state = lock(&self.state);
        let seen = state
            .mirror_seen
            .entry(table.to_ascii_lowercase())
            .or_insert(0);
        *seen = (*seen).max(version);
    }

    /// Reads the mirror table and records every advanced version as a
    /// change. A failed read counts as no change.
    pub(crate) async fn sync_mirror(&self, conn: &mut SqliteConnection) {
        self.read_mirror(conn, true).await;
    }

    /// Reads the mirror table without reporting changes.
    pub(crate) async fn prime_mirror(&self, conn: &mut SqliteConnection) {
        self.read_mirror(conn, false).await;
    }

    async fn read_mirror(&self, conn: &mut SqliteConnection, report: bool) {
        let rows: Vec<(String, i64)> =
            match sqlx::query_as("SELECT table_name, version FROM depot_invalidation_log")
                .fetch_all(conn)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "Failed to read the invalidation log, assuming no change");
                    return;
                }
            };

        let mut state = lock(&self.state);
        let TrackerState {
            counters,
            mirror_seen,
            refresh_pending,
            ..
        } = &mut *state;
        for (table, version) in rows {
            let table = table.to_ascii_lowercase();
            let seen = mirror_seen.entry(table.clone()).or_insert(0);
            if version > *seen {
                *seen = version;
                if report {
                    debug!(table = %table, version, "Table changed in another instance");
                    *counters.entry(table).or_insert(0) += 1;
                    *refresh_pending = true;
                }
            }
        }
    }
}

/// A registered observer. Dropping it unsubscribes.
pub struct Subscription {
    tracker: Weak<InvalidationTracker>,
    id: u64,
    gate: Arc<CallbackGate>,
}

impl Subscription {
    /// Unsubscribes. No callback runs after this returns, unless called from
    /// within the observer's own callback, which completes.
    pub fn cancel(&self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.unsubscribe(self.id);
        }
        self.gate.close();
    }

    /// Returns false once cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.gate.is_live()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;

    use depot_schema::{Affinity, Entity, Field, View};

    use super::*;

    fn bundle() -> Arc<DatabaseBundle> {
        let word = Entity::new("word_table")
            .field(Field::new("word", Affinity::Text).not_null())
            .primary_key(&["word"]);
        let tag = Entity::new("tag")
            .field(Field::new("name", Affinity::Text).not_null())
            .primary_key(&["name"]);
        let view = View::new("short_words", "SELECT word FROM word_table WHERE length(word) < 5")
            .reads("word_table");
        Arc::new(DatabaseBundle::new(1, vec![word, tag], vec![view]).unwrap())
    }

    fn tracker() -> Arc<InvalidationTracker> {
        Arc::new(InvalidationTracker::new(bundle(), None))
    }

    type Log = Arc<Mutex<Vec<BTreeSet<String>>>>;

    fn recording(tables: &[&str]) -> (Arc<dyn InvalidationObserver>, Log) {
        let log: Log = Arc::default();
        let sink = Arc::clone(&log);
        let observer = observer_fn(tables.iter().copied(), move |changed: &BTreeSet<String>| {
            sink.lock().unwrap().push(changed.clone());
        });
        (Arc::new(observer), log)
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_notify_then_refresh() {
        let tracker = tracker();
        let (observer, log) = recording(&["word_table"]);
        let _subscription = tracker.subscribe(observer).unwrap();

        tracker.notify(["word_table"]);
        assert!(log.lock().unwrap().is_empty(), "nothing before refresh");
        tracker.refresh();
        assert_eq!(*log.lock().unwrap(), vec![set(&["word_table"])]);

        // A refresh without changes delivers nothing.
        tracker.refresh();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_one_delivery_per_refresh() {
        let tracker = tracker();
        let (observer, log) = recording(&["word_table", "tag"]);
        let _subscription = tracker.subscribe(observer).unwrap();

        tracker.notify(["word_table"]);
        tracker.notify(["word_table", "TAG"]);
        tracker.refresh();
        assert_eq!(*log.lock().unwrap(), vec![set(&["tag", "word_table"])]);
    }

    #[test]
    fn test_unrelated_tables_ignored() {
        let tracker = tracker();
        let (observer, log) = recording(&["tag"]);
        let _subscription = tracker.subscribe(observer).unwrap();
        tracker.notify(["word_table"]);
        tracker.refresh();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_view_reports_view_name() {
        let tracker = tracker();
        let (observer, log) = recording(&["short_words"]);
        let _subscription = tracker.subscribe(observer).unwrap();
        tracker.notify(["word_table"]);
        tracker.refresh();
        assert_eq!(*log.lock().unwrap(), vec![set(&["short_words"])]);
    }

    #[test]
    fn test_changes_before_subscribe_not_reported() {
        let tracker = tracker();
        tracker.notify(["word_table"]);
        let (observer, log) = recording(&["word_table"]);
        let _subscription = tracker.subscribe(observer).unwrap();
        tracker.refresh();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_table() {
        let tracker = tracker();
        let (observer, _) = recording(&["missing"]);
        match tracker.subscribe(observer) {
            Err(Error::UnknownTable(name)) => assert_eq!(name, "missing"),
            other => panic!("expected an unknown table error, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let tracker = tracker();
        let (observer, log) = recording(&["word_table"]);
        let subscription = tracker.subscribe(observer).unwrap();
        assert_eq!(tracker.observer_count(), 1);

        subscription.cancel();
        assert!(!subscription.is_active());
        assert_eq!(tracker.observer_count(), 0);
        tracker.notify(["word_table"]);
        tracker.refresh();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pending_callback_suppresses_duplicate() {
        let tracker = tracker();
        let calls = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicBool::new(false));
        let handle: Arc<OnceLock<Arc<InvalidationTracker>>> = Arc::default();

        let observer = {
            let calls = Arc::clone(&calls);
            let in_flight = Arc::clone(&in_flight);
            let handle = Arc::clone(&handle);
            observer_fn(["word_table"], move |_: &BTreeSet<String>| {
                assert!(!in_flight.swap(true, Ordering::SeqCst), "concurrent delivery");
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    // A write landing while the callback runs.
                    let tracker = handle.get().unwrap();
                    tracker.notify(["word_table"]);
                    tracker.refresh();
                }
                in_flight.store(false, Ordering::SeqCst);
            })
        };
        let _subscription = tracker.subscribe(Arc::new(observer)).unwrap();
        handle.set(Arc::clone(&tracker)).ok();

        tracker.notify(["word_table"]);
        tracker.refresh();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_from_own_callback() {
        let tracker = tracker();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            observer_fn(["tag"], move |_: &BTreeSet<String>| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(subscription) = slot.lock().unwrap().as_ref() {
                    subscription.cancel();
                }
            })
        };
        let subscription = tracker.subscribe(Arc::new(observer)).unwrap();
        *slot.lock().unwrap() = Some(subscription);

        tracker.notify(["tag"]);
        tracker.refresh();
        tracker.notify(["tag"]);
        tracker.refresh();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_mirror_sync() {
        use sqlx::Connection;

        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::query(CREATE_INVALIDATION_LOG)
            .execute(&mut conn)
            .await
            .unwrap();
        let bump = |table: &'static str| sqlx::query_scalar::<_, i64>(BUMP_INVALIDATION_LOG).bind(table);

        assert_eq!(bump("word_table").fetch_one(&mut conn).await.unwrap(), 1);
        let tracker = tracker();
        tracker.prime_mirror(&mut conn).await;

        let (observer, log) = recording(&["word_table"]);
        let _subscription = tracker.subscribe(observer).unwrap();
        tracker.sync_mirror(&mut conn).await;
        tracker.refresh();
        assert!(log.lock().unwrap().is_empty(), "primed version is not a change");

        assert_eq!(bump("word_table").fetch_one(&mut conn).await.unwrap(), 2);
        tracker.sync_mirror(&mut conn).await;
        tracker.refresh();
        assert_eq!(*log.lock().unwrap(), vec![set(&["word_table"])]);

        // Versions written by this handle are not reported back.
        let version = bump("word_table").fetch_one(&mut conn).await.unwrap();
        tracker.record_mirror("word_table", version);
        tracker.sync_mirror(&mut conn).await;
        tracker.refresh();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mirror_read_failure_is_no_change() {
        use sqlx::Connection;

        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let tracker = tracker();
        let (observer, log) = recording(&["word_table"]);
        let _subscription = tracker.subscribe(observer).unwrap();
        tracker.sync_mirror(&mut conn).await;
        tracker.refresh();
        assert!(log.lock().unwrap().is_empty());
    }
}
