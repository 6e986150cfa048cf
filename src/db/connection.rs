//! The database connection actor (component C1).
//!
//! One `Connection` owns exactly one SQLite file (or `:memory:`) and every
//! caller that needs to touch it — whether they're on the same OS thread or
//! not — goes through [`Connection::transaction`]. A [`ReentrantSemaphore`]
//! keyed on a caller-supplied token lets the same logical operation recurse
//! (a `save` that triggers related saves) without deadlocking on itself
//! while still serializing against every *other* token. Because the whole
//! call tree for one token runs synchronously to completion on a single
//! thread (this actor never awaits mid-transaction — callers invoke it from
//! `tokio::task::spawn_blocking` if they need to keep an async context
//! responsive), pairing the semaphore with a `parking_lot::ReentrantMutex`
//! around the underlying `rusqlite::Connection` is safe: the mutex only
//! ever re-enters from the thread that already holds it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use rusqlite::hooks::Action;

use crate::concurrency::{ChangeEvent, ChangeKind, Observer, ReentrantSemaphore};
use crate::error::{Error, Result};
use crate::settings::ResolvedSettings;

/// How many times a statement retries after `SQLITE_BUSY`/`SQLITE_LOCKED`
/// before giving up. At ~10us apiece this caps a single retry loop at ~9ms,
/// well past `busy_timeout`'s own window, for the rare case a writer holds
/// the file just past that window under contention.
const BUSY_RETRY_ATTEMPTS: u32 = 900;
const BUSY_RETRY_SLEEP: Duration = Duration::from_micros(10);

const PREPARED_STATEMENT_CACHE_CAPACITY: usize = 100;
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

struct HookState {
    pending_rows: Mutex<HashMap<(ChangeKind, String), Vec<u64>>>,
    touched_tables: Mutex<HashSet<String>>,
    row_observer: Observer,
    table_observer: Observer,
}

/// A single-file SQLite connection with re-entrant transactions, retrying
/// writers, and change notification.
pub struct Connection {
    inner: RwLock<Arc<ReentrantMutex<rusqlite::Connection>>>,
    interrupt_handle: RwLock<rusqlite::InterruptHandle>,
    semaphore: ReentrantSemaphore,
    hooks: Arc<HookState>,
    next_token: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    /// Open (creating if necessary) the database described by `settings`.
    pub fn open(settings: &ResolvedSettings) -> Result<Self> {
        let hooks = Arc::new(HookState {
            pending_rows: Mutex::new(HashMap::new()),
            touched_tables: Mutex::new(HashSet::new()),
            row_observer: Observer::new(CHANGE_CHANNEL_CAPACITY),
            table_observer: Observer::new(CHANGE_CHANNEL_CAPACITY),
        });

        let conn = Self::open_raw(settings, &hooks)?;
        let interrupt_handle = conn.get_interrupt_handle();

        Ok(Connection {
            inner: RwLock::new(Arc::new(ReentrantMutex::new(conn))),
            interrupt_handle: RwLock::new(interrupt_handle),
            semaphore: ReentrantSemaphore::new(),
            hooks,
            next_token: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    fn open_raw(settings: &ResolvedSettings, hooks: &Arc<HookState>) -> Result<rusqlite::Connection> {
        let mut conn = if settings.is_memory() {
            rusqlite::Connection::open_in_memory()?
        } else {
            if let Some(parent) = settings.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            rusqlite::Connection::open(&settings.path)?
        };

        if !settings.is_memory() {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.busy_timeout(Duration::from_millis(80))?;
        conn.set_prepared_statement_cache_capacity(PREPARED_STATEMENT_CACHE_CAPACITY);

        let hook_state = hooks.clone();
        conn.update_hook(Some(move |action: Action, _db: &str, table: &str, rowid: i64| {
            let kind = match action {
                Action::SQLITE_INSERT => ChangeKind::Created,
                Action::SQLITE_UPDATE => ChangeKind::Changed,
                Action::SQLITE_DELETE => ChangeKind::Deleted,
                _ => return,
            };
            let id = rowid as u64;

            let mut touched = hook_state.touched_tables.lock();
            if touched.insert(table.to_string()) {
                hook_state.table_observer.append(ChangeEvent {
                    table: table.to_string(),
                    kind,
                    ids: vec![id],
                });
            }
            drop(touched);

            hook_state
                .pending_rows
                .lock()
                .entry((kind, table.to_string()))
                .or_default()
                .push(id);
        }));

        Ok(conn)
    }

    /// Allocate a fresh token for a new top-level logical operation.
    /// Nested calls reuse the same token via the closure's own recursive
    /// `transaction` call.
    pub fn new_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub fn row_observer(&self) -> &Observer {
        &self.hooks.row_observer
    }

    pub fn table_observer(&self) -> &Observer {
        &self.hooks.table_observer
    }

    /// Run `action` inside a transaction (or, if `token` already holds one,
    /// a named `SAVEPOINT` nested within it). Commits/releases on `Ok`,
    /// rolls back on `Err`. Row- and table-change notifications are flushed
    /// once the outermost transaction for `token` has committed.
    pub fn transaction<F, T>(&self, token: u64, action: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DatabaseClosed);
        }
        self.semaphore.wait(token);
        let depth = self.semaphore.depth_for(token);

        let arc = self.inner.read().clone();
        let guard = arc.lock();

        let begin_result = if depth == 1 {
            retry_busy(|| guard.execute_batch("BEGIN IMMEDIATE"))
        } else {
            guard
                .execute_batch(&format!("SAVEPOINT sp_{depth}"))
                .map_err(Error::from)
        };

        let outcome = begin_result.and_then(|()| {
            let result = action(&guard);
            match &result {
                Ok(_) => {
                    if depth == 1 {
                        guard.execute_batch("COMMIT").map_err(Error::from)
                    } else {
                        guard
                            .execute_batch(&format!("RELEASE sp_{depth}"))
                            .map_err(Error::from)
                    }
                }
                Err(_) => {
                    let _ = if depth == 1 {
                        guard.execute_batch("ROLLBACK")
                    } else {
                        guard.execute_batch(&format!("ROLLBACK TO sp_{depth}; RELEASE sp_{depth}"))
                    };
                    Ok(())
                }
            }
            .and(result)
        });

        drop(guard);
        self.semaphore.signal(token);
        if self.semaphore.depth_for(token) == 0 && outcome.is_ok() {
            self.flush_pending();
        }
        outcome
    }

    /// Coalesce every row touched since the last flush into one event per
    /// `(kind, table)` pair on the row observer, and mark every touched
    /// table "settled" on the table observer. Called once the outermost
    /// transaction for a token commits — in a single-writer synchronous
    /// actor this achieves the same batching a timer-based debounce would,
    /// without needing a background timer thread.
    fn flush_pending(&self) {
        let drained: Vec<_> = self.hooks.pending_rows.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        let mut settled_kinds: HashMap<String, HashSet<ChangeKind>> = HashMap::new();
        for ((kind, table), ids) in drained {
            settled_kinds.entry(table.clone()).or_default().insert(kind);
            self.hooks.row_observer.append(ChangeEvent { table, kind, ids });
        }
        self.hooks.touched_tables.lock().clear();
        for (table, kinds) in settled_kinds {
            for kind in kinds {
                self.hooks.table_observer.append(ChangeEvent {
                    table: table.clone(),
                    kind,
                    ids: Vec::new(),
                });
            }
        }
    }

    /// Number of rows changed by the most recently executed statement.
    pub fn change_count(&self) -> i64 {
        self.inner.read().lock().changes() as i64
    }

    /// The engine's compiled-in bound-parameter ceiling
    /// (`SQLITE_LIMIT_VARIABLE_NUMBER`), used by the row encoder to size
    /// batched `INSERT` statements so a single commit never exceeds it.
    pub fn max_params(&self) -> usize {
        let guard = self.inner.read().clone();
        let conn = guard.lock();
        conn.limit(rusqlite::limits::Limit::SQLITE_LIMIT_VARIABLE_NUMBER)
            .max(1) as usize
    }

    /// Run `action` in its own top-level transaction with a freshly minted
    /// token — the "auto-commit" shape most one-off queries want, as
    /// opposed to `transaction`'s caller-supplied token for operations that
    /// must nest inside a larger unit of work.
    pub fn run<F, T>(&self, action: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T>,
    {
        let token = self.new_token();
        self.transaction(token, action)
    }

    /// Point this actor at a different file, closing the previous
    /// connection. Used when a caller relocates a `Cache`-keyed database,
    /// for instance.
    pub fn switch_file(&self, settings: &ResolvedSettings) -> Result<()> {
        self.reopen(settings)
    }

    /// Close the connection. Tries to acquire it within `wait`; if some
    /// long-running statement is still holding it, interrupts that
    /// statement and gives it one more `wait` window before giving up.
    /// Either way, every outstanding change-event listener is unblocked and
    /// `closed` is set, so every `transaction`/`run` call made afterwards
    /// surfaces `Error::DatabaseClosed` instead of touching the connection.
    pub fn close(&self, wait: Duration) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let arc = self.inner.read().clone();
        if arc.try_lock_for(wait).is_none() {
            self.interrupt_handle.read().interrupt();
            if arc.try_lock_for(wait).is_none() {
                self.hooks.row_observer.cancel_all();
                self.hooks.table_observer.cancel_all();
                return Err(Error::DatabaseClosed);
            }
        }
        self.hooks.row_observer.cancel_all();
        self.hooks.table_observer.cancel_all();
        Ok(())
    }

    /// Reopen a closed connection against `settings`, re-registering the
    /// `update_hook` on the fresh `rusqlite::Connection` and clearing
    /// `closed` so `transaction`/`run` work again. No-op on the hooks'
    /// listener state beyond that — `Observer`s are reused, not recreated,
    /// so callers that subscribed before `close` keep a valid (if
    /// already-cancelled) receiver and must resubscribe to see new events.
    pub fn reopen(&self, settings: &ResolvedSettings) -> Result<()> {
        let new_conn = Self::open_raw(settings, &self.hooks)?;
        let new_handle = new_conn.get_interrupt_handle();
        *self.inner.write() = Arc::new(ReentrantMutex::new(new_conn));
        *self.interrupt_handle.write() = new_handle;
        self.closed.store(false, Ordering::Release);
        Ok(())
    }
}

/// Retry `f` while it reports `SQLITE_BUSY`/`SQLITE_LOCKED`, on top of
/// whatever `busy_timeout` already covers, surfacing any other error (or
/// exhaustion) immediately.
fn retry_busy<F, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let mut last_err: Option<Error> = None;
    for _ in 0..BUSY_RETRY_ATTEMPTS {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) => {
                let wrapped = Error::from(e);
                if wrapped.is_busy_or_locked() {
                    last_err = Some(wrapped);
                    std::thread::sleep(BUSY_RETRY_SLEEP);
                    continue;
                }
                return Err(wrapped);
            }
        }
    }
    Err(last_err.unwrap_or(Error::QueryExecutionFailed("exhausted busy retries".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_connection() -> Connection {
        Connection::open(&ResolvedSettings::in_memory()).unwrap()
    }

    #[test]
    fn outermost_transaction_commits() {
        let conn = memory_connection();
        let token = conn.new_token();
        conn.transaction(token, |c| {
            c.execute_batch("CREATE TABLE t (id INTEGER)")?;
            c.execute("INSERT INTO t (id) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();

        let count: i64 = conn
            .transaction(conn.new_token(), |c| {
                Ok(c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn nested_transaction_uses_savepoint_and_rolls_back_independently() {
        let conn = memory_connection();
        let outer_token = conn.new_token();
        conn.transaction(outer_token, |c| {
            c.execute_batch("CREATE TABLE t (id INTEGER)")?;
            c.execute("INSERT INTO t (id) VALUES (1)", [])?;

            let nested: Result<()> = conn.transaction(outer_token, |c2| {
                c2.execute("INSERT INTO t (id) VALUES (2)", [])?;
                Err(Error::Internal("force rollback".into()))
            });
            assert!(nested.is_err());

            let count: i64 = c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?;
            assert_eq!(count, 1, "the nested insert must have been rolled back alone");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn row_observer_sees_coalesced_ids_after_commit() {
        let conn = memory_connection();
        let token = conn.new_token();
        conn.transaction(token, |c| {
            c.execute_batch("CREATE TABLE t (id INTEGER)")?;
            Ok(())
        })
        .unwrap();

        let mut rx = conn.row_observer().subscribe();
        conn.transaction(conn.new_token(), |c| {
            c.execute("INSERT INTO t (id) VALUES (1)", [])?;
            c.execute("INSERT INTO t (id) VALUES (2)", [])?;
            Ok(())
        })
        .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.ids.len(), 2);
    }

    #[test]
    fn change_count_reflects_last_statement() {
        let conn = memory_connection();
        conn.transaction(conn.new_token(), |c| {
            c.execute_batch("CREATE TABLE t (id INTEGER)")?;
            c.execute("INSERT INTO t (id) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(conn.change_count(), 1);
    }
}
