//! Identity manager (component C8).
//!
//! The process-wide coordinator: it owns one [`db::Connection`] per shared
//! database file, runs the migration planner on first contact with a table,
//! and is the only place a [`Model`] gets materialized or persisted. Every
//! cache-first guarantee in spec.md §3.3 ("at most one live representative
//! per `(type, id)`") lives here.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::codec;
use crate::db::Connection;
use crate::error::{Error, Result};
use crate::id::AutoId;
use crate::row::{Row, Table};
use crate::schema::{self, TableSchema};
use crate::settings::SettingsRegistry;
use crate::value::Value;

/// The reference-typed wrapper around a cached [`Table`] value (spec.md §9
/// "identity vs. value semantics"). An `Arc` for shared ownership plus a
/// `parking_lot::RwLock` for interior mutability lets the same instance be
/// handed to many callers while staying mutable in place. Cache entries
/// hold only a [`Weak`] of this, so the identity collapses the moment the
/// last external `Arc` is dropped (spec.md §3.4).
pub type Model<T> = Arc<RwLock<T>>;

/// Debounce window for `save_changes_later` (spec.md §4.7).
const SAVE_LATER_DEBOUNCE: Duration = Duration::from_secs(3);
/// Debounce window for `delete_later`'s consolidated flush (spec.md §4.7).
const DELETE_LATER_DEBOUNCE: Duration = Duration::from_secs(10);

/// Bind `AutoId`s (`u64`) the same way the write path does (codec.rs): as the
/// bit-pattern of an `i64`. Handing `&u64` straight to rusqlite's `ToSql`
/// rejects anything past `i64::MAX`, which would make an id of `u64::MAX`
/// fail to round-trip through `delete`/`flush_delete_later` even though it
/// inserted fine.
fn bind_ids(ids: &[AutoId]) -> Vec<i64> {
    ids.iter().map(|&id| id as i64).collect()
}

struct TableInfo {
    schema: TableSchema,
    connection: Arc<Connection>,
}

/// Per-type cache and change-set bookkeeping (spec.md §4.7). Kept
/// type-erased inside [`ManagerInner`] behind `Arc<dyn Any + Send + Sync>`
/// and downcast back to `Cache<T>` by the handful of methods that touch it.
struct Cache<T: Table> {
    entries: DashMap<AutoId, Weak<RwLock<T>>>,
    changed: DashMap<AutoId, Model<T>>,
    created: DashSet<AutoId>,
    deleted: DashSet<AutoId>,
    delete_later: DashSet<AutoId>,
    save_later_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    delete_later_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: Table> Default for Cache<T> {
    fn default() -> Self {
        Cache {
            entries: DashMap::new(),
            changed: DashMap::new(),
            created: DashSet::new(),
            deleted: DashSet::new(),
            delete_later: DashSet::new(),
            save_later_task: Mutex::new(None),
            delete_later_task: Mutex::new(None),
        }
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct ManagerInner {
    registry: SettingsRegistry,
    shared_dbs: DashMap<String, Arc<Connection>>,
    tables: DashMap<TypeId, Arc<TableInfo>>,
    caches: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Serializes `setup_db` end to end. Spec.md §4.7 describes a narrower
    /// window (released once the migration transaction begins so unrelated
    /// tables can start setting up concurrently on the same connection);
    /// this crate holds it for the whole call, trading a little setup-time
    /// concurrency for a much simpler "open-then-migrate" critical section.
    /// See DESIGN.md.
    setup_lock: tokio::sync::Mutex<()>,
    /// One save-everything closure per type, registered the first time
    /// `setup_db::<T>()` runs, so `save_all_changes` can iterate every type
    /// that has ever been set up without the manager needing to be generic
    /// over every entity type in the program.
    flushers: DashMap<TypeId, Arc<dyn Fn(Manager) -> BoxFuture + Send + Sync>>,
    /// Type names for `flushers`/`tables`, purely for diagnostics
    /// (migration logging, `save_all_changes` error context).
    type_names: DashMap<TypeId, &'static str>,
}

/// The process-wide coordinator. Cheap to clone — every clone shares the
/// same `Arc<ManagerInner>`.
#[derive(Clone)]
pub struct Manager(Arc<ManagerInner>);

static GLOBAL: OnceCell<Manager> = OnceCell::new();

impl Manager {
    /// Construct a fresh, isolated manager (spec.md §9 "treat it as an
    /// injectable service ... so tests can run isolated instances").
    pub fn new(registry: SettingsRegistry) -> Manager {
        Manager(Arc::new(ManagerInner {
            registry,
            shared_dbs: DashMap::new(),
            tables: DashMap::new(),
            caches: DashMap::new(),
            setup_lock: tokio::sync::Mutex::new(()),
            flushers: DashMap::new(),
            type_names: DashMap::new(),
        }))
    }

    /// The lazily-constructed process-wide singleton (spec.md §9: "the
    /// production default is a lazily-constructed global"). Initialized
    /// from the platform's default app/cache directories on first use.
    pub fn global() -> &'static Manager {
        GLOBAL.get_or_init(|| Manager::new(SettingsRegistry::from_platform_defaults("ormkit")))
    }

    fn cache<T: Table>(&self) -> Arc<Cache<T>> {
        let type_id = TypeId::of::<T>();
        self.0
            .caches
            .entry(type_id)
            .or_insert_with(|| Arc::new(Cache::<T>::default()) as Arc<dyn Any + Send + Sync>)
            .clone()
            .downcast::<Cache<T>>()
            .expect("cache type mismatch for TypeId — impossible without unsafe code elsewhere")
    }

    fn table_info<T: Table>(&self) -> Result<Arc<TableInfo>> {
        self.0
            .tables
            .get(&TypeId::of::<T>())
            .map(|e| e.clone())
            .ok_or_else(|| Error::MissingSetup(T::table_name().to_string()))
    }

    /// Derive `T`'s target schema, open (or reuse) the connection for its
    /// settings key, and run the migration planner against it. Idempotent
    /// and safe to call from many tasks concurrently — only the first
    /// caller for a given type does any work (spec.md §4.7).
    pub async fn setup_db<T: Table>(&self) -> Result<()> {
        let type_id = TypeId::of::<T>();
        if self.0.tables.contains_key(&type_id) {
            return Ok(());
        }

        let _guard = self.0.setup_lock.lock().await;
        if self.0.tables.contains_key(&type_id) {
            return Ok(());
        }

        let schema = TableSchema {
            name: T::table_name().to_string(),
            columns: T::columns(),
            indexes: T::indexes(),
            unique_indexes: T::unique_indexes(),
            settings_key: T::settings_key(),
        };

        let resolved = self.0.registry.resolve(&T::settings_key(), T::file_name());
        let db_key = format!("{}#{}", resolved.path.display(), T::file_name());
        let connection = match self.0.shared_dbs.get(&db_key) {
            Some(existing) => existing.clone(),
            None => {
                let opened = Arc::new(Connection::open(&resolved)?);
                self.0.shared_dbs.insert(db_key, opened.clone());
                opened
            }
        };

        let schema_for_migration = schema.clone();
        let conn_for_migration = connection.clone();
        tracing::info!(table = %schema.name, "running schema migration");
        tokio::task::spawn_blocking(move || {
            conn_for_migration.run(|c| {
                schema::run_migration(c, &schema_for_migration, Some(&T::migrate)).map(|states| {
                    for state in &states {
                        tracing::info!(table = %schema_for_migration.name, ?state, "migration step");
                    }
                })
            })
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

        self.0.tables.insert(type_id, Arc::new(TableInfo { schema, connection }));
        self.0.type_names.insert(type_id, T::table_name());
        self.0
            .caches
            .entry(type_id)
            .or_insert_with(|| Arc::new(Cache::<T>::default()) as Arc<dyn Any + Send + Sync>);
        self.0.flushers.entry(type_id).or_insert_with(|| {
            Arc::new(|m: Manager| -> BoxFuture { Box::pin(async move { m.save_changes::<T>().await }) })
        });
        Ok(())
    }

    /// Look up (or publish) an already-cached, still-alive [`Model`] for
    /// `id`. Performs the weak-map cleanup pass in passing — a dead entry
    /// found along the way is removed rather than left for a future sweep.
    fn get_cached<T: Table>(cache: &Cache<T>, id: AutoId) -> Option<Model<T>> {
        match cache.entries.get(&id).and_then(|w| w.upgrade()) {
            Some(model) => Some(model),
            None => {
                cache.entries.remove(&id);
                None
            }
        }
    }

    /// Atomically publish `entity` into the cache unless another caller
    /// already published a still-alive instance for the same id first — in
    /// which case that instance wins and `entity` is discarded (spec.md
    /// §3.3: "new materializations must atomically publish into the
    /// cache", "cached entries are not overwritten on refetch").
    fn publish<T: Table>(cache: &Cache<T>, id: AutoId, entity: T) -> Model<T> {
        let candidate = Arc::new(RwLock::new(entity));
        let mut winner = candidate.clone();
        cache
            .entries
            .entry(id)
            .and_modify(|existing| {
                if let Some(alive) = existing.upgrade() {
                    winner = alive;
                } else {
                    *existing = Arc::downgrade(&candidate);
                }
            })
            .or_insert_with(|| Arc::downgrade(&candidate));
        winner
    }

    /// Create (or resolve) a `Model<T>` for `id`. `None` allocates a fresh
    /// id via [`crate::id::generate_id`]. An id already cache-resident or
    /// present in storage is fetched instead of overwritten (spec.md §3.4).
    pub async fn create<T: Table + Default>(&self, id: Option<AutoId>) -> Result<Model<T>> {
        self.setup_db::<T>().await?;
        let cache = self.cache::<T>();

        if let Some(id) = id {
            if let Some(cached) = Self::get_cached(&cache, id) {
                return Ok(cached);
            }
            if let Some(model) = self.fetch_id_opt::<T>(id).await? {
                return Ok(model);
            }
            let mut fresh = T::default();
            fresh.set_id(id);
            let model = Self::publish(&cache, id, fresh);
            cache.created.insert(id);
            return Ok(model);
        }

        let new_id = crate::id::generate_id();
        let mut fresh = T::default();
        fresh.set_id(new_id);
        let model = Self::publish(&cache, new_id, fresh);
        cache.created.insert(new_id);
        Ok(model)
    }

    /// Fetch a single id, raising [`Error::MissingId`] if it's `0`, deleted
    /// or absent from storage.
    pub async fn fetch_id<T: Table>(&self, id: AutoId) -> Result<Model<T>> {
        self.fetch_id_opt::<T>(id).await?.ok_or(Error::MissingId)
    }

    async fn fetch_id_opt<T: Table>(&self, id: AutoId) -> Result<Option<Model<T>>> {
        if crate::id::is_unset(id) {
            return Ok(None);
        }
        Ok(self.fetch_ids::<T>(&[id]).await?.into_iter().next())
    }

    /// Batch-fetch many ids. Cache hits resolve immediately; misses are
    /// loaded via a single `SELECT ... WHERE id IN (...)`, published into
    /// the cache, and the result is ordered to match `ids` (spec.md §2).
    /// Ids in the deleted set or equal to `0` are silently dropped rather
    /// than erroring — only [`Manager::fetch_id`] raises `MissingId` for a
    /// single absent id.
    pub async fn fetch_ids<T: Table>(&self, ids: &[AutoId]) -> Result<Vec<Model<T>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.setup_db::<T>().await?;
        let info = self.table_info::<T>()?;
        let cache = self.cache::<T>();

        let mut by_position: Vec<Option<Model<T>>> = vec![None; ids.len()];
        let mut missing: Vec<AutoId> = Vec::new();

        for (i, &id) in ids.iter().enumerate() {
            if crate::id::is_unset(id) || cache.deleted.contains(&id) {
                continue;
            }
            match Self::get_cached(&cache, id) {
                Some(model) => by_position[i] = Some(model),
                None => missing.push(id),
            }
        }
        missing.sort_unstable();
        missing.dedup();

        if !missing.is_empty() {
            let schema = info.schema.clone();
            let connection = info.connection.clone();
            let rows = tokio::task::spawn_blocking(move || {
                connection.run(|c| codec::select_by_ids(c, &schema, &missing))
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;

            let mut by_id: HashMap<AutoId, Row> = HashMap::new();
            for row in rows {
                if let Some(Ok(id)) = row.get("id").map(Value::as_u64) {
                    by_id.insert(id, row);
                }
            }

            for (i, &id) in ids.iter().enumerate() {
                if by_position[i].is_some() || crate::id::is_unset(id) || cache.deleted.contains(&id)
                {
                    continue;
                }
                if let Some(row) = by_id.get(&id) {
                    let entity = T::from_row(row)?;
                    by_position[i] = Some(Self::publish(&cache, id, entity));
                }
            }
        }

        Ok(by_position.into_iter().flatten().collect())
    }

    /// Run a raw SQL predicate (no `LIMIT`/`OFFSET` management — that's
    /// `relations::RelationQuery`'s job) against `T`'s table and resolve
    /// every matching id through the identity cache, so a row already
    /// cache-resident comes back as that same `Model` (spec.md end-to-end
    /// scenario 1).
    pub async fn fetch_query<T: Table>(&self, predicate: &str, args: Vec<Value>) -> Result<Vec<Model<T>>> {
        self.setup_db::<T>().await?;
        let info = self.table_info::<T>()?;
        let schema = info.schema.clone();
        let connection = info.connection.clone();
        let predicate = predicate.to_string();

        let rows = tokio::task::spawn_blocking(move || {
            connection.run(|c| codec::select_where(c, &schema, &predicate, &args))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

        let ids: Vec<AutoId> = rows
            .iter()
            .filter_map(|r| r.get("id").map(Value::as_u64))
            .filter_map(std::result::Result::ok)
            .collect();
        self.fetch_ids::<T>(&ids).await
    }

    /// Mark `model` as having unsaved changes, holding a strong reference
    /// until the next `save_changes`/`save_list`/`save_all_changes` flush
    /// (spec.md §3.3 "pending-save safety"). Relation setters and any
    /// application mutation path should call this after mutating a model
    /// in place.
    pub fn mark_changed<T: Table>(&self, model: &Model<T>) {
        let cache = self.cache::<T>();
        let id = model.read().id();
        if cache.deleted.contains(&id) {
            return;
        }
        cache.changed.insert(id, model.clone());
    }

    /// Persist exactly the given models, splitting them into the
    /// "created" (plain `INSERT`) and "updated" (`INSERT OR REPLACE`)
    /// subsets per spec.md §4.7. Entities whose id is in the deleted set
    /// are silently dropped (spec.md §3.3 "deleted monotonicity").
    pub async fn save_list<T: Table>(&self, models: &[Model<T>]) -> Result<()> {
        self.setup_db::<T>().await?;
        let info = self.table_info::<T>()?;
        let cache = self.cache::<T>();

        let mut created_rows = Vec::new();
        let mut created_ids = Vec::new();
        let mut updated_rows = Vec::new();
        let mut updated_ids = Vec::new();

        for model in models {
            let guard = model.read();
            let id = guard.id();
            if cache.deleted.contains(&id) {
                continue;
            }
            if cache.created.contains(&id) {
                created_rows.push(guard.to_row());
                created_ids.push(id);
            } else {
                updated_rows.push(guard.to_row());
                updated_ids.push(id);
            }
        }

        if created_rows.is_empty() && updated_rows.is_empty() {
            return Ok(());
        }

        let schema = info.schema.clone();
        let connection = info.connection.clone();
        tokio::task::spawn_blocking(move || {
            connection.run(|c| {
                if !updated_rows.is_empty() {
                    codec::upsert_rows(c, &schema, &updated_rows)?;
                }
                if !created_rows.is_empty() {
                    if let Err(e) = codec::insert_rows(c, &schema, &created_rows) {
                        if e.is_unique_violation() {
                            let conflicts = codec::diagnose_unique_conflicts(c, &schema, &created_rows)?;
                            return Err(Error::UniqueConstraintFailed(conflicts));
                        }
                        return Err(e);
                    }
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

        for id in updated_ids {
            cache.changed.remove(&id);
        }
        for id in created_ids {
            cache.changed.remove(&id);
            cache.created.remove(&id);
        }
        Ok(())
    }

    /// Flush any ids queued by [`Manager::delete_later`], then save every
    /// entity currently in the changed-set (spec.md §4.7).
    pub async fn save_changes<T: Table>(&self) -> Result<()> {
        self.flush_delete_later::<T>().await?;
        let cache = self.cache::<T>();
        let pending: Vec<Model<T>> = cache.changed.iter().map(|e| e.value().clone()).collect();
        if pending.is_empty() {
            return Ok(());
        }
        self.save_list(&pending).await
    }

    /// Schedule `save_changes::<T>()` after a ~3s debounce window,
    /// cancelling whatever call this one supersedes (spec.md §4.7). The
    /// source neither awaits nor guarantees this runs before process exit
    /// — callers that need a durable flush before shutdown should call
    /// `save_changes` directly (spec.md §9 open question).
    pub fn save_changes_later<T: Table>(&self) {
        let cache = self.cache::<T>();
        let manager = self.clone();
        let mut guard = cache.save_later_task.lock();
        if let Some(existing) = guard.take() {
            existing.abort();
        }
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(SAVE_LATER_DEBOUNCE).await;
            if let Err(error) = manager.save_changes::<T>().await {
                tracing::warn!(?error, "debounced save_changes failed");
            }
        }));
    }

    /// Iterate every type that has ever called `setup_db`, flushing its
    /// pending changes. Errors are accumulated and the last one is
    /// rethrown once every type has had a chance to flush (spec.md §4.7,
    /// §7: "collects errors across types and rethrows the last one").
    pub async fn save_all_changes(&self) -> Result<()> {
        let flushers: Vec<_> = self
            .0
            .flushers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut last_error = None;
        for (type_id, flush) in flushers {
            if let Err(error) = flush(self.clone()).await {
                let name = self.0.type_names.get(&type_id).map(|n| *n).unwrap_or("<unknown>");
                tracing::error!(table = name, ?error, "save_all_changes: flush failed");
                last_error = Some(error);
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Mark `ids` deleted and issue the `DELETE` immediately (spec.md
    /// §4.7). Once an id is in the deleted set, future `save` calls for it
    /// are silent no-ops and fetches raise `MissingId`.
    pub async fn delete<T: Table>(&self, ids: &[AutoId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.setup_db::<T>().await?;
        let info = self.table_info::<T>()?;
        let cache = self.cache::<T>();
        for &id in ids {
            cache.deleted.insert(id);
            cache.changed.remove(&id);
            cache.created.remove(&id);
        }

        let schema = info.schema.clone();
        let connection = info.connection.clone();
        let ids = ids.to_vec();
        tokio::task::spawn_blocking(move || {
            connection.run(|c| {
                c.execute(
                    &format!(
                        "DELETE FROM `{}` WHERE id IN ({})",
                        schema.name,
                        crate::row::question_marks(ids.len())
                    ),
                    rusqlite::params_from_iter(bind_ids(&ids)),
                )
                .map_err(Error::from)
            })
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
        Ok(())
    }

    /// Mark `ids` deleted immediately (so they behave as deleted to every
    /// other manager call right away) but defer the actual `DELETE` to a
    /// consolidated background flush ~10s out (spec.md §4.7).
    pub fn delete_later<T: Table>(&self, ids: &[AutoId]) {
        if ids.is_empty() {
            return;
        }
        let cache = self.cache::<T>();
        for &id in ids {
            cache.deleted.insert(id);
            cache.delete_later.insert(id);
            cache.changed.remove(&id);
            cache.created.remove(&id);
        }

        let manager = self.clone();
        let mut guard = cache.delete_later_task.lock();
        if let Some(existing) = guard.take() {
            existing.abort();
        }
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(DELETE_LATER_DEBOUNCE).await;
            if let Err(error) = manager.save_all_changes().await {
                tracing::warn!(?error, "delete_later's consolidated save_all_changes failed");
            }
        }));
    }

    async fn flush_delete_later<T: Table>(&self) -> Result<()> {
        let cache = self.cache::<T>();
        let pending: Vec<AutoId> = cache.delete_later.iter().map(|e| *e).collect();
        if pending.is_empty() {
            return Ok(());
        }
        self.setup_db::<T>().await?;
        let info = self.table_info::<T>()?;
        let schema = info.schema.clone();
        let connection = info.connection.clone();
        let ids = pending.clone();
        tokio::task::spawn_blocking(move || {
            connection.run(|c| {
                c.execute(
                    &format!(
                        "DELETE FROM `{}` WHERE id IN ({})",
                        schema.name,
                        crate::row::question_marks(ids.len())
                    ),
                    rusqlite::params_from_iter(bind_ids(&ids)),
                )
                .map_err(Error::from)
            })
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
        for id in pending {
            cache.delete_later.remove(&id);
        }
        Ok(())
    }

    /// Whether `id` is (already) marked deleted for `T` — used by
    /// `relations::RelationQuery`'s change-observer callback to drop items
    /// that vanished underneath it.
    pub fn is_deleted<T: Table>(&self, id: AutoId) -> bool {
        self.cache::<T>().deleted.contains(&id)
    }

    /// Access to `T`'s underlying connection, for subsystems that need to
    /// subscribe to change notifications directly (`fts`, `relations`).
    pub(crate) fn connection_for<T: Table>(&self) -> Result<Arc<Connection>> {
        Ok(self.table_info::<T>()?.connection.clone())
    }

    pub(crate) fn schema_for<T: Table>(&self) -> Result<TableSchema> {
        Ok(self.table_info::<T>()?.schema.clone())
    }

    /// Whether `AtomicBool`-style "has this type been set up" check is
    /// true, without triggering setup. Used by relation code that wants to
    /// assert an owner type is already configured before subscribing.
    pub fn is_setup<T: Table>(&self) -> bool {
        self.0.tables.contains_key(&TypeId::of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, SqlKind};
    use crate::settings::SettingsKey;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Artist {
        id: AutoId,
        name: String,
    }

    impl Table for Artist {
        fn table_name() -> &'static str {
            "artists_mgr_test"
        }
        fn columns() -> Vec<Column> {
            vec![
                Column::new("id", SqlKind::Integer, false),
                Column::new("name", SqlKind::Text, false).with_default("''"),
            ]
        }
        fn settings_key() -> SettingsKey {
            SettingsKey::Memory
        }
        fn id(&self) -> AutoId {
            self.id
        }
        fn set_id(&mut self, id: AutoId) {
            self.id = id;
        }
        fn to_row(&self) -> Row {
            let mut row = Row::new();
            row.insert("id".into(), Value::UInt64(self.id));
            row.insert("name".into(), Value::Text(self.name.clone()));
            row
        }
        fn from_row(row: &Row) -> Result<Self> {
            Ok(Artist {
                id: row.get("id").map(Value::as_u64).transpose()?.unwrap_or(0),
                name: row
                    .get("name")
                    .map(Value::as_text)
                    .transpose()?
                    .unwrap_or_default(),
            })
        }
    }

    fn isolated_manager() -> Manager {
        Manager::new(SettingsRegistry::new("/tmp/ormkit-test-app", "/tmp/ormkit-test-cache"))
    }

    #[tokio::test]
    async fn create_fetch_and_save_round_trip_preserve_identity() {
        let manager = isolated_manager();
        let artist = manager.create::<Artist>(Some(1)).await.unwrap();
        artist.write().name = "The Cure".to_string();
        manager.save_list(&[artist.clone()]).await.unwrap();

        let fetched = manager.fetch_id::<Artist>(1).await.unwrap();
        assert!(Arc::ptr_eq(&artist, &fetched), "must return the same live instance");
        assert_eq!(fetched.read().name, "The Cure");
    }

    #[tokio::test]
    async fn deleted_id_is_a_noop_on_save_and_missing_on_fetch() {
        let manager = isolated_manager();
        let artist = manager.create::<Artist>(Some(7)).await.unwrap();
        manager.save_list(&[artist.clone()]).await.unwrap();

        manager.delete::<Artist>(&[7]).await.unwrap();
        manager.save_list(&[artist]).await.unwrap();

        let err = manager.fetch_id::<Artist>(7).await.unwrap_err();
        assert!(matches!(err, Error::MissingId));
    }

    #[tokio::test]
    async fn fetch_ids_empty_list_short_circuits() {
        let manager = isolated_manager();
        manager.setup_db::<Artist>().await.unwrap();
        let result = manager.fetch_ids::<Artist>(&[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn save_all_changes_flushes_every_registered_type() {
        let manager = isolated_manager();
        let artist = manager.create::<Artist>(None).await.unwrap();
        artist.write().name = "Gunnar".to_string();
        manager.mark_changed(&artist);

        manager.save_all_changes().await.unwrap();
        let id = artist.read().id;
        let fetched = manager.fetch_id::<Artist>(id).await.unwrap();
        assert_eq!(fetched.read().name, "Gunnar");
    }
}
