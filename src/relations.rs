//! Relation primitives (component C9).
//!
//! Three shapes, all owner-propagating: a single optional reference
//! ([`OneRelation`]), an ordered list of ids ([`ManyRelation`]), and a
//! paginated, auto-refreshing view over an arbitrary `WHERE` predicate
//! ([`RelationQuery`]). None of them hold a [`Manager`] themselves — every
//! method that touches the database takes one as a parameter, the same
//! injectable-service shape `manager` itself follows (spec.md §9).

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::concurrency::{observer, ChangeEvent, ChangeKind};
use crate::error::{Error, Result};
use crate::id::{is_unset, AutoId};
use crate::manager::{Manager, Model};
use crate::row::Table;
use crate::{codec, value::Value};

/// Implemented by whatever embeds a relation field, so a mutation can
/// propagate a "this changed" signal outward (spec.md §4.8). Relations
/// store only a [`Weak`] reference to their owner — the owner holds the
/// relation, not the other way round, so this is the half of the cycle
/// that must not keep the owner alive (spec.md §9 "cyclic owner
/// references... use weak/back references").
pub trait OwnerNotify: Send + Sync {
    fn did_change(&self);
}

fn notify(owner: &RwLock<Option<Weak<dyn OwnerNotify>>>) {
    if let Some(owner) = owner.read().as_ref().and_then(Weak::upgrade) {
        owner.did_change();
    }
}

/// Resolve a page of ids into `Model`s, preserving `ids`' order and
/// silently dropping any id `fetch_ids` couldn't resolve (a row deleted out
/// from under a stale relation, say).
fn reorder_to_ids<T: Table>(ids: &[AutoId], models: Vec<Model<T>>) -> Vec<Model<T>> {
    let mut by_id: std::collections::HashMap<AutoId, Model<T>> =
        models.into_iter().map(|m| (m.read().id(), m)).collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}

// ---------------------------------------------------------------------
// OneRelation
// ---------------------------------------------------------------------

struct OneState<T: Table> {
    id: AutoId,
    object: Option<Model<T>>,
}

/// A persistent one-to-one reference. `id == 0` means "unset"; the
/// serialized form is solely `id` — `_object` is a lazy, in-memory cache of
/// the fetch, never written to storage (spec.md §3.2).
pub struct OneRelation<T: Table> {
    state: RwLock<OneState<T>>,
    owner: RwLock<Option<Weak<dyn OwnerNotify>>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl<T: Table> OneRelation<T> {
    pub fn new() -> Self {
        OneRelation {
            state: RwLock::new(OneState { id: 0, object: None }),
            owner: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reconstruct from a persisted id (the only thing ever serialized).
    pub fn from_id(id: AutoId) -> Self {
        OneRelation {
            state: RwLock::new(OneState { id, object: None }),
            owner: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> AutoId {
        self.state.read().id
    }

    pub fn set_owner(&self, owner: Weak<dyn OwnerNotify>) {
        *self.owner.write() = Some(owner);
    }

    /// In-memory cached object, if it's already been fetched.
    pub fn peek(&self) -> Option<Model<T>> {
        self.state.read().object.clone()
    }

    /// Resolve the target, fetching and caching it on first access.
    /// Serialized per-instance so two concurrent callers don't both issue
    /// the fetch (spec.md §4.8).
    pub async fn fetch(&self, manager: &Manager) -> Result<Model<T>> {
        let _guard = self.fetch_lock.lock().await;
        let id = self.state.read().id;
        if is_unset(id) {
            return Err(Error::MissingId);
        }
        if let Some(object) = self.state.read().object.clone() {
            return Ok(object);
        }
        let model = manager.fetch_id::<T>(id).await?;
        self.state.write().object = Some(model.clone());
        Ok(model)
    }

    /// Point this relation at `model`, updating both `id` and the cached
    /// object, and notify the owner.
    pub fn set_object(&self, model: Model<T>) {
        let id = model.read().id();
        {
            let mut s = self.state.write();
            s.id = id;
            s.object = Some(model);
        }
        notify(&self.owner);
    }

    /// Point this relation at a bare id, invalidating any cached object —
    /// used when decoding a freshly loaded row, before owner-binding.
    pub fn set_id(&self, id: AutoId) {
        {
            let mut s = self.state.write();
            s.id = id;
            s.object = None;
        }
        notify(&self.owner);
    }

    /// Batch-resolve many `OneRelation<T>`s that target the same type
    /// through a single `fetch_ids` call (spec.md §4.8 "fetch_all").
    pub async fn fetch_all(manager: &Manager, relations: &[&OneRelation<T>]) -> Result<()> {
        let ids: Vec<AutoId> = relations
            .iter()
            .map(|r| r.id())
            .filter(|id| !is_unset(*id))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let models = manager.fetch_ids::<T>(&ids).await?;
        let mut by_id: std::collections::HashMap<AutoId, Model<T>> =
            models.into_iter().map(|m| (m.read().id(), m)).collect();
        for relation in relations {
            let id = relation.id();
            if let Some(model) = by_id.remove(&id) {
                relation.state.write().object = Some(model);
            }
        }
        Ok(())
    }
}

impl<T: Table> Default for OneRelation<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// ManyRelation
// ---------------------------------------------------------------------

struct ManyState<T: Table> {
    ids: Vec<AutoId>,
    items: Option<Vec<Model<T>>>,
    has_more: bool,
}

/// The persisted shape of a [`ManyRelation`] — everything but `items`,
/// which is lazy (spec.md §3.2, §8 "serialize-then-deserialize a relation
/// recovers its public state sans items").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ManyRelationSnapshot {
    pub ids: Vec<AutoId>,
    pub initial: usize,
    pub limit: usize,
    pub init_fetch: bool,
}

/// A persistent ordered one-to-many reference. Items are non-unique;
/// insertion order is meaningful and is exactly what gets persisted
/// (spec.md §3.2).
pub struct ManyRelation<T: Table> {
    state: RwLock<ManyState<T>>,
    initial: usize,
    limit: usize,
    init_fetch: bool,
    owner: RwLock<Option<Weak<dyn OwnerNotify>>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl<T: Table> ManyRelation<T> {
    pub fn new(initial: usize, limit: usize, init_fetch: bool) -> Self {
        ManyRelation {
            state: RwLock::new(ManyState {
                ids: Vec::new(),
                items: None,
                has_more: false,
            }),
            initial,
            limit,
            init_fetch,
            owner: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_snapshot(snapshot: ManyRelationSnapshot) -> Self {
        ManyRelation {
            state: RwLock::new(ManyState {
                ids: snapshot.ids,
                items: None,
                has_more: false,
            }),
            initial: snapshot.initial,
            limit: snapshot.limit,
            init_fetch: snapshot.init_fetch,
            owner: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> ManyRelationSnapshot {
        let s = self.state.read();
        ManyRelationSnapshot {
            ids: s.ids.clone(),
            initial: self.initial,
            limit: self.limit,
            init_fetch: self.init_fetch,
        }
    }

    pub fn ids(&self) -> Vec<AutoId> {
        self.state.read().ids.clone()
    }

    pub fn init_fetch(&self) -> bool {
        self.init_fetch
    }

    pub fn has_more(&self) -> bool {
        self.state.read().has_more
    }

    /// Currently-loaded items, empty until [`ManyRelation::first_fetch`]
    /// (or [`ManyRelation::fetch`]) has been called at least once (spec.md
    /// end-to-end scenario 4: "items is empty until fetch()").
    pub fn items(&self) -> Vec<Model<T>> {
        self.state.read().items.clone().unwrap_or_default()
    }

    pub fn set_owner(&self, owner: Weak<dyn OwnerNotify>) {
        *self.owner.write() = Some(owner);
    }

    /// Load the first page (up to `initial`).
    pub async fn first_fetch(&self, manager: &Manager) -> Result<()> {
        let _guard = self.fetch_lock.lock().await;
        let prefix: Vec<AutoId> = {
            let s = self.state.read();
            s.ids.iter().take(self.initial).cloned().collect()
        };
        let models = manager.fetch_ids::<T>(&prefix).await?;
        let ordered = reorder_to_ids(&prefix, models);
        let mut s = self.state.write();
        s.has_more = s.ids.len() > ordered.len();
        s.items = Some(ordered);
        Ok(())
    }

    /// Load the next page of up to `limit` items, in id-order, continuing
    /// from wherever `items` currently leaves off.
    pub async fn fetch(&self, manager: &Manager) -> Result<()> {
        let _guard = self.fetch_lock.lock().await;
        let page: Vec<AutoId> = {
            let s = self.state.read();
            let start = s.items.as_ref().map(Vec::len).unwrap_or(0);
            s.ids.iter().skip(start).take(self.limit).cloned().collect()
        };
        let models = manager.fetch_ids::<T>(&page).await?;
        let ordered = reorder_to_ids(&page, models);
        let page_len = ordered.len();
        let mut s = self.state.write();
        match &mut s.items {
            Some(items) => items.extend(ordered),
            None => s.items = Some(ordered),
        }
        s.has_more = page_len == self.limit;
        Ok(())
    }

    pub fn set(&self, ids: Vec<AutoId>) {
        {
            let mut s = self.state.write();
            s.ids = ids;
            s.items = None;
            s.has_more = false;
        }
        notify(&self.owner);
    }

    pub fn append(&self, id: AutoId) {
        {
            let mut s = self.state.write();
            s.ids.push(id);
        }
        notify(&self.owner);
    }

    pub fn insert(&self, index: usize, id: AutoId) {
        {
            let mut s = self.state.write();
            let index = index.min(s.ids.len());
            s.ids.insert(index, id);
        }
        notify(&self.owner);
    }

    /// Remove by position, returning the id that was there. Leaves any
    /// loaded `items` alone — callers that need the views in sync should
    /// re-`fetch`.
    pub fn remove(&self, index: usize) -> Option<AutoId> {
        let removed = {
            let mut s = self.state.write();
            if index < s.ids.len() {
                Some(s.ids.remove(index))
            } else {
                None
            }
        };
        if removed.is_some() {
            notify(&self.owner);
        }
        removed
    }

    pub fn remove_ids(&self, ids: &[AutoId]) {
        let removed_any = {
            let mut s = self.state.write();
            let before = s.ids.len();
            s.ids.retain(|id| !ids.contains(id));
            s.ids.len() != before
        };
        if removed_any {
            notify(&self.owner);
        }
    }

    pub fn move_item(&self, from: usize, to: usize) {
        let moved = {
            let mut s = self.state.write();
            if from < s.ids.len() && to < s.ids.len() && from != to {
                let id = s.ids.remove(from);
                s.ids.insert(to, id);
                true
            } else {
                false
            }
        };
        if moved {
            notify(&self.owner);
        }
    }
}

// ---------------------------------------------------------------------
// RelationQuery
// ---------------------------------------------------------------------

struct QueryState<T: Table> {
    offset: i64,
    fetched_ids: HashSet<AutoId>,
    has_more: bool,
    items: Vec<Model<T>>,
    stale: bool,
}

/// A paginated, auto-refreshing view over an arbitrary `WHERE` predicate
/// (spec.md §3.2, §4.8). `query_template` must not include `LIMIT`/
/// `OFFSET` — this type appends them itself.
pub struct RelationQuery<T: Table> {
    query_template: String,
    arguments: Vec<Value>,
    initial: usize,
    limit: usize,
    restrict_to_initial: bool,
    state: RwLock<QueryState<T>>,
    owner: RwLock<Option<Weak<dyn OwnerNotify>>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl<T: Table> RelationQuery<T> {
    pub fn new(query_template: impl Into<String>, arguments: Vec<Value>, initial: usize, limit: usize) -> Self {
        RelationQuery {
            query_template: query_template.into(),
            arguments,
            initial,
            limit,
            restrict_to_initial: false,
            state: RwLock::new(QueryState {
                offset: -1,
                fetched_ids: HashSet::new(),
                has_more: false,
                items: Vec::new(),
                stale: false,
            }),
            owner: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn restrict_to_initial(mut self, restrict: bool) -> Self {
        self.restrict_to_initial = restrict;
        self
    }

    pub fn set_owner(&self, owner: Weak<dyn OwnerNotify>) {
        *self.owner.write() = Some(owner);
    }

    pub fn items(&self) -> Vec<Model<T>> {
        self.state.read().items.clone()
    }

    pub fn has_more(&self) -> bool {
        self.state.read().has_more
    }

    pub fn is_stale(&self) -> bool {
        self.state.read().stale
    }

    pub fn fetched_ids(&self) -> HashSet<AutoId> {
        self.state.read().fetched_ids.clone()
    }

    async fn run_query(&self, manager: &Manager, take: usize, skip: usize) -> Result<Vec<AutoId>> {
        let schema = manager.schema_for::<T>()?;
        let connection = manager.connection_for::<T>()?;
        let predicate = format!("{} LIMIT ? OFFSET ?", self.query_template);
        let mut args = self.arguments.clone();
        args.push(Value::UInt64(take as u64));
        args.push(Value::UInt64(skip as u64));

        let rows = tokio::task::spawn_blocking(move || {
            connection.run(|c| codec::select_where(c, &schema, &predicate, &args))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

        Ok(rows
            .iter()
            .filter_map(|r| r.get("id").map(Value::as_u64))
            .filter_map(std::result::Result::ok)
            .collect())
    }

    /// Run (or re-run) the initial page. A no-op unless `reset` is true or
    /// this is the very first call (spec.md §4.8: "if offset == -1 or
    /// resetting").
    pub async fn fetch_items(&self, manager: &Manager, reset: bool) -> Result<()> {
        let _guard = self.fetch_lock.lock().await;
        if !reset && self.state.read().offset != -1 {
            return Ok(());
        }
        let ids = self.run_query(manager, self.initial, 0).await?;
        let models = manager.fetch_ids::<T>(&ids).await?;
        let ordered = reorder_to_ids(&ids, models);

        let mut s = self.state.write();
        s.offset = ids.len() as i64;
        s.has_more = ids.len() == self.initial;
        s.fetched_ids = ids.into_iter().collect();
        s.stale = false;
        s.items = if self.restrict_to_initial {
            ordered.into_iter().take(self.initial).collect()
        } else {
            ordered
        };
        Ok(())
    }

    /// Load the next page. Detects a shifted underlying result set (the
    /// new page's ids overlap `fetched_ids`) and re-synchronizes from `0`
    /// instead of silently appending duplicates (spec.md §4.8).
    pub async fn fetch_more(&self, manager: &Manager) -> Result<()> {
        let _guard = self.fetch_lock.lock().await;
        let offset = self.state.read().offset.max(0) as usize;
        let ids = self.run_query(manager, self.limit, offset).await?;

        if ids.is_empty() {
            let mut s = self.state.write();
            if s.items.len() == offset {
                s.has_more = false;
            }
            return Ok(());
        }

        let shifted = {
            let s = self.state.read();
            ids.iter().any(|id| s.fetched_ids.contains(id))
        };

        if shifted {
            let resync_count = offset + ids.len();
            let resync_ids = self.run_query(manager, resync_count, 0).await?;
            let models = manager.fetch_ids::<T>(&resync_ids).await?;
            let ordered = reorder_to_ids(&resync_ids, models);
            let mut s = self.state.write();
            s.has_more = resync_ids.len() == resync_count;
            s.offset = resync_ids.len() as i64;
            s.fetched_ids = resync_ids.into_iter().collect();
            s.items = ordered;
            return Ok(());
        }

        let models = manager.fetch_ids::<T>(&ids).await?;
        let ordered = reorder_to_ids(&ids, models);
        let page_len = ids.len();
        let mut s = self.state.write();
        s.items.extend(ordered);
        s.offset += page_len as i64;
        s.fetched_ids.extend(ids);
        s.has_more = page_len == self.limit;
        Ok(())
    }

    /// React to a table-wide change event: widen and re-fetch the initial
    /// page when there was room for more below `initial`, drop items whose
    /// id has since been deleted, otherwise just flag the view stale
    /// (spec.md §4.8).
    async fn handle_change(&self, manager: &Manager, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::Created => {
                let should_widen = {
                    let s = self.state.read();
                    s.offset <= 0 || (!s.has_more && (s.items.len() as i64) < self.initial as i64)
                };
                if should_widen {
                    let _ = self.fetch_items(manager, true).await;
                } else {
                    self.state.write().stale = true;
                }
            }
            ChangeKind::Deleted => {
                let deleted: HashSet<AutoId> = event.ids.iter().copied().collect();
                let mut s = self.state.write();
                s.items.retain(|m| !deleted.contains(&m.read().id()));
            }
            ChangeKind::Changed => {}
        }
    }

    /// Subscribe to `T`'s row-change observer for the lifetime of `self`
    /// (call once, right after owner-binding, per spec.md §4.8 "on
    /// owner-set, subscribes to the target table's change observer"), and
    /// run the initial fetch if `init_fetch` is set. The background task
    /// holds only a [`Weak`] reference to `self` and exits the moment the
    /// query is dropped or the connection closes.
    pub async fn on_owner_set(self: &Arc<Self>, manager: Manager, init_fetch: bool) -> Result<()> {
        let schema_name = manager.schema_for::<T>()?.name;
        let connection = manager.connection_for::<T>()?;
        let weak_self = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut rx = connection.row_observer().subscribe();
            loop {
                match observer::next(&mut rx).await {
                    None => break,
                    Some(event) => {
                        if event.table != schema_name {
                            continue;
                        }
                        let Some(this) = weak_self.upgrade() else { break };
                        this.handle_change(&manager, &event).await;
                    }
                }
            }
        });

        if init_fetch {
            self.fetch_items(&manager, true).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CrateResult;
    use crate::row::Row;
    use crate::schema::{Column, SqlKind};
    use crate::settings::{SettingsKey, SettingsRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Child {
        id: AutoId,
        name: String,
    }

    impl Table for Child {
        fn table_name() -> &'static str {
            "relation_children"
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
        fn from_row(row: &Row) -> CrateResult<Self> {
            Ok(Child {
                id: row.get("id").map(Value::as_u64).transpose()?.unwrap_or(0),
                name: row
                    .get("name")
                    .map(Value::as_text)
                    .transpose()?
                    .unwrap_or_default(),
            })
        }
    }

    struct CountingOwner(AtomicUsize);
    impl OwnerNotify for CountingOwner {
        fn did_change(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> Manager {
        Manager::new(SettingsRegistry::new("/tmp/ormkit-rel-app", "/tmp/ormkit-rel-cache"))
    }

    #[tokio::test]
    async fn one_relation_fetch_caches_and_set_object_notifies_owner() {
        let mgr = manager();
        let child = mgr.create::<Child>(Some(1)).await.unwrap();
        child.write().name = "Gunnar".to_string();
        mgr.save_list(&[child.clone()]).await.unwrap();

        let owner: Arc<CountingOwner> = Arc::new(CountingOwner(AtomicUsize::new(0)));
        let relation: OneRelation<Child> = OneRelation::from_id(1);
        relation.set_owner(Arc::downgrade(&owner) as Weak<dyn OwnerNotify>);

        let fetched = relation.fetch(&mgr).await.unwrap();
        assert_eq!(fetched.read().name, "Gunnar");
        assert_eq!(owner.0.load(Ordering::SeqCst), 0, "fetch alone must not notify the owner");

        relation.set_object(fetched);
        assert_eq!(owner.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_relation_unset_id_is_missing() {
        let mgr = manager();
        let relation: OneRelation<Child> = OneRelation::new();
        let err = relation.fetch(&mgr).await.unwrap_err();
        assert!(matches!(err, Error::MissingId));
    }

    #[tokio::test]
    async fn many_relation_items_empty_until_fetch_then_ordered() {
        let mgr = manager();
        let gunnar = mgr.create::<Child>(Some(1)).await.unwrap();
        gunnar.write().name = "Gunnar".into();
        let bertil = mgr.create::<Child>(Some(2)).await.unwrap();
        bertil.write().name = "Bertil".into();
        mgr.save_list(&[gunnar, bertil]).await.unwrap();

        let relation: ManyRelation<Child> = ManyRelation::new(10, 10, false);
        relation.set(vec![1, 2]);
        assert!(relation.items().is_empty());

        relation.fetch(&mgr).await.unwrap();
        let names: Vec<String> = relation.items().iter().map(|m| m.read().name.clone()).collect();
        assert_eq!(names, vec!["Gunnar", "Bertil"]);
    }

    #[tokio::test]
    async fn many_relation_snapshot_round_trips_ids() {
        let relation: ManyRelation<Child> = ManyRelation::new(5, 5, true);
        relation.set(vec![3, 1, 2]);
        let snapshot = relation.snapshot();
        assert_eq!(snapshot.ids, vec![3, 1, 2]);

        let restored = ManyRelation::<Child>::from_snapshot(snapshot);
        assert_eq!(restored.ids(), vec![3, 1, 2]);
        assert!(restored.init_fetch());
    }

    #[tokio::test]
    async fn relation_query_fetches_and_paginates() {
        let mgr = manager();
        for i in 1..=5u64 {
            let c = mgr.create::<Child>(Some(i)).await.unwrap();
            c.write().name = format!("n{i}");
            mgr.save_list(&[c]).await.unwrap();
        }

        let query: RelationQuery<Child> = RelationQuery::new("1=1 ORDER BY id", vec![], 2, 2);
        query.fetch_items(&mgr, true).await.unwrap();
        assert_eq!(query.items().len(), 2);
        assert!(query.has_more());

        query.fetch_more(&mgr).await.unwrap();
        assert_eq!(query.items().len(), 4);
        assert!(query.has_more());

        query.fetch_more(&mgr).await.unwrap();
        assert_eq!(query.items().len(), 5);
        assert!(!query.has_more());
    }
}
