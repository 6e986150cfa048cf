//! FTS5 subsystem (component C10).
//!
//! An [`FtsColumn<T>`] owns one shadow virtual table per `(content table,
//! column)` pair. The shadow table is never kept in sync eagerly — triggers
//! only invalidate (delete) a stale shadow row; [`FtsColumn::search`] (via
//! [`FtsColumn::ensure_populated`]) is what actually catches the shadow back
//! up, in batches, right before it runs the match query (spec.md §4.9).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::codec;
use crate::error::{Error, Result};
use crate::id::AutoId;
use crate::manager::{Manager, Model};
use crate::row::Table;
use crate::value::Value;

/// Maximum number of ids backfilled into the shadow table in one pass
/// (spec.md §4.9: "lazy, batched (limit 20000 per pass)").
const POPULATE_BATCH: usize = 20_000;

/// Letters `remove_diacritics 0` alone doesn't protect — the tokenizer's
/// diacritic stripping is all-or-nothing, so this crate normalizes text
/// itself before handing it to SQLite, keeping exactly these six distinct
/// from their bare-letter forms (spec.md §4.9: "preserves ä ö å Ö Ä Å as
/// distinct letters and folds all other diacritics").
const PRESERVED_LETTERS: [char; 6] = ['ä', 'ö', 'å', 'Ä', 'Ö', 'Å'];

/// Fold every diacritic out of `text` except the Nordic vowels, so
/// "fiancé" matches "fiance" but "Öl" never matches "Ol".
pub fn normalize_for_search(text: &str) -> String {
    text.chars()
        .flat_map(|c| {
            if PRESERVED_LETTERS.contains(&c) {
                vec![c]
            } else {
                c.nfd().filter(|d| !is_combining_mark(*d)).collect::<Vec<_>>()
            }
        })
        .collect()
}

/// Where an [`FtsColumn`] reads searchable text from.
#[derive(Clone)]
enum FtsSource {
    /// Read the column of the same name directly off the content table
    /// (the default).
    SameColumn,
    /// Owner-supplied `ids -> {id: text}` callback, for text that's
    /// derived or lives outside a plain scalar column (spec.md §4.9:
    /// "owners that implement the callback contract").
    Callback(Arc<dyn Fn(&[AutoId]) -> Result<HashMap<AutoId, String>> + Send + Sync>),
}

/// A lazily-populated full-text column over `T`'s `column` field.
pub struct FtsColumn<T: Table> {
    column: &'static str,
    shadow_name: String,
    insert_trigger: String,
    update_trigger: String,
    delete_trigger: String,
    source: FtsSource,
    /// Serializes `ensure_populated` so two concurrent searches don't both
    /// re-scan and double-insert the same backlog (spec.md §4.9: "setup and
    /// search are serialized per target type by a dedicated semaphore").
    population_lock: AsyncMutex<()>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Table> FtsColumn<T> {
    /// A column whose searchable text is read straight off `T`'s own
    /// `column` field.
    pub fn new(column: &'static str) -> Self {
        Self::with_source(column, FtsSource::SameColumn)
    }

    /// A column whose searchable text comes from an owner-supplied
    /// callback rather than a plain field read.
    pub fn with_callback<F>(column: &'static str, callback: F) -> Self
    where
        F: Fn(&[AutoId]) -> Result<HashMap<AutoId, String>> + Send + Sync + 'static,
    {
        Self::with_source(column, FtsSource::Callback(Arc::new(callback)))
    }

    fn with_source(column: &'static str, source: FtsSource) -> Self {
        let shadow_name = format!("{}+{}+Table", T::table_name(), column);
        FtsColumn {
            column,
            insert_trigger: format!("{shadow_name}+Insert"),
            update_trigger: format!("{shadow_name}+Update"),
            delete_trigger: format!("{shadow_name}+Delete"),
            shadow_name,
            source,
            population_lock: AsyncMutex::new(()),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn shadow_table_name(&self) -> &str {
        &self.shadow_name
    }

    /// Create the shadow virtual table and its three invalidation triggers
    /// if they don't already exist. Idempotent and safe to call from many
    /// tasks concurrently.
    pub async fn setup(&self, manager: &Manager) -> Result<()> {
        manager.setup_db::<T>().await?;
        let connection = manager.connection_for::<T>()?;
        let target = T::table_name().to_string();
        let shadow = self.shadow_name.clone();
        let insert_trigger = self.insert_trigger.clone();
        let update_trigger = self.update_trigger.clone();
        let delete_trigger = self.delete_trigger.clone();

        tokio::task::spawn_blocking(move || {
            connection.run(|c| {
                if let Err(e) = c.execute_batch(&format!(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS `{shadow}` USING fts5(id UNINDEXED, text, tokenize='unicode61 remove_diacritics 0')"
                )) {
                    if e.to_string().to_lowercase().contains("no such module") {
                        return Err(Error::NoFtsSupport);
                    }
                    return Err(Error::from(e));
                }

                c.execute_batch(&format!(
                    "CREATE TRIGGER IF NOT EXISTS `{insert_trigger}` AFTER INSERT ON `{target}` BEGIN \
                         DELETE FROM `{shadow}` WHERE id = NEW.id; \
                     END;
                     CREATE TRIGGER IF NOT EXISTS `{update_trigger}` AFTER UPDATE ON `{target}` BEGIN \
                         DELETE FROM `{shadow}` WHERE id = NEW.id; \
                     END;
                     CREATE TRIGGER IF NOT EXISTS `{delete_trigger}` AFTER DELETE ON `{target}` BEGIN \
                         DELETE FROM `{shadow}` WHERE id = OLD.id; \
                     END;"
                ))?;
                Ok(())
            })
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
        Ok(())
    }

    async fn read_texts(&self, manager: &Manager, ids: &[AutoId]) -> Result<HashMap<AutoId, String>> {
        match &self.source {
            FtsSource::Callback(callback) => callback(ids),
            FtsSource::SameColumn => {
                let schema = manager.schema_for::<T>()?;
                let connection = manager.connection_for::<T>()?;
                let ids = ids.to_vec();
                let rows = tokio::task::spawn_blocking(move || {
                    connection.run(|c| codec::select_by_ids(c, &schema, &ids))
                })
                .await
                .map_err(|e| Error::Internal(e.to_string()))??;

                let mut out = HashMap::new();
                for row in rows {
                    let id = row.get("id").map(Value::as_u64).transpose()?.unwrap_or(0);
                    let text = row
                        .get(self.column)
                        .map(Value::as_text)
                        .transpose()?
                        .unwrap_or_default();
                    out.insert(id, text);
                }
                Ok(out)
            }
        }
    }

    /// Find ids present in the content table but missing from the shadow
    /// table, fetch their text, normalize it, and insert it — in batches of
    /// [`POPULATE_BATCH`] — until the shadow table is caught up.
    pub async fn ensure_populated(&self, manager: &Manager) -> Result<()> {
        self.setup(manager).await?;
        let _guard = self.population_lock.lock().await;

        loop {
            let target = T::table_name().to_string();
            let shadow = self.shadow_name.clone();
            let connection = manager.connection_for::<T>()?;
            let missing_ids: Vec<AutoId> = tokio::task::spawn_blocking(move || {
                connection.run(|c| {
                    let sql = format!(
                        "SELECT `{target}`.id FROM `{target}` \
                         LEFT JOIN `{shadow}` ON `{shadow}`.id = `{target}`.id \
                         WHERE `{shadow}`.id IS NULL LIMIT {POPULATE_BATCH}"
                    );
                    let mut stmt = c.prepare(&sql)?;
                    let rows = stmt.query_map([], |r| {
                        let id: i64 = r.get(0)?;
                        Ok(id as u64)
                    })?;
                    let mut out = Vec::new();
                    for row in rows {
                        out.push(row?);
                    }
                    Ok(out)
                })
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;

            if missing_ids.is_empty() {
                return Ok(());
            }

            let texts = self.read_texts(manager, &missing_ids).await?;
            let shadow = self.shadow_name.clone();
            let connection = manager.connection_for::<T>()?;
            let rows: Vec<(AutoId, String)> = missing_ids
                .iter()
                .map(|id| (*id, normalize_for_search(texts.get(id).map(String::as_str).unwrap_or(""))))
                .collect();

            tokio::task::spawn_blocking(move || {
                connection.run(|c| {
                    for (id, text) in &rows {
                        c.execute(
                            &format!("INSERT INTO `{shadow}` (id, text) VALUES (?, ?)"),
                            rusqlite::params![*id as i64, text],
                        )?;
                    }
                    Ok(())
                })
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;
        }
    }

    /// Ensure the shadow table is caught up, then run `phrase` against it
    /// in rank order and resolve the matching ids back into `Model<T>`s
    /// through the identity cache (spec.md §4.9).
    pub async fn search(
        &self,
        manager: &Manager,
        phrase: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Model<T>>> {
        self.ensure_populated(manager).await?;
        let connection = manager.connection_for::<T>()?;
        let shadow = self.shadow_name.clone();
        let phrase = normalize_for_search(phrase);

        let ids: Vec<AutoId> = tokio::task::spawn_blocking(move || {
            connection.run(|c| {
                let sql = format!(
                    "SELECT id FROM `{shadow}` WHERE text MATCH ? ORDER BY rank LIMIT ? OFFSET ?"
                );
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params![phrase, limit as i64, offset as i64],
                    |r| {
                        let id: i64 = r.get(0)?;
                        Ok(id as u64)
                    },
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

        manager.fetch_ids::<T>(&ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CrateResult;
    use crate::row::Row;
    use crate::schema::{Column, SqlKind};
    use crate::settings::{SettingsKey, SettingsRegistry};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Post {
        id: AutoId,
        body: String,
    }

    impl Table for Post {
        fn table_name() -> &'static str {
            "fts_posts"
        }
        fn columns() -> Vec<Column> {
            vec![
                Column::new("id", SqlKind::Integer, false),
                Column::new("body", SqlKind::Text, false).with_default("''"),
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
            row.insert("body".into(), Value::Text(self.body.clone()));
            row
        }
        fn from_row(row: &Row) -> CrateResult<Self> {
            Ok(Post {
                id: row.get("id").map(Value::as_u64).transpose()?.unwrap_or(0),
                body: row
                    .get("body")
                    .map(Value::as_text)
                    .transpose()?
                    .unwrap_or_default(),
            })
        }
    }

    fn manager() -> Manager {
        Manager::new(SettingsRegistry::new("/tmp/ormkit-fts-app", "/tmp/ormkit-fts-cache"))
    }

    #[test]
    fn normalize_preserves_nordic_vowels_and_folds_other_diacritics() {
        assert_eq!(normalize_for_search("Öl"), "Öl");
        assert_eq!(normalize_for_search("fiancé"), "fiance");
        assert_eq!(normalize_for_search("ångström"), "ångström");
    }

    #[tokio::test]
    async fn search_finds_inserted_rows_and_reflects_updates() {
        let mgr = manager();
        let fts: FtsColumn<Post> = FtsColumn::new("body");

        for (i, body) in ["once upon a time", "a second post", "a third story"].iter().enumerate() {
            let post = mgr.create::<Post>(Some(i as u64 + 1)).await.unwrap();
            post.write().body = body.to_string();
            mgr.save_list(&[post]).await.unwrap();
        }

        let hits = fts.search(&mgr, "once", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].read().body, "once upon a time");

        let post = mgr.fetch_id::<Post>(1).await.unwrap();
        post.write().body = "an entirely different tale".to_string();
        mgr.mark_changed(&post);
        mgr.save_changes::<Post>().await.unwrap();

        let stale = fts.search(&mgr, "once", 10, 0).await.unwrap();
        assert!(stale.is_empty(), "old text must no longer match after an update");

        let fresh = fts.search(&mgr, "tale", 10, 0).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].read().id, 1);
    }

    #[tokio::test]
    async fn callback_source_supplies_text_out_of_band() {
        let mgr = manager();
        let fts: FtsColumn<Post> = FtsColumn::with_callback("body", |ids| {
            Ok(ids.iter().map(|&id| (id, format!("derived text {id}"))).collect())
        });

        let post = mgr.create::<Post>(Some(1)).await.unwrap();
        mgr.save_list(&[post]).await.unwrap();

        let hits = fts.search(&mgr, "derived", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
