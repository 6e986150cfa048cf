//! Per-table settings keys and app-level defaults (component C11).
//!
//! A table's `settings_key` groups it into one of a handful of database
//! files. Resolving a key to a concrete path is deliberately kept separate
//! from *finding* the platform app/cache directories (spec.md §1 places
//! "file-path resolution to platform directories" out of scope) — this
//! module accepts those directories from its caller (mirroring the teacher's
//! `StorageConfig`, which takes a `db_path` rather than computing one) and
//! only does the grouping/backup-attribute bookkeeping spec.md §6 describes.

use std::path::{Path, PathBuf};

/// How a table's database file is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SettingsKey {
    /// The shared "regular" on-disk database, backed up, under the app
    /// directory.
    #[default]
    Regular,
    /// A shared on-disk "cache" database: not backed up, under the cache
    /// directory, safe to delete.
    Cache,
    /// An in-memory database. Never persisted, never backed up.
    Memory,
    /// A fully caller-specified resolution, bypassing the registry's
    /// regular/cache grouping entirely.
    Specific(ResolvedSettings),
}

/// The resolved location and backup policy for a settings key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub path: PathBuf,
    pub backup_eligible: bool,
    pub relative_to_app_dir: bool,
    pub relative_to_cache_dir: bool,
}

impl ResolvedSettings {
    pub fn in_memory() -> Self {
        ResolvedSettings {
            path: PathBuf::from(":memory:"),
            backup_eligible: false,
            relative_to_app_dir: false,
            relative_to_cache_dir: false,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.path.as_os_str() == ":memory:"
    }
}

/// Resolves `SettingsKey`s into concrete file locations, given the
/// application's app/cache directories.
#[derive(Debug, Clone)]
pub struct SettingsRegistry {
    app_dir: PathBuf,
    cache_dir: PathBuf,
}

impl SettingsRegistry {
    pub fn new(app_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        SettingsRegistry {
            app_dir: app_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Resolve using the platform's default app-support/cache directories
    /// (via `dirs`), falling back to the current directory if the platform
    /// can't report one (e.g. a minimal container).
    pub fn from_platform_defaults(app_name: &str) -> Self {
        let app_dir = dirs::data_dir()
            .map(|d| d.join(app_name))
            .unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = dirs::cache_dir()
            .map(|d| d.join(app_name))
            .unwrap_or_else(|| PathBuf::from("."));
        SettingsRegistry::new(app_dir, cache_dir)
    }

    /// Resolve a `file_name` (e.g. `"main"`) under a `SettingsKey` into a
    /// concrete [`ResolvedSettings`]. Tables that share a key and file name
    /// resolve to the same path and therefore share a database connection
    /// (spec.md §3.4: "a database is opened once per settings key").
    pub fn resolve(&self, key: &SettingsKey, file_name: &str) -> ResolvedSettings {
        match key {
            SettingsKey::Regular => ResolvedSettings {
                path: self.app_dir.join(format!("{file_name}.sqlite3")),
                backup_eligible: true,
                relative_to_app_dir: true,
                relative_to_cache_dir: false,
            },
            SettingsKey::Cache => ResolvedSettings {
                path: self.cache_dir.join(format!("{file_name}.sqlite3")),
                backup_eligible: false,
                relative_to_app_dir: false,
                relative_to_cache_dir: true,
            },
            SettingsKey::Memory => ResolvedSettings::in_memory(),
            SettingsKey::Specific(settings) => settings.clone(),
        }
    }
}

/// Mark a resolved path as excluded from platform backups when
/// `backup_eligible` is false. Out-of-scope platforms (anything without a
/// notion of backup exclusion) are a silent no-op; this is best-effort
/// bookkeeping, never a hard requirement for correctness.
pub fn apply_backup_exclusion(_path: &Path, _backup_eligible: bool) {
    // Platform-specific backup-exclusion attributes (e.g. a Windows/macOS
    // extended file attribute) are outside this crate's scope (spec.md §1):
    // the embedding application owns the platform integration. This hook
    // exists so callers have a single, named place to wire that in.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_and_cache_resolve_under_different_dirs() {
        let registry = SettingsRegistry::new("/app", "/cache");
        let regular = registry.resolve(&SettingsKey::Regular, "main");
        let cache = registry.resolve(&SettingsKey::Cache, "main");
        assert_eq!(regular.path, PathBuf::from("/app/main.sqlite3"));
        assert!(regular.backup_eligible);
        assert_eq!(cache.path, PathBuf::from("/cache/main.sqlite3"));
        assert!(!cache.backup_eligible);
    }

    #[test]
    fn memory_key_is_in_memory() {
        let registry = SettingsRegistry::new("/app", "/cache");
        let resolved = registry.resolve(&SettingsKey::Memory, "main");
        assert!(resolved.is_memory());
    }

    #[test]
    fn shared_key_and_file_name_resolve_identically() {
        let registry = SettingsRegistry::new("/app", "/cache");
        let a = registry.resolve(&SettingsKey::Regular, "shared");
        let b = registry.resolve(&SettingsKey::Regular, "shared");
        assert_eq!(a, b);
    }
}
