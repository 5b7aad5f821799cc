//! In-memory lookup tables, loaded in two stages.
//!
//! Tables are staged behind a mutex while being loaded, then swapped into an
//! `ArcSwap` for lock-free read access on the hot path. A reload stages a
//! fresh set and swaps it in whole, so readers never see a half-loaded
//! table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use securewatch_event::ObjectMap;

/// A named key-value table used by `lookup` actions.
#[derive(Debug, Clone)]
pub struct LookupTable {
    pub name: String,
    /// The event field whose value keys into `data`.
    pub key_field: String,
    pub data: HashMap<String, ObjectMap>,
    pub cache_timeout: Duration,
}

impl LookupTable {
    pub fn new(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
            data: HashMap::new(),
            cache_timeout: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_row(mut self, key: impl Into<String>, row: ObjectMap) -> Self {
        self.data.insert(key.into(), row);
        self
    }

    pub fn find(&self, key: &str) -> Option<&ObjectMap> {
        self.data.get(key)
    }
}

type TableMap = HashMap<String, LookupTable>;

/// Registry of lookup tables with staged loading and lock-free reads.
#[derive(Clone, Default)]
pub struct TableRegistry {
    loading: Arc<Mutex<Option<TableMap>>>,
    tables: Arc<ArcSwap<Option<TableMap>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage tables for loading. Tables already live are carried over
    /// unless replaced by name.
    pub fn load(&self, tables: Vec<LookupTable>) {
        let mut staged: TableMap = tables
            .into_iter()
            .map(|table| (table.name.clone(), table))
            .collect();

        let existing = self.tables.load();
        if let Some(existing) = &**existing {
            for (name, table) in existing {
                staged
                    .entry(name.clone())
                    .or_insert_with(|| table.clone());
            }
        }

        let mut loading = self.loading.lock();
        match loading.as_mut() {
            None => *loading = Some(staged),
            Some(current) => current.extend(staged),
        }
    }

    /// Swap the staged tables live. Reads before this see the previous set.
    pub fn finish_load(&self) {
        let staged = self.loading.lock().take();
        if staged.is_some() {
            self.tables.swap(Arc::new(staged));
        }
    }

    /// Names of the currently live tables.
    pub fn table_names(&self) -> Vec<String> {
        match &**self.tables.load() {
            Some(tables) => tables.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Find a row in the named table. Returns a clone; rows are small.
    pub fn find(&self, table: &str, key: &str) -> Option<ObjectMap> {
        let tables = self.tables.load();
        tables
            .as_ref()
            .as_ref()?
            .get(table)?
            .find(key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use securewatch_event::Value;

    fn asset_table() -> LookupTable {
        let mut row = ObjectMap::new();
        row.insert("owner".into(), Value::from("infra-team"));
        row.insert("criticality".into(), Value::from("high"));
        LookupTable::new("assets", "host.name").with_row("db-01", row)
    }

    #[test]
    fn staged_tables_are_invisible_until_finished() {
        let registry = TableRegistry::new();
        registry.load(vec![asset_table()]);
        assert!(registry.find("assets", "db-01").is_none());

        registry.finish_load();
        let row = registry.find("assets", "db-01").unwrap();
        assert_eq!(row["owner"], Value::from("infra-team"));
    }

    #[test]
    fn reload_replaces_by_name_and_keeps_others() {
        let registry = TableRegistry::new();
        registry.load(vec![asset_table(), LookupTable::new("users", "user.name")]);
        registry.finish_load();

        let replacement = LookupTable::new("assets", "host.name").with_row(
            "db-02",
            ObjectMap::from_iter([("owner".to_string(), Value::from("dba-team"))]),
        );
        registry.load(vec![replacement]);
        registry.finish_load();

        assert!(registry.find("assets", "db-01").is_none());
        assert!(registry.find("assets", "db-02").is_some());
        let mut names = registry.table_names();
        names.sort();
        assert_eq!(names, ["assets", "users"]);
    }

    #[test]
    fn missing_table_or_key_is_none() {
        let registry = TableRegistry::new();
        registry.load(vec![asset_table()]);
        registry.finish_load();
        assert!(registry.find("assets", "no-such-host").is_none());
        assert!(registry.find("no-such-table", "db-01").is_none());
    }
}
