use std::collections::HashMap;

use kivet_core::TableDef;

/// Operator-registered table definitions. Registration is an upsert; the
/// routing tier only ever asks whether a table exists.
#[derive(Default)]
pub struct TableRegistry {
    tables: HashMap<String, TableDef>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: TableDef) -> TableDef {
        self.tables.insert(def.table_name.clone(), def.clone());
        def
    }

    pub fn exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<TableDef> {
        self.tables.get(name).cloned()
    }

    pub fn list(&self) -> Vec<TableDef> {
        let mut defs: Vec<TableDef> = self.tables.values().cloned().collect();
        defs.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut tables = TableRegistry::new();
        assert!(!tables.exists("users"));
        tables.register(TableDef {
            table_name: "users".into(),
            partition_key: "id".into(),
            sort_key: "ts".into(),
        });
        assert!(tables.exists("users"));
        assert_eq!(tables.get("users").unwrap().partition_key, "id");
        assert_eq!(tables.list().len(), 1);
    }
}
