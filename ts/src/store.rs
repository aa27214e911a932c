//! SQLite-backed record store

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::record::{Filter, Record};

const DB_FILE: &str = "taskstore.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS indexes (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (collection, id, field)
);
CREATE INDEX IF NOT EXISTS idx_indexes_field ON indexes (collection, field, value);
";

/// Persistent store for [`Record`] types
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (or create) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(?dir, "Store::open: called");
        fs::create_dir_all(dir).context(format!("Failed to create store directory {}", dir.display()))?;

        let path = dir.join(DB_FILE);
        let conn = Connection::open(&path).context(format!("Failed to open {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("Failed to initialize schema")?;

        info!(path = %path.display(), "Store opened");
        Ok(Self { conn, path })
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a new record, returning its id
    pub fn create<T: Record>(&mut self, record: T) -> Result<String> {
        let id = record.id().to_string();
        debug!(%id, collection = T::collection_name(), "Store::create: called");

        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM records WHERE collection = ?1 AND id = ?2",
                params![T::collection_name(), id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(eyre!("Record already exists: {}/{}", T::collection_name(), id));
        }

        self.write_record(&record)?;
        Ok(id)
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        debug!(%id, collection = T::collection_name(), "Store::get: called");
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                params![T::collection_name(), id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => {
                let record = serde_json::from_str(&json).context(format!("Failed to decode record {}", id))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Replace an existing record
    pub fn update<T: Record>(&mut self, record: T) -> Result<()> {
        debug!(id = record.id(), collection = T::collection_name(), "Store::update: called");
        if self.get::<T>(record.id())?.is_none() {
            return Err(eyre!("Record not found: {}/{}", T::collection_name(), record.id()));
        }
        self.write_record(&record)
    }

    /// Delete a record and its index rows, returning whether it existed
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<bool> {
        debug!(%id, collection = T::collection_name(), "Store::delete: called");
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
        )?;
        tx.execute(
            "DELETE FROM indexes WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// List records matching all filters, most recently updated first
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        debug!(collection = T::collection_name(), filter_count = filters.len(), "Store::list: called");
        let index = self.load_index(T::collection_name())?;
        let empty = HashMap::new();

        let mut stmt = self
            .conn
            .prepare("SELECT id, data FROM records WHERE collection = ?1 ORDER BY updated_at DESC, id ASC")?;
        let rows = stmt.query_map(params![T::collection_name()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, data) = row?;
            let fields = index.get(&id).unwrap_or(&empty);
            if filters.iter().all(|f| f.matches(fields)) {
                let record = serde_json::from_str(&data).context(format!("Failed to decode record {}", id))?;
                records.push(record);
            }
        }

        debug!(count = records.len(), "Store::list: matched records");
        Ok(records)
    }

    /// Recompute index rows for every record in a collection
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        debug!(collection = T::collection_name(), "Store::rebuild_indexes: called");
        let records: Vec<T> = self.list(&[])?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM indexes WHERE collection = ?1", params![T::collection_name()])?;
        for record in &records {
            for (field, value) in record.indexed_fields() {
                tx.execute(
                    "INSERT INTO indexes (collection, id, field, value) VALUES (?1, ?2, ?3, ?4)",
                    params![T::collection_name(), record.id(), field, value.encode()],
                )?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn write_record<T: Record>(&mut self, record: &T) -> Result<()> {
        let data = serde_json::to_string(record).context("Failed to encode record")?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO records (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![T::collection_name(), record.id(), data, record.updated_at()],
        )?;
        tx.execute(
            "DELETE FROM indexes WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), record.id()],
        )?;
        for (field, value) in record.indexed_fields() {
            tx.execute(
                "INSERT INTO indexes (collection, id, field, value) VALUES (?1, ?2, ?3, ?4)",
                params![T::collection_name(), record.id(), field, value.encode()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_index(&self, collection: &str) -> Result<HashMap<String, HashMap<String, String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, field, value FROM indexes WHERE collection = ?1")?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut index: HashMap<String, HashMap<String, String>> = HashMap::new();
        for row in rows {
            let (id, field, value) = row?;
            index.entry(id).or_default().insert(field, value);
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FilterOp, IndexValue, now_ms};
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
        status: String,
        updated_at: i64,
    }

    impl Note {
        fn new(id: &str, status: &str) -> Self {
            Self {
                id: id.to_string(),
                body: format!("note {}", id),
                status: status.to_string(),
                updated_at: now_ms(),
            }
        }
    }

    impl Record for Note {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "notes"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), IndexValue::String(self.status.clone()));
            fields
        }
    }

    #[test]
    fn test_create_and_get() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();

        let id = store.create(Note::new("a", "open")).unwrap();
        assert_eq!(id, "a");

        let note: Note = store.get("a").unwrap().unwrap();
        assert_eq!(note.body, "note a");
        assert!(store.get::<Note>("missing").unwrap().is_none());
    }

    #[test]
    fn test_create_duplicate_fails() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();

        store.create(Note::new("a", "open")).unwrap();
        assert!(store.create(Note::new("a", "open")).is_err());
    }

    #[test]
    fn test_update_requires_existing() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();

        assert!(store.update(Note::new("ghost", "open")).is_err());

        store.create(Note::new("a", "open")).unwrap();
        let mut note: Note = store.get("a").unwrap().unwrap();
        note.status = "closed".to_string();
        store.update(note).unwrap();

        let note: Note = store.get("a").unwrap().unwrap();
        assert_eq!(note.status, "closed");
    }

    #[test]
    fn test_list_with_filters() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();

        store.create(Note::new("a", "open")).unwrap();
        store.create(Note::new("b", "closed")).unwrap();
        store.create(Note::new("c", "open")).unwrap();

        let all: Vec<Note> = store.list(&[]).unwrap();
        assert_eq!(all.len(), 3);

        let open: Vec<Note> = store
            .list(&[Filter::eq("status", IndexValue::String("open".into()))])
            .unwrap();
        assert_eq!(open.len(), 2);

        let not_open: Vec<Note> = store
            .list(&[Filter {
                field: "status".to_string(),
                op: FilterOp::Ne,
                value: IndexValue::String("open".into()),
            }])
            .unwrap();
        assert_eq!(not_open.len(), 1);
        assert_eq!(not_open[0].id, "b");
    }

    #[test]
    fn test_delete() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();

        store.create(Note::new("a", "open")).unwrap();
        assert!(store.delete::<Note>("a").unwrap());
        assert!(!store.delete::<Note>("a").unwrap());
        assert!(store.get::<Note>("a").unwrap().is_none());
    }

    #[test]
    fn test_reopen_persists_and_rebuilds() {
        let temp = tempdir().unwrap();
        {
            let mut store = Store::open(temp.path()).unwrap();
            store.create(Note::new("a", "open")).unwrap();
            store.create(Note::new("b", "open")).unwrap();
        }

        let mut store = Store::open(temp.path()).unwrap();
        assert_eq!(store.rebuild_indexes::<Note>().unwrap(), 2);
        let open: Vec<Note> = store
            .list(&[Filter::eq("status", IndexValue::String("open".into()))])
            .unwrap();
        assert_eq!(open.len(), 2);
    }
}
