//! The durable key-value interface: hex-string keys, opaque byte values.
//! One sqlite-backed implementation for production, one in-memory for
//! tests.

use crate::error::{StoreError, StoreResult};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;
    fn del(&self, key: &str) -> StoreResult<()>;
    fn batch(&self, ops: &[BatchOp]) -> StoreResult<()>;
    /// Total stored value bytes.
    fn size(&self) -> StoreResult<u64>;
    /// All keys, unordered. Drives radius eviction scans.
    fn keys(&self) -> StoreResult<Vec<String>>;
}

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );
";

pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Storage("kv mutex poisoned".to_string()))
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
        Ok(stmt
            .query_row(params![key], |r| r.get::<_, Vec<u8>>(0))
            .optional()?)
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn del(&self, key: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn batch(&self, ops: &[BatchOp]) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    tx.execute(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![key, value],
                    )?;
                }
                BatchOp::Del { key } => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let total: i64 = conn.query_row("SELECT IFNULL(SUM(LENGTH(value)), 0) FROM kv", [], |r| {
            r.get(0)
        })?;
        Ok(total as u64)
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT key FROM kv")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// In-memory store with the same semantics, for tests.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &str) -> StoreResult<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn batch(&self, ops: &[BatchOp]) -> StoreResult<()> {
        let mut map = self.map.lock().unwrap();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Del { key } => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self
            .map
            .lock()
            .unwrap()
            .values()
            .map(|v| v.len() as u64)
            .sum())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.map.lock().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) {
        assert_eq!(store.get("aa").unwrap(), None);
        store.put("aa", &[1, 2, 3]).unwrap();
        assert_eq!(store.get("aa").unwrap(), Some(vec![1, 2, 3]));
        // Idempotent overwrite.
        store.put("aa", &[1, 2, 3]).unwrap();
        assert_eq!(store.size().unwrap(), 3);

        store
            .batch(&[
                BatchOp::Put {
                    key: "bb".to_string(),
                    value: vec![4; 10],
                },
                BatchOp::Del {
                    key: "aa".to_string(),
                },
            ])
            .unwrap();
        assert_eq!(store.get("aa").unwrap(), None);
        assert_eq!(store.size().unwrap(), 10);
        assert_eq!(store.keys().unwrap(), vec!["bb".to_string()]);

        store.del("bb").unwrap();
        assert_eq!(store.size().unwrap(), 0);
    }

    #[test]
    fn memory_kv_semantics() {
        exercise(&MemoryKv::new());
    }

    #[test]
    fn sqlite_kv_semantics() {
        exercise(&SqliteKv::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_kv_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.db");
        {
            let store = SqliteKv::open(&path).unwrap();
            store.put("key", &[9, 9]).unwrap();
        }
        let store = SqliteKv::open(&path).unwrap();
        assert_eq!(store.get("key").unwrap(), Some(vec![9, 9]));
    }
}
