//! Fault injection for exercising recovery paths.

use crate::backend::{DocumentStore, Expect, LogRead};
use crate::document::Document;
use crate::StoreError;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Wraps another store and fails on demand.
///
/// `fail_after_writes(n)` lets `n` more writes through and then rejects
/// every write with [`StoreError::Unavailable`], simulating a process that
/// dies part-way through a transaction. `set_down(true)` fails reads too.
pub struct FaultyStore {
    inner: Arc<dyn DocumentStore>,
    writes_left: AtomicI64,
    down: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            writes_left: AtomicI64::new(-1),
            down: AtomicBool::new(false),
        }
    }

    pub fn fail_after_writes(&self, n: u32) {
        self.writes_left.store(i64::from(n), Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Stop injecting faults.
    pub fn heal(&self) {
        self.writes_left.store(-1, Ordering::SeqCst);
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &Arc<dyn DocumentStore> {
        &self.inner
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".to_owned()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.check_read()?;
        let left = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            });
        match left {
            Ok(_) => Ok(()),
            Err(n) if n < 0 => Ok(()),
            Err(_) => Err(StoreError::Unavailable("injected write failure".to_owned())),
        }
    }
}

impl DocumentStore for FaultyStore {
    fn name(&self) -> &str {
        "faulty"
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check_read()?;
        self.inner.get(collection, id)
    }

    fn put(&self, collection: &str, doc: &Document, expect: Expect) -> Result<bool, StoreError> {
        self.check_write()?;
        self.inner.put(collection, doc, expect)
    }

    fn delete(&self, collection: &str, id: &str, revno: u64) -> Result<bool, StoreError> {
        self.check_write()?;
        self.inner.delete(collection, id, revno)
    }

    fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.check_read()?;
        self.inner.list(collection)
    }

    fn find(&self, collection: &str, path: &str, value: &Value) -> Result<Vec<Document>, StoreError> {
        self.check_read()?;
        self.inner.find(collection, path, value)
    }

    fn ensure_index(&self, collection: &str, path: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.ensure_index(collection, path)
    }

    fn indexes(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        self.check_read()?;
        self.inner.indexes(collection)
    }

    fn ensure_log(&self, capacity: usize) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.ensure_log(capacity)
    }

    fn append_log(
        &self,
        collection: &str,
        id: &str,
        revno: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.check_write()?;
        self.inner.append_log(collection, id, revno)
    }

    fn read_log(&self, after: u64, limit: usize) -> Result<LogRead, StoreError> {
        self.check_read()?;
        self.inner.read_log(after, limit)
    }

    fn log_head(&self) -> Result<u64, StoreError> {
        self.check_read()?;
        self.inner.log_head()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[test]
    fn write_budget_is_enforced() {
        let store = FaultyStore::new(Arc::new(MemoryStore::new()));
        store.fail_after_writes(1);
        let doc = Document::new("a", serde_json::Map::new());
        assert!(store.put("c", &doc, Expect::Absent).unwrap());
        assert!(store.delete("c", "a", 1).is_err());
        assert!(store.get("c", "a").unwrap().is_some(), "reads still work");
        store.heal();
        assert!(store.delete("c", "a", 1).unwrap());
    }

    #[test]
    fn outage_fails_reads() {
        let store = FaultyStore::new(Arc::new(MemoryStore::new()));
        store.set_down(true);
        assert!(matches!(
            store.get("c", "a"),
            Err(StoreError::Unavailable(_))
        ));
        store.set_down(false);
        assert!(store.get("c", "a").unwrap().is_none());
    }
}
