use crate::backend::{ChangeEntry, DocumentStore, Expect, LogRead, DEFAULT_LOG_CAPACITY};
use crate::document::{index_values, Document};
use crate::{validate_collection, StoreError};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

type IndexKey = (String, String);
type IndexMap = BTreeMap<String, BTreeSet<String>>;

struct Inner {
    collections: BTreeMap<String, BTreeMap<String, Document>>,
    /// (collection, path) -> encoded value -> ids.
    indexes: BTreeMap<IndexKey, IndexMap>,
    log: VecDeque<ChangeEntry>,
    log_capacity: usize,
    head: u64,
}

impl Inner {
    fn unindex(&mut self, collection: &str, doc: &Document) {
        for ((coll, path), index) in &mut self.indexes {
            if coll != collection {
                continue;
            }
            for value in index_values(&doc.fields, path) {
                let key = value.to_string();
                if let Some(ids) = index.get_mut(&key) {
                    ids.remove(&doc.id);
                    if ids.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
    }

    fn reindex(&mut self, collection: &str, doc: &Document) {
        for ((coll, path), index) in &mut self.indexes {
            if coll != collection {
                continue;
            }
            for value in index_values(&doc.fields, path) {
                index
                    .entry(value.to_string())
                    .or_default()
                    .insert(doc.id.clone());
            }
        }
    }

    fn evict(&mut self) {
        while self.log.len() > self.log_capacity {
            self.log.pop_front();
        }
    }
}

/// In-process document store.
///
/// All state lives behind a single mutex, so every operation is trivially
/// atomic. Shared between threads through `Arc<dyn DocumentStore>`.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                collections: BTreeMap::new(),
                indexes: BTreeMap::new(),
                log: VecDeque::new(),
                log_capacity: DEFAULT_LOG_CAPACITY,
                head: 0,
            }),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))
    }
}

impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        validate_collection(collection)?;
        let inner = self.lock()?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn put(&self, collection: &str, doc: &Document, expect: Expect) -> Result<bool, StoreError> {
        validate_collection(collection)?;
        let mut inner = self.lock()?;
        let current = inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(&doc.id))
            .cloned();
        let ok = match (expect, &current) {
            (Expect::Absent, None) | (Expect::Any, _) => true,
            (Expect::Revno(revno), Some(cur)) => cur.revno == revno,
            _ => false,
        };
        if !ok {
            return Ok(false);
        }
        if let Some(cur) = &current {
            inner.unindex(collection, cur);
        }
        inner.reindex(collection, doc);
        inner
            .collections
            .entry(collection.to_owned())
            .or_default()
            .insert(doc.id.clone(), doc.clone());
        Ok(true)
    }

    fn delete(&self, collection: &str, id: &str, revno: u64) -> Result<bool, StoreError> {
        validate_collection(collection)?;
        let mut inner = self.lock()?;
        let current = inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned();
        match current {
            Some(cur) if cur.revno == revno => {
                inner.unindex(collection, &cur);
                if let Some(docs) = inner.collections.get_mut(collection) {
                    docs.remove(id);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let inner = self.lock()?;
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn find(&self, collection: &str, path: &str, value: &Value) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let inner = self.lock()?;
        let Some(docs) = inner.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let key = (collection.to_owned(), path.to_owned());
        if let Some(index) = inner.indexes.get(&key) {
            let ids = index.get(&value.to_string());
            return Ok(ids
                .into_iter()
                .flatten()
                .filter_map(|id| docs.get(id).cloned())
                .collect());
        }
        Ok(docs
            .values()
            .filter(|doc| index_values(&doc.fields, path).contains(value))
            .cloned()
            .collect())
    }

    fn ensure_index(&self, collection: &str, path: &str) -> Result<(), StoreError> {
        validate_collection(collection)?;
        let mut inner = self.lock()?;
        let key = (collection.to_owned(), path.to_owned());
        if inner.indexes.contains_key(&key) {
            return Ok(());
        }
        let mut index = IndexMap::new();
        if let Some(docs) = inner.collections.get(collection) {
            for doc in docs.values() {
                for value in index_values(&doc.fields, path) {
                    index
                        .entry(value.to_string())
                        .or_default()
                        .insert(doc.id.clone());
                }
            }
        }
        inner.indexes.insert(key, index);
        Ok(())
    }

    fn indexes(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .indexes
            .keys()
            .filter(|(coll, _)| coll == collection)
            .map(|(_, path)| path.clone())
            .collect())
    }

    fn ensure_log(&self, capacity: usize) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.log_capacity = capacity.max(1);
        inner.evict();
        Ok(())
    }

    fn append_log(
        &self,
        collection: &str,
        id: &str,
        revno: Option<u64>,
    ) -> Result<u64, StoreError> {
        validate_collection(collection)?;
        let mut inner = self.lock()?;
        inner.head += 1;
        let seq = inner.head;
        inner.log.push_back(ChangeEntry {
            seq,
            collection: collection.to_owned(),
            id: id.to_owned(),
            revno,
        });
        inner.evict();
        Ok(seq)
    }

    fn read_log(&self, after: u64, limit: usize) -> Result<LogRead, StoreError> {
        let inner = self.lock()?;
        let first = inner.log.front().map(|e| e.seq);
        Ok(LogRead::from_window(
            inner.log.iter(),
            first,
            inner.head,
            after,
            limit,
        ))
    }

    fn log_head(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, value: Value) -> Document {
        Document::new(id, value.as_object().cloned().unwrap())
    }

    #[test]
    fn put_absent_only_once() {
        let store = MemoryStore::new();
        let d = doc("a", json!({"x": 1}));
        assert!(store.put("c", &d, Expect::Absent).unwrap());
        assert!(!store.put("c", &d, Expect::Absent).unwrap());
    }

    #[test]
    fn put_compares_revno() {
        let store = MemoryStore::new();
        let mut d = doc("a", json!({"x": 1}));
        store.put("c", &d, Expect::Absent).unwrap();
        d.revno = 2;
        assert!(!store.put("c", &d, Expect::Revno(7)).unwrap());
        assert!(store.put("c", &d, Expect::Revno(1)).unwrap());
        assert_eq!(store.get("c", "a").unwrap().unwrap().revno, 2);
    }

    #[test]
    fn delete_requires_matching_revno() {
        let store = MemoryStore::new();
        store.put("c", &doc("a", json!({})), Expect::Absent).unwrap();
        assert!(!store.delete("c", "a", 5).unwrap());
        assert!(store.delete("c", "a", 1).unwrap());
        assert!(store.get("c", "a").unwrap().is_none());
        assert!(!store.delete("c", "a", 1).unwrap());
    }

    #[test]
    fn indexed_find_tracks_updates() {
        let store = MemoryStore::new();
        store.ensure_index("relations", "endpoints.service_name").unwrap();
        let rel = doc(
            "wordpress:db mysql:server",
            json!({"endpoints": [{"service_name": "wordpress"}, {"service_name": "mysql"}]}),
        );
        store.put("relations", &rel, Expect::Absent).unwrap();

        let found = store
            .find("relations", "endpoints.service_name", &json!("mysql"))
            .unwrap();
        assert_eq!(found.len(), 1);

        store.delete("relations", &rel.id, 1).unwrap();
        let found = store
            .find("relations", "endpoints.service_name", &json!("mysql"))
            .unwrap();
        assert!(found.is_empty(), "deleted document must leave the index");
        assert_eq!(
            store.indexes("relations").unwrap(),
            vec!["endpoints.service_name".to_owned()]
        );
    }

    #[test]
    fn unindexed_find_scans() {
        let store = MemoryStore::new();
        store.put("c", &doc("a", json!({"life": "alive"})), Expect::Absent).unwrap();
        store.put("c", &doc("b", json!({"life": "dead"})), Expect::Absent).unwrap();
        let found = store.find("c", "life", &json!("dead")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "b");
    }

    #[test]
    fn log_is_capped() {
        let store = MemoryStore::new();
        store.ensure_log(3).unwrap();
        for i in 0..5 {
            store.append_log("c", &format!("d{i}"), Some(1)).unwrap();
        }
        assert_eq!(store.log_head().unwrap(), 5);
        let read = store.read_log(0, 100).unwrap();
        assert!(read.gap);
        assert_eq!(
            read.entries.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        let read = store.read_log(2, 100).unwrap();
        assert!(!read.gap);
    }

    #[test]
    fn invalid_collection_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("../x", "a"),
            Err(StoreError::InvalidCollection(_))
        ));
    }
}
