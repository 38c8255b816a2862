use crate::backend::{ChangeEntry, DocumentStore, Expect, LogRead, DEFAULT_LOG_CAPACITY};
use crate::document::Document;
use crate::layout::{write_atomic, StoreLayout};
use crate::{validate_collection, StoreError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOG_LOCK: &str = "log";
const INDEX_LOCK: &str = "indexes";

/// Exclusive advisory lock held for the duration of a conditional write.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", path.display())))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// On-disk envelope of a document with its blake3 checksum.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    checksum: String,
    document: Document,
}

impl StoredDocument {
    fn seal(doc: &Document) -> Result<Self, StoreError> {
        Ok(Self {
            checksum: checksum(doc)?,
            document: doc.clone(),
        })
    }
}

fn checksum(doc: &Document) -> Result<String, StoreError> {
    let json = serde_json::to_vec(doc)?;
    Ok(blake3::hash(&json).to_hex().to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LogMeta {
    capacity: usize,
    head: u64,
    /// Oldest retained sequence number; `head + 1` when the log is empty.
    first: u64,
}

impl Default for LogMeta {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOG_CAPACITY,
            head: 0,
            first: 1,
        }
    }
}

/// Directory-backed document store.
///
/// Every document is its own JSON file, replaced atomically. Conditional
/// writes hold a per-collection `flock`, so several processes may share one
/// store directory.
pub struct FileStore {
    layout: StoreLayout,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        debug!("opened file store at {}", layout.root().display());
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn read_doc(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let path = self.layout.document_path(collection, id);
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredDocument = serde_json::from_slice(&content)?;
        if checksum(&stored.document)? != stored.checksum || stored.document.id != id {
            return Err(StoreError::IntegrityFailure {
                collection: collection.to_owned(),
                id: id.to_owned(),
            });
        }
        Ok(Some(stored.document))
    }

    fn write_doc(&self, collection: &str, doc: &Document) -> Result<(), StoreError> {
        let dir = self.layout.collection_dir(collection);
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_vec_pretty(&StoredDocument::seal(doc)?)?;
        write_atomic(&dir, &self.layout.document_path(collection, &doc.id), &content)
    }

    fn lock(&self, name: &str) -> Result<FileLock, StoreError> {
        FileLock::acquire(&self.layout.lock_file(name))
    }

    fn read_log_meta(&self) -> Result<LogMeta, StoreError> {
        match fs::read(self.layout.log_meta_file()) {
            Ok(c) => Ok(serde_json::from_slice(&c)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LogMeta::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_log_meta(&self, meta: LogMeta) -> Result<(), StoreError> {
        write_atomic(
            &self.layout.log_dir(),
            &self.layout.log_meta_file(),
            &serde_json::to_vec(&meta)?,
        )
    }

    fn evict(&self, meta: &mut LogMeta) -> Result<(), StoreError> {
        while meta.head + 1 - meta.first > meta.capacity as u64 {
            match fs::remove_file(self.layout.log_entry_path(meta.first)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            meta.first += 1;
        }
        Ok(())
    }

    fn read_indexes(&self) -> Result<BTreeMap<String, BTreeSet<String>>, StoreError> {
        match fs::read(self.layout.indexes_file()) {
            Ok(c) => Ok(serde_json::from_slice(&c)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl DocumentStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        validate_collection(collection)?;
        self.read_doc(collection, id)
    }

    fn put(&self, collection: &str, doc: &Document, expect: Expect) -> Result<bool, StoreError> {
        validate_collection(collection)?;
        let _lock = self.lock(collection)?;
        let current = self.read_doc(collection, &doc.id)?;
        let ok = match (expect, &current) {
            (Expect::Absent, None) | (Expect::Any, _) => true,
            (Expect::Revno(revno), Some(cur)) => cur.revno == revno,
            _ => false,
        };
        if ok {
            self.write_doc(collection, doc)?;
        }
        Ok(ok)
    }

    fn delete(&self, collection: &str, id: &str, revno: u64) -> Result<bool, StoreError> {
        validate_collection(collection)?;
        let _lock = self.lock(collection)?;
        match self.read_doc(collection, id)? {
            Some(cur) if cur.revno == revno => {
                let dir = self.layout.collection_dir(collection);
                fs::remove_file(self.layout.document_path(collection, id))?;
                crate::fsync_dir(&dir)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let dir = self.layout.collection_dir(collection);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut docs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_str().unwrap_or("");
            let Some(encoded) = name.strip_suffix(".json") else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(id) = hex::decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            else {
                warn!("skipping unrecognized file '{name}' in collection '{collection}'");
                continue;
            };
            // The file may have been deleted since read_dir.
            if let Some(doc) = self.read_doc(collection, &id)? {
                docs.push(doc);
            }
        }
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    fn ensure_index(&self, collection: &str, path: &str) -> Result<(), StoreError> {
        validate_collection(collection)?;
        let _lock = self.lock(INDEX_LOCK)?;
        let mut indexes = self.read_indexes()?;
        if indexes
            .entry(collection.to_owned())
            .or_default()
            .insert(path.to_owned())
        {
            write_atomic(
                &self.layout.store_dir(),
                &self.layout.indexes_file(),
                &serde_json::to_vec_pretty(&indexes)?,
            )?;
            debug!("created index {collection}.{path}");
        }
        Ok(())
    }

    fn indexes(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read_indexes()?
            .remove(collection)
            .map(|paths| paths.into_iter().collect())
            .unwrap_or_default())
    }

    fn ensure_log(&self, capacity: usize) -> Result<(), StoreError> {
        let _lock = self.lock(LOG_LOCK)?;
        let mut meta = self.read_log_meta()?;
        meta.capacity = capacity.max(1);
        self.evict(&mut meta)?;
        self.write_log_meta(meta)
    }

    fn append_log(
        &self,
        collection: &str,
        id: &str,
        revno: Option<u64>,
    ) -> Result<u64, StoreError> {
        validate_collection(collection)?;
        let _lock = self.lock(LOG_LOCK)?;
        let mut meta = self.read_log_meta()?;
        let entry = ChangeEntry {
            seq: meta.head + 1,
            collection: collection.to_owned(),
            id: id.to_owned(),
            revno,
        };
        write_atomic(
            &self.layout.log_dir(),
            &self.layout.log_entry_path(entry.seq),
            &serde_json::to_vec(&entry)?,
        )?;
        meta.head = entry.seq;
        self.evict(&mut meta)?;
        self.write_log_meta(meta)?;
        Ok(entry.seq)
    }

    fn read_log(&self, after: u64, limit: usize) -> Result<LogRead, StoreError> {
        let meta = self.read_log_meta()?;
        let mut entries = Vec::new();
        let mut evicted = false;
        let start = (after + 1).max(meta.first);
        for seq in start..=meta.head {
            if entries.len() >= limit {
                break;
            }
            match fs::read(self.layout.log_entry_path(seq)) {
                Ok(c) => entries.push(serde_json::from_slice::<ChangeEntry>(&c)?),
                // Evicted by a concurrent append after we read the meta.
                Err(e) if e.kind() == ErrorKind::NotFound => evicted = true,
                Err(e) => return Err(e.into()),
            }
        }
        let first = if evicted {
            entries.first().map(|e| e.seq)
        } else {
            Some(meta.first)
        };
        Ok(LogRead::from_window(
            entries.iter(),
            first,
            meta.head,
            after,
            limit,
        ))
    }

    fn log_head(&self) -> Result<u64, StoreError> {
        Ok(self.read_log_meta()?.head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str) -> Document {
        Document::new(id, json!({"life": "alive"}).as_object().cloned().unwrap())
    }

    #[test]
    fn put_get_roundtrip_with_slash_in_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.put("units", &doc("wordpress/0"), Expect::Absent).unwrap());
        let got = store.get("units", "wordpress/0").unwrap().unwrap();
        assert_eq!(got.str_field("life"), "alive");
        assert_eq!(store.list("units").unwrap().len(), 1);
    }

    #[test]
    fn conditional_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let mut d = doc("m");
        store.put("machines", &d, Expect::Absent).unwrap();
        assert!(!store.put("machines", &d, Expect::Absent).unwrap());
        d.revno = 2;
        assert!(!store.put("machines", &d, Expect::Revno(2)).unwrap());
        assert!(store.put("machines", &d, Expect::Revno(1)).unwrap());
        assert!(!store.delete("machines", "m", 1).unwrap());
        assert!(store.delete("machines", "m", 2).unwrap());
        assert!(store.get("machines", "m").unwrap().is_none());
    }

    #[test]
    fn tampered_document_fails_integrity_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put("units", &doc("a/0"), Expect::Absent).unwrap();
        let path = store.layout().document_path("units", "a/0");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("alive", "dead!")).unwrap();
        assert!(matches!(
            store.get("units", "a/0"),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn log_survives_reopen_and_evicts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.ensure_log(2).unwrap();
            for i in 0..4 {
                store.append_log("units", &format!("u{i}"), Some(1)).unwrap();
            }
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.log_head().unwrap(), 4);
        let read = store.read_log(0, 10).unwrap();
        assert!(read.gap);
        assert_eq!(
            read.entries.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(!store.layout().log_entry_path(1).exists());
        let read = store.read_log(2, 10).unwrap();
        assert!(!read.gap);
    }

    #[test]
    fn indexes_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.ensure_index("relations", "endpoints.interface").unwrap();
        store.ensure_index("relations", "endpoints.interface").unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            store.indexes("relations").unwrap(),
            vec!["endpoints.interface".to_owned()]
        );
        store
            .put(
                "relations",
                &Document::new(
                    "r",
                    json!({"endpoints": [{"interface": "mysql"}]})
                        .as_object()
                        .cloned()
                        .unwrap(),
                ),
                Expect::Absent,
            )
            .unwrap();
        let found = store
            .find("relations", "endpoints.interface", &json!("mysql"))
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn concurrent_creates_of_same_id_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        FileStore::open(&root).unwrap();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let root = root.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let store = FileStore::open(&root).unwrap();
                    barrier.wait();
                    store.put("machines", &doc("0"), Expect::Absent).unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1, "exactly one create must win");
    }
}
