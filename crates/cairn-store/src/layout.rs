use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current on-disk format version of a file-backed store.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a file-backed document store.
///
/// ```text
/// <root>/store/version
/// <root>/store/indexes.json
/// <root>/store/collections/<collection>/<hex(id)>.json
/// <root>/store/locks/<name>.lock
/// <root>/store/log/meta.json
/// <root>/store/log/<seq>.json
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn collections_dir(&self) -> PathBuf {
        self.store_dir().join("collections")
    }

    #[inline]
    pub fn collection_dir(&self, collection: &str) -> PathBuf {
        self.collections_dir().join(collection)
    }

    /// Ids are hex-encoded so that `/` in unit names never reaches the path.
    #[inline]
    pub fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.json", hex::encode(id.as_bytes())))
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.store_dir().join("locks")
    }

    #[inline]
    pub fn lock_file(&self, name: &str) -> PathBuf {
        self.locks_dir().join(format!("{name}.lock"))
    }

    #[inline]
    pub fn log_dir(&self) -> PathBuf {
        self.store_dir().join("log")
    }

    #[inline]
    pub fn log_meta_file(&self) -> PathBuf {
        self.log_dir().join("meta.json")
    }

    #[inline]
    pub fn log_entry_path(&self, seq: u64) -> PathBuf {
        self.log_dir().join(format!("{seq:020}.json"))
    }

    #[inline]
    pub fn indexes_file(&self) -> PathBuf {
        self.store_dir().join("indexes.json")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.collections_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.log_dir())?;

        let version_path = self.store_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            write_atomic(&self.store_dir(), &version_path, &serde_json::to_vec_pretty(&ver)?)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.store_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

/// Write `content` to `dest` through a temp file in `dir`, then rename and
/// fsync the directory.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    crate::fsync_dir(dir)?;
    Ok(())
}
