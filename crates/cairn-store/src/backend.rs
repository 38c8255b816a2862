use crate::document::{index_values, Document};
use crate::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default number of entries retained by the change log.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Precondition for a conditional single-document write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The id must not exist yet.
    Absent,
    /// The stored document must carry exactly this revision.
    Revno(u64),
    /// Unconditional write.
    Any,
}

/// One entry of the change log: a document in `collection` reached
/// revision `revno`, or was removed when `revno` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEntry {
    pub seq: u64,
    pub collection: String,
    pub id: String,
    pub revno: Option<u64>,
}

/// Result of tailing the change log from a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRead {
    pub entries: Vec<ChangeEntry>,
    /// Entries after the cursor were evicted before they could be read.
    pub gap: bool,
    /// Highest sequence number appended so far.
    pub head: u64,
}

impl LogRead {
    /// Build a read result from the retained window of a log.
    pub(crate) fn from_window<'a>(
        retained: impl Iterator<Item = &'a ChangeEntry>,
        first_retained: Option<u64>,
        head: u64,
        after: u64,
        limit: usize,
    ) -> Self {
        let entries: Vec<ChangeEntry> = retained
            .filter(|e| e.seq > after)
            .take(limit)
            .cloned()
            .collect();
        let gap = head > after && !matches!(first_retained, Some(first) if first <= after + 1);
        Self {
            entries,
            gap,
            head,
        }
    }
}

/// Storage seam for Cairn state.
///
/// Backends provide atomic conditional writes of single documents plus a
/// capped, append-only change log. Everything multi-document is built on
/// top of these primitives by [`Runner`](crate::Runner).
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Write `doc` if `expect` holds. Returns `false` when the precondition
    /// did not hold and nothing was written.
    fn put(&self, collection: &str, doc: &Document, expect: Expect) -> Result<bool, StoreError>;

    /// Delete the document if it is still at `revno`.
    fn delete(&self, collection: &str, id: &str, revno: u64) -> Result<bool, StoreError>;

    /// All documents of a collection, ordered by id.
    fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    /// Documents whose value at `path` equals `value` (array members match).
    fn find(&self, collection: &str, path: &str, value: &Value) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .list(collection)?
            .into_iter()
            .filter(|doc| index_values(&doc.fields, path).contains(value))
            .collect())
    }

    fn ensure_index(&self, collection: &str, path: &str) -> Result<(), StoreError>;

    fn indexes(&self, collection: &str) -> Result<Vec<String>, StoreError>;

    /// Create the change log if needed and set its capacity.
    fn ensure_log(&self, capacity: usize) -> Result<(), StoreError>;

    /// Append a change entry, evicting the oldest beyond capacity.
    /// Returns the new entry's sequence number.
    fn append_log(&self, collection: &str, id: &str, revno: Option<u64>)
        -> Result<u64, StoreError>;

    /// Entries with `seq > after`, oldest first, at most `limit` of them.
    fn read_log(&self, after: u64, limit: usize) -> Result<LogRead, StoreError>;

    fn log_head(&self) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64) -> ChangeEntry {
        ChangeEntry {
            seq,
            collection: "units".to_owned(),
            id: format!("u{seq}"),
            revno: Some(1),
        }
    }

    #[test]
    fn window_without_eviction_has_no_gap() {
        let log = [entry(1), entry(2), entry(3)];
        let read = LogRead::from_window(log.iter(), Some(1), 3, 0, 10);
        assert_eq!(read.entries.len(), 3);
        assert!(!read.gap);
        assert_eq!(read.head, 3);
    }

    #[test]
    fn window_reports_gap_after_eviction() {
        let log = [entry(5), entry(6)];
        let read = LogRead::from_window(log.iter(), Some(5), 6, 2, 10);
        assert!(read.gap, "entries 3 and 4 were evicted");
        assert_eq!(read.entries.len(), 2);
    }

    #[test]
    fn caught_up_cursor_has_no_gap() {
        let log = [entry(5), entry(6)];
        let read = LogRead::from_window(log.iter(), Some(5), 6, 6, 10);
        assert!(!read.gap);
        assert!(read.entries.is_empty());
    }

    #[test]
    fn limit_bounds_entries() {
        let log = [entry(1), entry(2), entry(3)];
        let read = LogRead::from_window(log.iter(), Some(1), 3, 0, 2);
        assert_eq!(read.entries.len(), 2);
        assert_eq!(read.entries[1].seq, 2);
    }
}
