//! Multi-document transactions over single-document conditional writes.
//!
//! A transaction is a list of [`Op`]s. Running it:
//!
//! 1. inserts a [`TxnRecord`] in state `preparing` into the `txns` collection;
//! 2. stamps every target document (in `(collection, id)` order) with the
//!    transaction id, checking that op's assertions at the same revision;
//! 3. flips the record to `prepared`, after which the transaction is
//!    committed and anyone may finish applying it;
//! 4. applies each op, clearing the stamp, then marks the record `applied`
//!    and deletes it.
//!
//! A document stamped by another transaction is never read as authoritative.
//! Readers and writers resolve it first: a `prepared` or `applied` owner is
//! helped to completion, a missing or `aborted` owner's stamp is stripped,
//! and a `preparing` owner is waited on and, after `conflict_wait`, aborted.

use crate::backend::{DocumentStore, Expect};
use crate::document::{get_path, remove_path, set_path, Document, Fields};
use crate::StoreError;
use cairn_schema::{TxnId, TxnSection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Collection holding in-flight transaction records.
pub const TXNS: &str = "txns";

static TXN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("transaction aborted: {0}")]
    PreconditionFailed(String),
    #[error("transaction lost to concurrent writers after {attempts} attempts")]
    Conflict { attempts: u32 },
    #[error("store unavailable after {attempts} attempts: {source}")]
    Transport { attempts: u32, source: StoreError },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid transaction: {0}")]
    Invalid(String),
}

/// A condition a target document must satisfy at stamping time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assert {
    Exists,
    Missing,
    Eq(String, Value),
    Ne(String, Value),
    FieldMissing(String),
}

impl Assert {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Assert::Eq(path.into(), value.into())
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Assert::Ne(path.into(), value.into())
    }

    pub fn field_missing(path: impl Into<String>) -> Self {
        Assert::FieldMissing(path.into())
    }

    fn holds(&self, doc: Option<&Document>) -> bool {
        match (self, doc) {
            (Assert::Exists, d) => d.is_some(),
            (Assert::Missing, d) => d.is_none(),
            (Assert::Eq(path, value), Some(d)) => d.get(path) == Some(value),
            (Assert::Ne(path, value), Some(d)) => d.get(path) != Some(value),
            (Assert::FieldMissing(path), Some(d)) => d.get(path).is_none(),
            (_, None) => false,
        }
    }
}

impl fmt::Display for Assert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assert::Exists => f.write_str("document exists"),
            Assert::Missing => f.write_str("document is missing"),
            Assert::Eq(path, value) => write!(f, "{path} == {value}"),
            Assert::Ne(path, value) => write!(f, "{path} != {value}"),
            Assert::FieldMissing(path) => write!(f, "{path} is unset"),
        }
    }
}

/// A single field mutation applied by [`Change::Update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOp {
    Set(String, Value),
    Unset(String),
    Inc(String, i64),
    AddToSet(String, Value),
    Pull(String, Value),
}

impl FieldOp {
    pub fn set(path: impl Into<String>, value: impl Into<Value>) -> Self {
        FieldOp::Set(path.into(), value.into())
    }

    fn apply(&self, fields: &mut Fields) {
        match self {
            FieldOp::Set(path, value) => set_path(fields, path, value.clone()),
            FieldOp::Unset(path) => remove_path(fields, path),
            FieldOp::Inc(path, delta) => {
                let base = match get_path(fields, path) {
                    None => 0,
                    Some(v) => v.as_i64().unwrap_or_else(|| {
                        warn!("incrementing non-integer field {path}; treating {v} as 0");
                        0
                    }),
                };
                set_path(fields, path, Value::from(base.saturating_add(*delta)));
            }
            FieldOp::AddToSet(path, value) => {
                let mut items = match get_path(fields, path) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                if !items.contains(value) {
                    items.push(value.clone());
                }
                set_path(fields, path, Value::Array(items));
            }
            FieldOp::Pull(path, value) => {
                if let Some(Value::Array(items)) = get_path(fields, path) {
                    let kept: Vec<Value> =
                        items.iter().filter(|v| *v != value).cloned().collect();
                    set_path(fields, path, Value::Array(kept));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Insert(Fields),
    Update(Vec<FieldOp>),
    Remove,
}

/// One target document of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub collection: String,
    pub id: String,
    #[serde(default)]
    pub asserts: Vec<Assert>,
    #[serde(default)]
    pub change: Option<Change>,
}

impl Op {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            asserts: Vec::new(),
            change: None,
        }
    }

    #[must_use]
    pub fn assert(mut self, assert: Assert) -> Self {
        self.asserts.push(assert);
        self
    }

    #[must_use]
    pub fn insert(mut self, fields: Fields) -> Self {
        self.change = Some(Change::Insert(fields));
        self
    }

    #[must_use]
    pub fn update(mut self, ops: Vec<FieldOp>) -> Self {
        self.change = Some(Change::Update(ops));
        self
    }

    #[must_use]
    pub fn remove(mut self) -> Self {
        self.change = Some(Change::Remove);
        self
    }

    fn implied_assert(&self) -> Option<Assert> {
        match self.change {
            Some(Change::Insert(_)) => Some(Assert::Missing),
            Some(Change::Update(_) | Change::Remove) => Some(Assert::Exists),
            None => None,
        }
    }

    /// First assertion that does not hold for `doc`, if any.
    fn failed_assert(&self, doc: Option<&Document>) -> Option<Assert> {
        self.implied_assert()
            .into_iter()
            .chain(self.asserts.iter().cloned())
            .find(|a| !a.holds(doc))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnState {
    Preparing,
    Prepared,
    Applied,
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Preparing => write!(f, "preparing"),
            TxnState::Prepared => write!(f, "prepared"),
            TxnState::Applied => write!(f, "applied"),
            TxnState::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub id: TxnId,
    pub state: TxnState,
    pub ops: Vec<Op>,
    pub created_at: DateTime<Utc>,
}

/// Why a single attempt did not commit.
enum Failure {
    Precondition(String),
    Conflict,
    Store(StoreError),
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Failure::Store(e)
    }
}

fn new_txn_id() -> TxnId {
    let now = Utc::now();
    let n = TXN_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!(
        "{}:{}:{}",
        std::process::id(),
        n,
        now.timestamp_nanos_opt().unwrap_or_default()
    );
    let hash = blake3::hash(seed.as_bytes()).to_hex();
    TxnId::new(format!("{}-{}", now.format("%Y%m%dT%H%M%S%.6f"), &hash[..12]))
}

/// Runs transactions against a [`DocumentStore`].
#[derive(Clone)]
pub struct Runner {
    store: Arc<dyn DocumentStore>,
    config: TxnSection,
}

impl Runner {
    pub fn new(store: Arc<dyn DocumentStore>, config: TxnSection) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &TxnSection {
        &self.config
    }

    /// Apply every op or none of them.
    ///
    /// Assertion failures return [`TxnError::PreconditionFailed`] at once.
    /// Lost races and transient store errors are retried up to
    /// `max_attempts` times with doubling backoff.
    pub fn run(&self, ops: Vec<Op>) -> Result<(), TxnError> {
        validate_ops(&ops)?;
        let mut ops = ops;
        ops.sort_by(|a, b| (&a.collection, &a.id).cmp(&(&b.collection, &b.id)));

        let mut backoff = self.config.backoff();
        let mut last_store_error = None;
        for attempt in 1..=self.config.max_attempts {
            let txn = new_txn_id();
            match self.try_run(&txn, &ops) {
                Ok(()) => return Ok(()),
                Err(Failure::Precondition(reason)) => {
                    debug!("txn {txn} aborted: {reason}");
                    return Err(TxnError::PreconditionFailed(reason));
                }
                Err(Failure::Conflict) => {
                    debug!("txn {txn} lost a race (attempt {attempt})");
                    last_store_error = None;
                }
                Err(Failure::Store(e)) if e.is_transient() => {
                    warn!("txn {txn} failed on attempt {attempt}: {e}");
                    // Best effort; a stale record is aborted later by whoever
                    // trips over it.
                    if let Err(e) = self.abort(&txn) {
                        debug!("cannot abort txn {txn}: {e}");
                    }
                    last_store_error = Some(e);
                }
                Err(Failure::Store(e)) => return Err(TxnError::Store(e)),
            }
            if attempt < self.config.max_attempts {
                std::thread::sleep(backoff);
                backoff *= 2;
            }
        }
        let attempts = self.config.max_attempts;
        Err(match last_store_error {
            Some(source) => TxnError::Transport { attempts, source },
            None => TxnError::Conflict { attempts },
        })
    }

    fn try_run(&self, txn: &TxnId, ops: &[Op]) -> Result<(), Failure> {
        let record = TxnRecord {
            id: txn.clone(),
            state: TxnState::Preparing,
            ops: ops.to_vec(),
            created_at: Utc::now(),
        };
        let doc = Document::new(txn.as_str(), crate::document::encode(&record).map_err(StoreError::from)?);
        if !self.store.put(TXNS, &doc, Expect::Absent)? {
            return Err(Failure::Conflict);
        }
        debug!("txn {txn} preparing {} ops", ops.len());

        for (i, op) in ops.iter().enumerate() {
            if let Err(failure) = self.stamp(txn, op, i) {
                if matches!(failure, Failure::Precondition(_)) {
                    self.abort(txn)?;
                }
                return Err(failure);
            }
        }

        match self.set_state(txn, &[TxnState::Preparing], TxnState::Prepared)? {
            Some(TxnState::Prepared) => {}
            Some(TxnState::Aborted) | None => {
                // Another runner gave up waiting for us.
                self.abort(txn)?;
                return Err(Failure::Conflict);
            }
            Some(other) => {
                warn!("txn {txn} unexpectedly {other} while preparing");
            }
        }
        self.apply(txn, ops)?;
        Ok(())
    }

    /// Reserve the target of `op` for `txn` after checking its assertions.
    fn stamp(&self, txn: &TxnId, op: &Op, index: usize) -> Result<(), Failure> {
        let started = Instant::now();
        loop {
            let current = self.store.get(&op.collection, &op.id)?;
            if let Some(other) = current.as_ref().and_then(|d| d.pending.as_ref()) {
                if other == txn {
                    return Ok(());
                }
                let other = other.clone();
                self.resolve(&other, &op.collection, &op.id, started)?;
                continue;
            }

            let visible = current.as_ref().filter(|d| d.present);
            if let Some(failed) = op.failed_assert(visible) {
                return Err(Failure::Precondition(format!(
                    "op {index} on {} \"{}\": {failed}",
                    op.collection, op.id
                )));
            }

            let stamped = match current {
                Some(mut d) => {
                    let expect = Expect::Revno(d.revno);
                    d.revno += 1;
                    d.pending = Some(txn.clone());
                    self.store.put(&op.collection, &d, expect)?
                }
                None => {
                    let stub = Document {
                        id: op.id.clone(),
                        revno: 1,
                        present: false,
                        pending: Some(txn.clone()),
                        fields: Fields::new(),
                    };
                    self.store.put(&op.collection, &stub, Expect::Absent)?
                }
            };
            if stamped {
                return Ok(());
            }
        }
    }

    /// Move a foreign transaction out of the way of `collection`/`id`.
    fn resolve(
        &self,
        other: &TxnId,
        collection: &str,
        id: &str,
        started: Instant,
    ) -> Result<(), StoreError> {
        let Some(record) = self.load_record(other)? else {
            // The owner finished or was aborted and cleaned up already.
            return self.unstamp(collection, id, other);
        };
        match record.state {
            TxnState::Prepared | TxnState::Applied => {
                debug!("helping txn {other} to complete");
                self.apply(other, &record.ops)
            }
            TxnState::Aborted => self.abort(other),
            TxnState::Preparing if started.elapsed() >= self.config.conflict_wait() => {
                info!(
                    "aborting txn {other}: still preparing after {:?}",
                    started.elapsed()
                );
                self.abort(other)
            }
            TxnState::Preparing => {
                std::thread::sleep(self.config.backoff());
                Ok(())
            }
        }
    }

    /// Abort `txn` if it has not committed, then strip its stamps.
    /// A committed transaction is driven to completion instead.
    fn abort(&self, txn: &TxnId) -> Result<(), StoreError> {
        match self.set_state(txn, &[TxnState::Preparing], TxnState::Aborted)? {
            None => Ok(()),
            Some(TxnState::Prepared | TxnState::Applied) => {
                let Some(record) = self.load_record(txn)? else {
                    return Ok(());
                };
                self.apply(txn, &record.ops)
            }
            Some(TxnState::Aborted | TxnState::Preparing) => {
                let Some(record) = self.load_record(txn)? else {
                    return Ok(());
                };
                for op in &record.ops {
                    self.unstamp(&op.collection, &op.id, txn)?;
                }
                self.delete_record(txn)?;
                debug!("txn {txn} aborted and cleaned up");
                Ok(())
            }
        }
    }

    /// Remove `txn`'s stamp from one document, deleting insert placeholders.
    fn unstamp(&self, collection: &str, id: &str, txn: &TxnId) -> Result<(), StoreError> {
        loop {
            let Some(mut doc) = self.store.get(collection, id)? else {
                return Ok(());
            };
            if doc.pending.as_ref() != Some(txn) {
                return Ok(());
            }
            let done = if doc.present {
                let expect = Expect::Revno(doc.revno);
                doc.revno += 1;
                doc.pending = None;
                self.store.put(collection, &doc, expect)?
            } else {
                self.store.delete(collection, id, doc.revno)?
            };
            if done {
                return Ok(());
            }
        }
    }

    /// Apply a committed transaction. Idempotent and safe to run from
    /// several processes at once.
    fn apply(&self, txn: &TxnId, ops: &[Op]) -> Result<(), StoreError> {
        for op in ops {
            self.apply_op(txn, op)?;
        }
        if let Some(TxnState::Applied) =
            self.set_state(txn, &[TxnState::Prepared], TxnState::Applied)?
        {
            self.delete_record(txn)?;
            debug!("txn {txn} applied");
        }
        Ok(())
    }

    fn apply_op(&self, txn: &TxnId, op: &Op) -> Result<(), StoreError> {
        loop {
            let Some(doc) = self.store.get(&op.collection, &op.id)? else {
                return Ok(());
            };
            if doc.pending.as_ref() != Some(txn) {
                return Ok(());
            }
            let next_revno = doc.revno + 1;
            let remove = match &op.change {
                Some(Change::Remove) => true,
                None => !doc.present,
                Some(_) => false,
            };
            // Logged before the write becomes visible so that entries for
            // one document keep commit order.
            let logged_revno = if remove { None } else { Some(next_revno) };
            if op.change.is_some() {
                self.store.append_log(&op.collection, &op.id, logged_revno)?;
            }
            let done = if remove {
                self.store.delete(&op.collection, &op.id, doc.revno)?
            } else {
                let mut next = doc.clone();
                next.revno = next_revno;
                next.pending = None;
                match &op.change {
                    Some(Change::Insert(fields)) => {
                        next.present = true;
                        next.fields = fields.clone();
                    }
                    Some(Change::Update(field_ops)) => {
                        for field_op in field_ops {
                            field_op.apply(&mut next.fields);
                        }
                    }
                    Some(Change::Remove) | None => {}
                }
                self.store
                    .put(&op.collection, &next, Expect::Revno(doc.revno))?
            };
            if done {
                return Ok(());
            }
        }
    }

    fn load_record(&self, txn: &TxnId) -> Result<Option<TxnRecord>, StoreError> {
        Ok(self.load_record_doc(txn)?.map(|(_, record)| record))
    }

    fn load_record_doc(&self, txn: &TxnId) -> Result<Option<(Document, TxnRecord)>, StoreError> {
        match self.store.get(TXNS, txn)? {
            None => Ok(None),
            Some(doc) => {
                let record: TxnRecord = doc.decode()?;
                Ok(Some((doc, record)))
            }
        }
    }

    /// Move the record from one of `from` to `to`. Returns the state the
    /// record is in afterwards, or `None` if it no longer exists.
    fn set_state(
        &self,
        txn: &TxnId,
        from: &[TxnState],
        to: TxnState,
    ) -> Result<Option<TxnState>, StoreError> {
        loop {
            let Some((mut doc, mut record)) = self.load_record_doc(txn)? else {
                return Ok(None);
            };
            if !from.contains(&record.state) {
                return Ok(Some(record.state));
            }
            record.state = to;
            let expect = Expect::Revno(doc.revno);
            doc.revno += 1;
            doc.fields = crate::document::encode(&record)?;
            if self.store.put(TXNS, &doc, expect)? {
                return Ok(Some(to));
            }
        }
    }

    fn delete_record(&self, txn: &TxnId) -> Result<(), StoreError> {
        if let Some(doc) = self.store.get(TXNS, txn)? {
            self.store.delete(TXNS, txn, doc.revno)?;
        }
        Ok(())
    }

    /// Read a document, resolving any pending transaction first.
    ///
    /// A document held by a transaction that is still preparing is returned
    /// as it was before that transaction (`None` for a pending insert).
    pub fn read(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let mut doc = self.store.get(collection, id)?;
        // Bounded: each pass either returns or moves a transaction forward.
        for _ in 0..16 {
            let Some(current) = doc else {
                return Ok(None);
            };
            let Some(txn) = current.pending.clone() else {
                return Ok(current.present.then_some(current));
            };
            match self.load_record(&txn)? {
                Some(record) if record.state == TxnState::Preparing => {
                    let mut before = current;
                    before.pending = None;
                    return Ok(before.present.then_some(before));
                }
                Some(record) if record.state != TxnState::Aborted => {
                    self.apply(&txn, &record.ops)?;
                }
                Some(_) => self.abort(&txn)?,
                None => self.unstamp(collection, id, &txn)?,
            }
            doc = self.store.get(collection, id)?;
        }
        Err(StoreError::Unavailable(format!(
            "document {collection} \"{id}\" kept changing while being read"
        )))
    }

    /// All live documents of a collection, with pending work resolved.
    pub fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.resolve_all(self.store.list(collection)?, collection)
    }

    /// Live documents whose `path` equals `value`.
    pub fn find(
        &self,
        collection: &str,
        path: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError> {
        let docs = self.resolve_all(self.store.find(collection, path, value)?, collection)?;
        Ok(docs
            .into_iter()
            .filter(|d| crate::document::index_values(&d.fields, path).contains(value))
            .collect())
    }

    fn resolve_all(
        &self,
        docs: Vec<Document>,
        collection: &str,
    ) -> Result<Vec<Document>, StoreError> {
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            if doc.pending.is_none() {
                if doc.present {
                    out.push(doc);
                }
            } else if let Some(resolved) = self.read(collection, &doc.id)? {
                out.push(resolved);
            }
        }
        Ok(out)
    }

    /// Finish or roll back transactions left behind by crashed runners.
    ///
    /// Committed records are applied; records still preparing after
    /// `conflict_wait` are aborted. Returns how many records were handled.
    pub fn resume_all(&self) -> Result<usize, StoreError> {
        let cutoff = chrono::Duration::from_std(self.config.conflict_wait())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let mut handled = 0;
        for doc in self.store.list(TXNS)? {
            let record: TxnRecord = match doc.decode() {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping unreadable txn record '{}': {e}", doc.id);
                    continue;
                }
            };
            match record.state {
                TxnState::Prepared | TxnState::Applied => {
                    info!("resuming committed txn {}", record.id);
                    self.apply(&record.id, &record.ops)?;
                }
                TxnState::Aborted => self.abort(&record.id)?,
                TxnState::Preparing if Utc::now() - record.created_at >= cutoff => {
                    info!("aborting stale txn {}", record.id);
                    self.abort(&record.id)?;
                }
                TxnState::Preparing => continue,
            }
            handled += 1;
        }
        Ok(handled)
    }
}

fn validate_ops(ops: &[Op]) -> Result<(), TxnError> {
    if ops.is_empty() {
        return Err(TxnError::Invalid("no operations".to_owned()));
    }
    let mut seen = BTreeSet::new();
    for op in ops {
        crate::validate_collection(&op.collection)?;
        if op.collection == TXNS {
            return Err(TxnError::Invalid(format!(
                "cannot target the {TXNS} collection"
            )));
        }
        if !seen.insert((op.collection.as_str(), op.id.as_str())) {
            return Err(TxnError::Invalid(format!(
                "duplicate target {} \"{}\"",
                op.collection, op.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::json;

    fn runner() -> Runner {
        Runner::new(Arc::new(MemoryStore::new()), TxnSection::default())
    }

    fn fields(v: Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn insert_then_update() {
        let r = runner();
        r.run(vec![Op::new("units", "a/0").insert(fields(json!({"life": "alive", "n": 1})))])
            .unwrap();
        r.run(vec![Op::new("units", "a/0")
            .assert(Assert::eq("life", "alive"))
            .update(vec![FieldOp::set("life", "dying"), FieldOp::Inc("n".into(), 2)])])
            .unwrap();
        let doc = r.read("units", "a/0").unwrap().unwrap();
        assert_eq!(doc.str_field("life"), "dying");
        assert_eq!(doc.i64_field("n"), 3);
        assert!(doc.pending.is_none());
        assert!(r.store().list(TXNS).unwrap().is_empty(), "records are deleted");
    }

    #[test]
    fn failing_assert_mutates_nothing() {
        let r = runner();
        r.run(vec![
            Op::new("a", "1").insert(fields(json!({"v": 1}))),
            Op::new("b", "1").insert(fields(json!({"v": 1}))),
        ])
        .unwrap();
        let err = r
            .run(vec![
                Op::new("a", "1").update(vec![FieldOp::set("v", 2)]),
                Op::new("b", "1")
                    .assert(Assert::eq("v", 99))
                    .update(vec![FieldOp::set("v", 2)]),
                Op::new("c", "new").insert(fields(json!({}))),
            ])
            .unwrap_err();
        assert!(matches!(err, TxnError::PreconditionFailed(_)));
        assert_eq!(r.read("a", "1").unwrap().unwrap().i64_field("v"), 1);
        assert_eq!(r.read("b", "1").unwrap().unwrap().i64_field("v"), 1);
        assert!(r.read("c", "new").unwrap().is_none());
        assert!(r.store().get("c", "new").unwrap().is_none(), "stub removed");
        assert!(r.store().get("a", "1").unwrap().unwrap().pending.is_none());
    }

    #[test]
    fn insert_of_existing_is_precondition_failure() {
        let r = runner();
        r.run(vec![Op::new("m", "0").insert(Fields::new())]).unwrap();
        let err = r
            .run(vec![Op::new("m", "0").insert(Fields::new())])
            .unwrap_err();
        assert!(err.to_string().contains("document is missing"));
    }

    #[test]
    fn remove_and_log() {
        let r = runner();
        r.run(vec![Op::new("m", "0").insert(Fields::new())]).unwrap();
        r.run(vec![Op::new("m", "0").remove()]).unwrap();
        assert!(r.read("m", "0").unwrap().is_none());
        let log = r.store().read_log(0, 10).unwrap();
        let revnos: Vec<_> = log.entries.iter().map(|e| e.revno).collect();
        assert_eq!(revnos.len(), 2);
        assert!(revnos[0].is_some());
        assert_eq!(revnos[1], None);
    }

    #[test]
    fn assert_only_ops_do_not_log() {
        let r = runner();
        r.run(vec![Op::new("m", "0").insert(Fields::new())]).unwrap();
        let head = r.store().log_head().unwrap();
        r.run(vec![
            Op::new("m", "0").assert(Assert::Exists),
            Op::new("m", "1").assert(Assert::Missing),
        ])
        .unwrap();
        assert_eq!(r.store().log_head().unwrap(), head);
        assert!(r.store().get("m", "1").unwrap().is_none());
    }

    #[test]
    fn set_ops() {
        let r = runner();
        r.run(vec![Op::new("m", "0").insert(fields(json!({"p": []})))])
            .unwrap();
        r.run(vec![Op::new("m", "0").update(vec![
            FieldOp::AddToSet("p".into(), json!("a/0")),
            FieldOp::AddToSet("p".into(), json!("a/0")),
            FieldOp::AddToSet("p".into(), json!("b/0")),
        ])])
        .unwrap();
        r.run(vec![Op::new("m", "0").update(vec![FieldOp::Pull("p".into(), json!("a/0"))])])
            .unwrap();
        let doc = r.read("m", "0").unwrap().unwrap();
        assert_eq!(doc.str_list("p"), vec!["b/0".to_owned()]);
    }

    #[test]
    fn invalid_transactions() {
        let r = runner();
        assert!(matches!(r.run(vec![]), Err(TxnError::Invalid(_))));
        let err = r
            .run(vec![Op::new("m", "0"), Op::new("m", "0")])
            .unwrap_err();
        assert!(matches!(err, TxnError::Invalid(_)));
        let err = r.run(vec![Op::new(TXNS, "x")]).unwrap_err();
        assert!(matches!(err, TxnError::Invalid(_)));
    }

    #[test]
    fn preparing_txn_is_invisible_to_readers() {
        let r = runner();
        r.run(vec![Op::new("m", "0").insert(fields(json!({"v": 1})))])
            .unwrap();
        // Hand-craft a stalled transaction holding the document.
        let txn = TxnId::new("stalled");
        let record = TxnRecord {
            id: txn.clone(),
            state: TxnState::Preparing,
            ops: vec![Op::new("m", "0").update(vec![FieldOp::set("v", 2)])],
            created_at: Utc::now(),
        };
        let rec_doc = Document::new("stalled", crate::document::encode(&record).unwrap());
        r.store().put(TXNS, &rec_doc, Expect::Absent).unwrap();
        let mut doc = r.store().get("m", "0").unwrap().unwrap();
        let expect = Expect::Revno(doc.revno);
        doc.revno += 1;
        doc.pending = Some(txn.clone());
        r.store().put("m", &doc, expect).unwrap();

        let seen = r.read("m", "0").unwrap().unwrap();
        assert_eq!(seen.i64_field("v"), 1);

        // A writer waits, then aborts the stalled transaction and proceeds.
        let fast = Runner::new(
            r.store().clone(),
            TxnSection {
                conflict_wait_ms: 20,
                backoff_ms: 1,
                ..TxnSection::default()
            },
        );
        fast.run(vec![Op::new("m", "0").update(vec![FieldOp::set("v", 3)])])
            .unwrap();
        assert_eq!(r.read("m", "0").unwrap().unwrap().i64_field("v"), 3);
        assert!(r.store().get(TXNS, "stalled").unwrap().is_none());
    }
}
