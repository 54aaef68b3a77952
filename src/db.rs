//! Collections: a record store wired to one geo index.
//!
//! The surrounding database owns command dispatch and locking; a
//! [`Collection`] here is just the part a spatial query touches — documents
//! addressable by record id, the index spec, and the ordered tree. Queries
//! take the collection by shared reference and never mutate it.

use crate::error::{GeodexError, Result};
use crate::spec::IndexSpec;
use crate::tree::{GeoTree, RecordId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Documents addressable by [`RecordId`].
#[derive(Debug, Default)]
pub struct DocStore {
    docs: BTreeMap<RecordId, Value>,
    next: RecordId,
}

impl DocStore {
    pub fn new() -> Self {
        DocStore::default()
    }

    pub fn get(&self, loc: RecordId) -> Option<&Value> {
        self.docs.get(&loc)
    }

    pub fn insert(&mut self, doc: Value) -> RecordId {
        let loc = self.next;
        self.next += 1;
        self.docs.insert(loc, doc);
        loc
    }

    pub fn remove(&mut self, loc: RecordId) -> Option<Value> {
        self.docs.remove(&loc)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Cooperative cancellation flag, shared process-wide.
///
/// Long scans call [`InterruptFlag::check`] at heartbeat points and abort
/// with [`GeodexError::Interrupted`] once another thread has raised it.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        InterruptFlag::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn check(&self) -> Result<()> {
        if self.0.load(Ordering::Relaxed) {
            return Err(GeodexError::Interrupted);
        }
        Ok(())
    }
}

/// One geo-indexed collection of documents.
pub struct Collection {
    spec: IndexSpec,
    store: DocStore,
    tree: GeoTree,
    interrupt: InterruptFlag,
}

impl Collection {
    pub fn new(spec: IndexSpec) -> Self {
        Collection {
            spec,
            store: DocStore::new(),
            tree: GeoTree::new(),
            interrupt: InterruptFlag::new(),
        }
    }

    /// Build a collection from a key pattern and index options, e.g.
    /// `{"loc": "2d", "category": 1}` with `{"bits": 26}`.
    pub fn with_pattern(key_pattern: &Value, options: &Value) -> Result<Self> {
        Ok(Collection::new(IndexSpec::parse(key_pattern, options)?))
    }

    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn store(&self) -> &DocStore {
        &self.store
    }

    pub fn tree(&self) -> &GeoTree {
        &self.tree
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Store a document and index all of its locations. Key extraction runs
    /// first, so a document that fails validation leaves nothing behind.
    pub fn insert(&mut self, doc: Value) -> Result<RecordId> {
        self.spec.get_keys(&doc)?;
        let loc = self.store.insert(doc);
        let doc = self.store.get(loc).cloned().expect("just inserted");
        self.tree.insert_document(&self.spec, loc, &doc)?;
        Ok(loc)
    }

    /// Drop a document and all of its index keys.
    pub fn remove(&mut self, loc: RecordId) -> Result<Option<Value>> {
        let Some(doc) = self.store.remove(loc) else {
            return Ok(None);
        };
        self.tree.remove_document(&self.spec, loc, &doc)?;
        Ok(Some(doc))
    }

    pub fn get(&self, loc: RecordId) -> Option<&Value> {
        self.store.get(loc)
    }
}
