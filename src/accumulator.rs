//! Shared candidate-accounting for all spatial queries.
//!
//! Every engine pulls key nodes out of the tree and pushes them through one
//! [`Accumulator`], which owns the per-query dedup set, the per-document
//! predicate cache, and the scan counters. What "matches" means spatially is
//! supplied by the engine through the [`SpatialMatch`] capability trait.

use crate::db::{DocStore, InterruptFlag};
use crate::spec::{IndexKey, IndexSpec};
use crate::tree::{KeyNode, RecordId};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

/// Borrowed query environment: the index spec, the document store, and the
/// process interrupt flag. Engines hold one of these instead of sharing
/// handles with each other.
#[derive(Clone, Copy)]
pub struct QueryCtx<'a> {
    pub spec: &'a IndexSpec,
    pub store: &'a DocStore,
    pub interrupt: &'a InterruptFlag,
}

/// One accepted result: the index key it came from, the record locator, an
/// owned copy of the document, and the exact distance when the engine
/// computed one.
#[derive(Debug, Clone)]
pub struct GeoPoint {
    pub key: IndexKey,
    pub loc: RecordId,
    pub doc: Value,
    pub exact_distance: Option<f64>,
    pub exact_within: bool,
}

impl GeoPoint {
    pub fn new(node: &KeyNode, doc: &Value) -> Self {
        GeoPoint {
            key: node.key.clone(),
            loc: node.loc,
            doc: doc.clone(),
            exact_distance: None,
            exact_within: false,
        }
    }

    pub fn with_distance(node: &KeyNode, doc: &Value, exact_distance: f64) -> Self {
        GeoPoint {
            key: node.key.clone(),
            loc: node.loc,
            doc: doc.clone(),
            exact_distance: Some(exact_distance),
            exact_within: true,
        }
    }
}

/// Spatial acceptance supplied by the concrete engine.
///
/// `check_distance` is the cheap approximate filter run on the cell
/// representative; returning `None` rejects the candidate. `add_specific`
/// receives candidates that also passed dedup and the document predicate;
/// `new_doc` is false when a second key of an already-seen document arrives,
/// which engines use to avoid double-adding multi-location documents.
pub trait SpatialMatch {
    fn check_distance(&mut self, node: &KeyNode, ctx: &QueryCtx) -> Option<f64>;
    fn add_specific(&mut self, node: &KeyNode, d: f64, new_doc: bool, doc: &Value, ctx: &QueryCtx);
}

/// A compiled document predicate: a conjunction of dotted-path equality
/// terms taken from the residual query document.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    terms: Vec<(String, Value)>,
}

impl Predicate {
    /// Compile the non-geo, non-operator fields of a query document.
    /// Returns `None` when nothing remains to match.
    pub fn compile(filter: &Value, geo_field: &str) -> Option<Predicate> {
        let obj = filter.as_object()?;
        let terms: Vec<(String, Value)> = obj
            .iter()
            .filter(|(k, _)| k.as_str() != geo_field && !k.starts_with('$'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if terms.is_empty() {
            None
        } else {
            Some(Predicate { terms })
        }
    }

    /// True when every term is satisfied by some value at its path.
    pub fn matches(&self, doc: &Value) -> bool {
        self.terms.iter().all(|(path, expected)| {
            resolve_path(doc, path, &mut |v| v == expected)
        })
    }
}

/// Walk `path` through objects and arrays; true as soon as `pred` accepts a
/// resolved value (arrays match through their elements).
fn resolve_path(doc: &Value, path: &str, pred: &mut dyn FnMut(&Value) -> bool) -> bool {
    fn step(v: &Value, segs: &[&str], pred: &mut dyn FnMut(&Value) -> bool) -> bool {
        if segs.is_empty() {
            if let Value::Array(a) = v {
                if a.iter().any(|e| pred(e)) {
                    return true;
                }
            }
            return pred(v);
        }
        match v {
            Value::Object(m) => m
                .get(segs[0])
                .map(|next| step(next, &segs[1..], pred))
                .unwrap_or(false),
            Value::Array(a) => a.iter().any(|e| step(e, segs, pred)),
            _ => false,
        }
    }
    let segs: Vec<&str> = path.split('.').collect();
    step(doc, &segs, pred)
}

/// Dedup, predicate, and counter state shared by every spatial engine.
#[derive(Debug, Default)]
pub struct Accumulator {
    /// Exact key instances already handled: (cell word, locator, key seq).
    seen: FxHashSet<(u64, RecordId, u32)>,
    /// Predicate outcome per document, so a multi-key document is matched
    /// (and loaded) once.
    matched: FxHashMap<RecordId, bool>,
    predicate: Option<Predicate>,
    pub looked_at: u64,
    pub objects_loaded: u64,
    pub found: u64,
}

impl Accumulator {
    pub fn new(predicate: Option<Predicate>) -> Self {
        Accumulator {
            predicate,
            ..Accumulator::default()
        }
    }

    /// Feed one key node through dedup, the engine's distance filter, and
    /// the document predicate, handing survivors to `add_specific`.
    pub fn add<M: SpatialMatch>(&mut self, node: &KeyNode, matcher: &mut M, ctx: &QueryCtx) {
        if !self.seen.insert((node.key.hash.word(), node.loc, node.seq)) {
            return;
        }
        self.looked_at += 1;

        let Some(d) = matcher.check_distance(node, ctx) else {
            return;
        };

        let Some(doc) = ctx.store.get(node.loc) else {
            // Dangling index entry; nothing to return for it.
            return;
        };

        let new_doc = !self.matched.contains_key(&node.loc);
        if new_doc {
            self.objects_loaded += 1;
            let good = self
                .predicate
                .as_ref()
                .map(|p| p.matches(doc))
                .unwrap_or(true);
            self.matched.insert(node.loc, good);
            if !good {
                return;
            }
        } else if !self.matched[&node.loc] {
            return;
        }

        matcher.add_specific(node, d, new_doc, doc, ctx);
        self.found += 1;
    }
}
