//! Incremental region browsers.
//!
//! A browser walks outward from a seed cell, first expanding the seed's
//! prefix until one cell covers the region's characteristic size, then
//! visiting the ring of neighbor cells around it, emitting matching
//! documents lazily as a cursor. The shape-specific parts — where to seed,
//! when a cell is big enough, whether a cell overlaps the region, and the
//! approximate/exact distance filter — come in through the [`Region`]
//! trait; the state machine here is shared by circle, box, and polygon
//! queries.

mod circle;
mod polygon;
mod rect;

pub use circle::CircleRegion;
pub use polygon::PolygonRegion;
pub use rect::RectRegion;

use crate::accumulator::{Accumulator, GeoPoint, Predicate, QueryCtx, SpatialMatch};
use crate::error::Result;
use crate::geohash::GeoHash;
use crate::geometry::GeoBox;
use crate::tree::{GeoTree, KeyNode, TreeLocation};
use serde_json::Value;
use std::collections::VecDeque;

/// Most points checked per fill round before control returns to the
/// caller.
const MAX_POINTS_HEURISTIC: u64 = 300;

/// Shape-specific capabilities of one region query.
pub trait Region {
    /// The cell the first expansion starts from.
    fn expand_start_hash(&self) -> GeoHash;

    /// Whether a cell of this edge length covers the region's
    /// characteristic size, ending the expansion phase.
    fn fits_in_box(&self, width: f64) -> bool;

    /// Whether a neighbor cell's box overlaps the region at all.
    fn intersects_box(&self, cur: &GeoBox) -> bool;

    /// Approximate-then-exact acceptance for one candidate key. `None`
    /// rejects; `Some(d)` accepts with an advisory distance.
    fn check_distance(&mut self, node: &KeyNode, ctx: &QueryCtx) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    DoingExpand,
    DoneNeighbor,
    Done,
}

/// Routes accepted candidates into the browser's emission slots without
/// borrowing the whole browser inside the accumulator.
struct Emit<'e, R: Region> {
    region: &'e mut R,
    cur: &'e mut Option<GeoPoint>,
    stack: &'e mut VecDeque<GeoPoint>,
}

impl<R: Region> SpatialMatch for Emit<'_, R> {
    fn check_distance(&mut self, node: &KeyNode, ctx: &QueryCtx) -> Option<f64> {
        self.region.check_distance(node, ctx)
    }

    fn add_specific(
        &mut self,
        node: &KeyNode,
        _d: f64,
        new_doc: bool,
        doc: &Value,
        _ctx: &QueryCtx,
    ) {
        if !new_doc {
            return;
        }
        let point = GeoPoint::new(node, doc);
        if self.cur.is_none() {
            *self.cur = Some(point);
        } else {
            self.stack.push_back(point);
        }
    }
}

/// Lazy cursor over all documents matching a region.
pub struct GeoBrowse<'a, R: Region> {
    ctx: QueryCtx<'a>,
    tree: &'a GeoTree,
    region: R,
    acc: Accumulator,
    state: State,
    prefix: GeoHash,
    /// Set once the first expansion finishes; pins the cell the neighbor
    /// ring walks around.
    center: Option<(GeoHash, GeoBox)>,
    neighbor: i32,
    min: Option<TreeLocation<'a>>,
    max: Option<TreeLocation<'a>>,
    cur: Option<GeoPoint>,
    stack: VecDeque<GeoPoint>,
    first_call: bool,
    nscanned: u64,
}

impl<'a, R: Region> GeoBrowse<'a, R> {
    pub fn new(
        ctx: QueryCtx<'a>,
        tree: &'a GeoTree,
        region: R,
        predicate: Option<Predicate>,
    ) -> Self {
        let prefix = region.expand_start_hash();
        GeoBrowse {
            ctx,
            tree,
            region,
            acc: Accumulator::new(predicate),
            state: State::Start,
            prefix,
            center: None,
            neighbor: -1,
            min: None,
            max: None,
            cur: None,
            stack: VecDeque::new(),
            first_call: true,
            nscanned: 0,
        }
    }

    /// Whether the walk has more cells to visit.
    pub fn more_to_do(&self) -> bool {
        self.state != State::Done
    }

    /// Whether a current result is available, filling as needed. Idempotent
    /// once it has produced the first result.
    pub fn ok(&mut self) -> Result<bool> {
        let first = self.first_call;
        if self.first_call {
            self.fill_stack(MAX_POINTS_HEURISTIC)?;
            self.first_call = false;
        }
        if self.cur.is_some() || !self.stack.is_empty() {
            if first {
                self.nscanned += 1;
            }
            return Ok(true);
        }
        while self.more_to_do() {
            self.fill_stack(MAX_POINTS_HEURISTIC)?;
            if self.cur.is_some() {
                if first {
                    self.nscanned += 1;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Step to the next result, refilling when the queue runs dry.
    pub fn advance(&mut self) -> Result<bool> {
        self.cur = None;

        if let Some(p) = self.stack.pop_front() {
            self.cur = Some(p);
            self.nscanned += 1;
            return Ok(true);
        }

        if !self.more_to_do() {
            return Ok(false);
        }
        while self.cur.is_none() && self.more_to_do() {
            self.fill_stack(MAX_POINTS_HEURISTIC)?;
        }
        if self.cur.is_some() {
            self.nscanned += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn current(&self) -> Option<&GeoPoint> {
        self.cur.as_ref()
    }

    /// Results stepped over so far.
    pub fn nscanned(&self) -> u64 {
        self.nscanned
    }

    pub fn keys_examined(&self) -> u64 {
        self.acc.looked_at
    }

    pub fn objects_loaded(&self) -> u64 {
        self.acc.objects_loaded
    }

    /// Drain the cursor into a vector.
    pub fn collect_all(&mut self) -> Result<Vec<GeoPoint>> {
        let mut out = Vec::new();
        if self.ok()? {
            while let Some(p) = self.current() {
                out.push(p.clone());
                if !self.advance()? {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// One round of the expand/check-neighbors walk, checking at most
    /// `max_to_check` accepted points before handing control back.
    fn fill_stack(&mut self, max_to_check: u64) -> Result<()> {
        self.ctx.interrupt.check()?;

        let max_found = self.acc.found + max_to_check;
        let is_neighbor = self.center.is_some();

        if self.state == State::Start {
            if !is_neighbor {
                self.prefix = self.region.expand_start_hash();
            }
            match TreeLocation::initial(self.tree, &self.prefix) {
                Some((min, max)) => {
                    self.min = Some(min);
                    self.max = Some(max);
                    self.state = State::DoingExpand;
                }
                None => {
                    self.state = if is_neighbor {
                        State::DoneNeighbor
                    } else {
                        State::Done
                    };
                }
            }
        }

        if self.state == State::DoingExpand {
            loop {
                self.sweep(-1, max_found);
                self.sweep(1, max_found);

                if self.acc.found >= max_found {
                    // Control returns with the expansion mid-flight; the
                    // next fill continues from the cursor positions.
                    return Ok(());
                }
                if !self.prefix.constrains() {
                    self.state = State::Done;
                    return Ok(());
                }
                if !self
                    .region
                    .fits_in_box(self.ctx.spec.size_edge(&self.prefix))
                {
                    self.prefix = self.prefix.up();
                    continue;
                }
                self.state = State::DoneNeighbor;
                self.neighbor += 1;
                break;
            }
        }

        if self.state == State::DoneNeighbor {
            while self.neighbor < 9 {
                if self.center.is_none() {
                    let c = self.prefix;
                    self.center = Some((c, self.ctx.spec.cell_box(&c)));
                }
                let (center, center_box) = *self.center.as_ref().expect("center just pinned");

                let i = (self.neighbor / 3) - 1;
                let j = (self.neighbor % 3) - 1;

                // Skip the center cell itself, and any step that would
                // wrap across the coordinate-system boundary.
                if (i == 0 && j == 0)
                    || (i < 0 && center_box.min.x() <= self.ctx.spec.min())
                    || (j < 0 && center_box.min.y() <= self.ctx.spec.min())
                    || (i > 0 && center_box.max.x() >= self.ctx.spec.max())
                    || (j > 0 && center_box.max.y() >= self.ctx.spec.max())
                {
                    self.neighbor += 1;
                    continue;
                }

                let new_box = center.move_cell(i, j);
                self.prefix = new_box;

                if self
                    .region
                    .intersects_box(&self.ctx.spec.cell_box(&new_box))
                {
                    // Restart the expansion from the neighbor cell. The
                    // recursive fill either checks its quota of points (and
                    // leaves the expansion resumable) or walks the
                    // remaining neighbors to completion.
                    self.state = State::Start;
                    let remaining = max_found.saturating_sub(self.acc.found);
                    self.fill_stack(remaining)?;
                    return Ok(());
                }
                self.neighbor += 1;
            }
            self.state = State::Done;
        }

        Ok(())
    }

    /// Sweep one cursor while it stays under the current prefix, stopping
    /// once the found quota is met.
    fn sweep(&mut self, direction: i32, max_found: u64) {
        while self.acc.found < max_found {
            let Some(loc) = (if direction < 0 {
                self.min.as_mut()
            } else {
                self.max.as_mut()
            }) else {
                return;
            };
            if !loc.has_prefix(&self.prefix) {
                return;
            }
            let node = loc.key_node();
            let advanced = loc.advance(direction);
            if let Some(node) = node {
                let mut emit = Emit {
                    region: &mut self.region,
                    cur: &mut self.cur,
                    stack: &mut self.stack,
                };
                self.acc.add(node, &mut emit, &self.ctx);
            }
            if !advanced {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Collection;
    use geo::Point;
    use serde_json::json;

    fn collection(points: &[(f64, f64)]) -> Collection {
        let mut coll = Collection::with_pattern(&json!({"loc": "2d"}), &json!({})).unwrap();
        for (i, (x, y)) in points.iter().enumerate() {
            coll.insert(json!({"loc": [x, y], "n": i})).unwrap();
        }
        coll
    }

    fn circle_results(coll: &Collection, center: (f64, f64), r: f64) -> Vec<i64> {
        let ctx = QueryCtx {
            spec: coll.spec(),
            store: coll.store(),
            interrupt: coll.interrupt_flag(),
        };
        let region = CircleRegion::plain(
            coll.spec(),
            Point::new(center.0, center.1),
            r,
        )
        .unwrap();
        let mut browse = GeoBrowse::new(ctx, coll.tree(), region, None);
        let mut out: Vec<i64> = browse
            .collect_all()
            .unwrap()
            .iter()
            .map(|p| p.doc["n"].as_i64().unwrap())
            .collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn circle_browse_finds_members_without_duplicates() {
        let coll = collection(&[(0.0, 0.0), (0.5, 0.5), (3.0, 0.0), (-0.5, -0.25)]);
        assert_eq!(circle_results(&coll, (0.0, 0.0), 1.0), vec![0, 1, 3]);
        assert_eq!(circle_results(&coll, (0.0, 0.0), 10.0), vec![0, 1, 2, 3]);
        assert_eq!(circle_results(&coll, (40.0, 40.0), 1.0), Vec::<i64>::new());
    }

    #[test]
    fn multi_location_document_emitted_once() {
        let mut coll = Collection::with_pattern(&json!({"loc": "2d"}), &json!({})).unwrap();
        coll.insert(json!({"loc": [[0.1, 0.1], [0.2, 0.2]], "n": 0}))
            .unwrap();
        assert_eq!(circle_results(&coll, (0.0, 0.0), 1.0), vec![0]);
    }

    #[test]
    fn cursor_is_idempotent_and_lazy() {
        let coll = collection(&[(0.0, 0.0), (0.1, 0.1)]);
        let ctx = QueryCtx {
            spec: coll.spec(),
            store: coll.store(),
            interrupt: coll.interrupt_flag(),
        };
        let region =
            CircleRegion::plain(coll.spec(), Point::new(0.0, 0.0), 1.0).unwrap();
        let mut browse = GeoBrowse::new(ctx, coll.tree(), region, None);

        assert!(browse.ok().unwrap());
        assert!(browse.ok().unwrap());
        let first = browse.current().unwrap().loc;
        assert!(browse.advance().unwrap());
        let second = browse.current().unwrap().loc;
        assert_ne!(first, second);
        assert!(!browse.advance().unwrap());
        assert!(browse.current().is_none());
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let coll = Collection::with_pattern(&json!({"loc": "2d"}), &json!({})).unwrap();
        assert_eq!(circle_results(&coll, (0.0, 0.0), 5.0), Vec::<i64>::new());
    }
}
