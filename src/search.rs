//! Expanding-hash nearest-neighbor search.
//!
//! The search runs in two phases. Phase one expands the prefix of the
//! query point's own hash outward, sweeping every key under the prefix with
//! a pair of tree cursors, until enough candidates are held or the cell has
//! outgrown the scan distance. Phase two derives the farthest distance any
//! winner could still have, raises the prefix until one cell covers it, and
//! scans the 3×3 block of neighbor cells around it, descending into child
//! cells when a box barely overlaps the wanted region but holds many keys.

use crate::accumulator::{Accumulator, GeoPoint, Predicate, QueryCtx, SpatialMatch};
use crate::error::Result;
use crate::geohash::GeoHash;
use crate::geometry::{
    compute_x_scan_distance, distance, distance_within, rad2deg, spheredist_deg, DistType, GeoBox,
};
use crate::tree::{GeoTree, KeyNode, TreeLocation};
use geo::Point;
use serde_json::Value;
use std::collections::BTreeMap;

/// Total-ordered wrapper so exact distances can key the result holder.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrdDist(f64);

impl Eq for OrdDist {}

impl PartialOrd for OrdDist {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdDist {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Best-k holder: keeps up to `max` points ordered by exact distance, ties
/// broken by insertion order, and tracks the farthest kept distance.
pub struct GeoHopper {
    max: usize,
    near: Point,
    max_distance: f64,
    dist_type: DistType,
    dist_error: f64,
    farthest: f64,
    points: BTreeMap<(OrdDist, u64), GeoPoint>,
    insert_seq: u64,
}

impl GeoHopper {
    pub fn new(
        spec_error: f64,
        spec_error_sphere: f64,
        max: usize,
        near: Point,
        max_distance: f64,
        dist_type: DistType,
    ) -> Self {
        GeoHopper {
            max,
            near,
            max_distance,
            dist_type,
            dist_error: match dist_type {
                DistType::Plain => spec_error,
                DistType::Sphere => spec_error_sphere,
            },
            farthest: 0.0,
            points: BTreeMap::new(),
            insert_seq: 0,
        }
    }

    /// Exact distance of the current farthest kept point, in the query's
    /// distance units.
    pub fn farthest(&self) -> f64 {
        self.farthest
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Consume the holder, yielding points in ascending exact distance.
    pub fn into_points(self) -> Vec<GeoPoint> {
        self.points.into_values().collect()
    }

    fn approx_distance(&self, h: &GeoHash, ctx: &QueryCtx) -> f64 {
        let cell = ctx.spec.unhash_point(h);
        match self.dist_type {
            DistType::Plain => distance(&self.near, &cell),
            DistType::Sphere => spheredist_deg(&self.near, &cell),
        }
    }

    /// Exact distance of a document: the minimum over *all* its locations
    /// that fall within the bound, so a multi-location document competes
    /// with its closest point. Inserts the document when any location
    /// qualifies and returns the minimum, or `None`.
    fn exact_distances(&mut self, node: &KeyNode, doc: &Value, ctx: &QueryCtx) -> Option<f64> {
        let locs = ctx.spec.get_locs(doc).ok()?;

        let mut min_distance: Option<f64> = None;
        for loc in &locs {
            let (exact, within) = match self.dist_type {
                DistType::Plain => (
                    distance(&self.near, loc),
                    distance_within(&self.near, loc, self.max_distance),
                ),
                DistType::Sphere => {
                    let d = spheredist_deg(&self.near, loc);
                    (d, d <= self.max_distance)
                }
            };
            if !within {
                continue;
            }
            if min_distance.map(|m| exact < m).unwrap_or(true) {
                min_distance = Some(exact);
            }
        }

        let min = min_distance?;
        self.points.insert(
            (OrdDist(min), self.insert_seq),
            GeoPoint::with_distance(node, doc, min),
        );
        self.insert_seq += 1;
        Some(min)
    }
}

impl SpatialMatch for GeoHopper {
    fn check_distance(&mut self, node: &KeyNode, ctx: &QueryCtx) -> Option<f64> {
        // The approximate check alone can discard most candidates before
        // anything touches the document.
        let d = self.approx_distance(&node.key.hash, ctx);
        debug_assert!(d >= 0.0);

        let good = d <= self.max_distance + 2.0 * self.dist_error
            && (self.points.len() < self.max || d <= self.farthest() + 2.0 * self.dist_error);
        good.then_some(d)
    }

    fn add_specific(&mut self, node: &KeyNode, _d: f64, new_doc: bool, doc: &Value, ctx: &QueryCtx) {
        if !new_doc {
            return;
        }
        if self.exact_distances(node, doc, ctx).is_some() {
            while self.points.len() > self.max {
                self.points.pop_last();
            }
            if let Some(((OrdDist(d), _), _)) = self.points.last_key_value() {
                self.farthest = *d;
            }
        }
    }
}

/// Driver for one nearest-to-point query.
pub struct GeoSearch<'a> {
    ctx: QueryCtx<'a>,
    tree: &'a GeoTree,
    start_pt: Point,
    start: GeoHash,
    prefix: GeoHash,
    num_wanted: usize,
    scan_distance: f64,
    dist_type: DistType,
    acc: Accumulator,
    hopper: GeoHopper,
    nscanned: u64,
    already_scanned: Option<GeoBox>,
}

impl<'a> GeoSearch<'a> {
    pub fn new(
        ctx: QueryCtx<'a>,
        tree: &'a GeoTree,
        start_pt: Point,
        num_wanted: usize,
        predicate: Option<Predicate>,
        max_distance: f64,
        dist_type: DistType,
    ) -> Result<Self> {
        let start = ctx.spec.hash_point(&start_pt)?;
        let scan_distance = match dist_type {
            DistType::Plain => max_distance + ctx.spec.error(),
            DistType::Sphere => {
                if max_distance == f64::MAX {
                    max_distance
                } else {
                    compute_x_scan_distance(
                        start_pt.y(),
                        rad2deg(max_distance) + ctx.spec.error(),
                    )
                }
            }
        };
        let hopper = GeoHopper::new(
            ctx.spec.error(),
            ctx.spec.error_sphere(),
            num_wanted,
            start_pt,
            max_distance,
            dist_type,
        );
        Ok(GeoSearch {
            ctx,
            tree,
            start_pt,
            start,
            prefix: start,
            num_wanted,
            scan_distance,
            dist_type,
            acc: Accumulator::new(predicate),
            hopper,
            nscanned: 0,
            already_scanned: None,
        })
    }

    /// Override the expansion seed (normally the hash of the query point).
    pub fn set_start(&mut self, start: GeoHash) {
        self.start = start;
        self.prefix = start;
    }

    /// Run the search to completion.
    pub fn exec(&mut self) -> Result<()> {
        let Some((mut min, mut max)) = TreeLocation::initial(self.tree, &self.start) else {
            return Ok(());
        };

        // Phase 1: expand the prefix of the start hash until enough points
        // are held or the cell outgrows the scan distance.
        loop {
            self.ctx.interrupt.check()?;

            let keep_expanding = !self.prefix.constrains()
                || (self.acc.found < self.num_wanted as u64
                    && self.ctx.spec.size_edge(&self.prefix) <= self.scan_distance);
            if !keep_expanding {
                break;
            }

            self.sweep(&mut min, -1);
            self.sweep(&mut max, 1);

            if !self.prefix.constrains() {
                // The sweep just covered the whole tree.
                return Ok(());
            }
            self.already_scanned = Some(self.ctx.spec.cell_box(&self.prefix));
            self.prefix = self.prefix.up();
        }

        // Phase 2: bound the radius any winner could still have.
        let mut farthest = self.hopper.farthest();
        if self.acc.found < self.num_wanted as u64 {
            farthest = self.scan_distance;
        } else {
            match self.dist_type {
                DistType::Plain => farthest += self.ctx.spec.error(),
                DistType::Sphere => {
                    farthest = self.scan_distance.min(
                        compute_x_scan_distance(self.start_pt.y(), rad2deg(farthest))
                            + 2.0 * self.ctx.spec.error(),
                    )
                }
            }
        }
        debug_assert!(farthest >= 0.0);

        let want = GeoBox::square(
            self.start_pt.x() - farthest,
            self.start_pt.y() - farthest,
            farthest * 2.0,
        );

        self.prefix = self.start;
        while self.prefix.constrains() && self.ctx.spec.size_edge(&self.prefix) < farthest {
            self.prefix = self.prefix.up();
        }

        if self.prefix.bits() <= 1 {
            // A cell this large covers everything worth keeping; finish the
            // two cursors instead of walking boxes.
            self.sweep_to_end(&mut min, -1)?;
            self.sweep_to_end(&mut max, 1)?;
            return Ok(());
        }

        tracing::debug!(
            found = self.acc.found,
            nscanned = self.nscanned,
            cell_edge = self.ctx.spec.size_edge(&self.prefix),
            farthest,
            "nearest search neighbor sweep"
        );

        for dx in -1..=1 {
            for dy in -1..=1 {
                let toscan = self.prefix.move_cell(dx, dy);
                self.do_box(&want, toscan, 0)?;
            }
        }
        Ok(())
    }

    /// Sweep one cursor while it stays under the current prefix.
    fn sweep(&mut self, loc: &mut TreeLocation<'a>, direction: i32) {
        while loc.has_prefix(&self.prefix) {
            if let Some(node) = loc.key_node() {
                self.acc.add(node, &mut self.hopper, &self.ctx);
            }
            if !loc.advance(direction) {
                break;
            }
            self.nscanned += 1;
        }
    }

    /// Drain one cursor to the end of the tree.
    fn sweep_to_end(&mut self, loc: &mut TreeLocation<'a>, direction: i32) -> Result<()> {
        loop {
            self.ctx.interrupt.check()?;
            match loc.key_node() {
                Some(node) => self.acc.add(node, &mut self.hopper, &self.ctx),
                None => break,
            }
            if !loc.advance(direction) {
                break;
            }
            self.nscanned += 1;
        }
        Ok(())
    }

    /// Scan one neighbor cell, descending into its four children when the
    /// overlap with the wanted box is small and the cell is key-dense.
    fn do_box(&mut self, want: &GeoBox, toscan: GeoHash, depth: u32) -> Result<()> {
        self.ctx.interrupt.check()?;

        let test_box = self.ctx.spec.cell_box(&toscan);
        if let Some(scanned) = &self.already_scanned {
            if scanned.area() > 0.0 && scanned.contains_box(&test_box, 0.0) {
                return Ok(());
            }
        }

        let overlap = test_box.intersects_ratio(want);
        if overlap <= 0.0 {
            return Ok(());
        }
        let go_deeper = overlap < 0.5 && depth < 2;

        let mut my_scanned = 0u64;
        let mut loc = TreeLocation::seek(self.tree, &toscan);
        while loc.has_prefix(&toscan) {
            if let Some(node) = loc.key_node() {
                self.acc.add(node, &mut self.hopper, &self.ctx);
            }
            self.nscanned += 1;
            if !loc.advance(1) {
                break;
            }
            my_scanned += 1;
            if my_scanned > 100 && go_deeper {
                for quadrant in 0..4 {
                    self.do_box(want, toscan.child(quadrant), depth + 1)?;
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Tree positions visited.
    pub fn btree_locs(&self) -> u64 {
        self.nscanned
    }

    /// Keys examined after dedup.
    pub fn keys_examined(&self) -> u64 {
        self.acc.looked_at
    }

    pub fn objects_loaded(&self) -> u64 {
        self.acc.objects_loaded
    }

    pub fn farthest(&self) -> f64 {
        self.hopper.farthest()
    }

    /// Materialize the result set, ascending by exact distance. The cursor
    /// layer owns this vector outright; nothing keeps borrowing the search.
    pub fn into_results(self) -> Vec<GeoPoint> {
        self.hopper.into_points()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Collection;
    use serde_json::json;

    fn collection(points: &[(f64, f64)]) -> Collection {
        let mut coll = Collection::with_pattern(&json!({"loc": "2d"}), &json!({})).unwrap();
        for (i, (x, y)) in points.iter().enumerate() {
            coll.insert(json!({"loc": [x, y], "n": i})).unwrap();
        }
        coll
    }

    fn run_near(
        coll: &Collection,
        pt: (f64, f64),
        k: usize,
        max_distance: f64,
        dist_type: DistType,
    ) -> Vec<GeoPoint> {
        let ctx = QueryCtx {
            spec: coll.spec(),
            store: coll.store(),
            interrupt: coll.interrupt_flag(),
        };
        let mut search = GeoSearch::new(
            ctx,
            coll.tree(),
            Point::new(pt.0, pt.1),
            k,
            None,
            max_distance,
            dist_type,
        )
        .unwrap();
        search.exec().unwrap();
        search.into_results()
    }

    #[test]
    fn nearest_three_in_order() {
        let coll = collection(&[(50.0, 50.0), (50.0, 52.0), (48.0, 44.0), (0.0, 0.0)]);
        let results = run_near(&coll, (50.0, 50.0), 3, f64::MAX, DistType::Plain);

        let ns: Vec<i64> = results.iter().map(|p| p.doc["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2]);

        // Sorted non-decreasing and all distances exact.
        let ds: Vec<f64> = results.iter().map(|p| p.exact_distance.unwrap()).collect();
        assert!(ds.windows(2).all(|w| w[0] <= w[1]));
        assert!((ds[0]).abs() < 1e-9);
        assert!((ds[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn max_distance_bounds_results() {
        let coll = collection(&[(0.0, 0.0), (0.0, 1.0), (0.0, 30.0)]);
        let results = run_near(&coll, (0.0, 0.0), 10, 5.0, DistType::Plain);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|p| p.exact_distance.unwrap() <= 5.0));
    }

    #[test]
    fn returns_min_of_k_and_candidates() {
        let coll = collection(&[(1.0, 1.0), (2.0, 2.0)]);
        let results = run_near(&coll, (0.0, 0.0), 5, f64::MAX, DistType::Plain);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn multi_location_document_wins_with_closest_point() {
        let mut coll = Collection::with_pattern(&json!({"loc": "2d"}), &json!({})).unwrap();
        coll.insert(json!({"loc": [[90.0, 90.0], [1.0, 0.0]], "n": 0}))
            .unwrap();
        coll.insert(json!({"loc": [5.0, 0.0], "n": 1})).unwrap();

        let results = run_near(&coll, (0.0, 0.0), 2, f64::MAX, DistType::Plain);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].doc["n"], 0);
        assert!((results[0].exact_distance.unwrap() - 1.0).abs() < 1e-9);
        // The document appears once despite two indexed locations.
        assert_eq!(results[1].doc["n"], 1);
    }

    #[test]
    fn spherical_distances_are_radians() {
        let coll = collection(&[(-118.40, 33.94), (2.35, 48.86)]);
        let results = run_near(&coll, (-86.67, 36.12), 1, f64::MAX, DistType::Sphere);
        assert_eq!(results.len(), 1);
        let d = results[0].exact_distance.unwrap();
        assert!((0.45305..=0.45307).contains(&d));
    }

    #[test]
    fn predicate_restricts_results() {
        let mut coll = Collection::with_pattern(&json!({"loc": "2d"}), &json!({})).unwrap();
        coll.insert(json!({"loc": [1.0, 0.0], "kind": "a"})).unwrap();
        coll.insert(json!({"loc": [2.0, 0.0], "kind": "b"})).unwrap();

        let ctx = QueryCtx {
            spec: coll.spec(),
            store: coll.store(),
            interrupt: coll.interrupt_flag(),
        };
        let predicate = Predicate::compile(&json!({"kind": "b"}), "loc");
        let mut search = GeoSearch::new(
            ctx,
            coll.tree(),
            Point::new(0.0, 0.0),
            10,
            predicate,
            f64::MAX,
            DistType::Plain,
        )
        .unwrap();
        search.exec().unwrap();
        let results = search.into_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc["kind"], "b");
    }

    #[test]
    fn interrupted_search_aborts() {
        let coll = collection(&[(0.0, 0.0), (1.0, 1.0)]);
        coll.interrupt_flag().interrupt();
        let ctx = QueryCtx {
            spec: coll.spec(),
            store: coll.store(),
            interrupt: coll.interrupt_flag(),
        };
        let mut search = GeoSearch::new(
            ctx,
            coll.tree(),
            Point::new(0.0, 0.0),
            1,
            None,
            f64::MAX,
            DistType::Plain,
        )
        .unwrap();
        assert!(search.exec().is_err());
    }
}
