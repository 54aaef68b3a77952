//! Polygon containment.

use crate::accumulator::QueryCtx;
use crate::browse::Region;
use crate::error::{GeodexError, Result};
use crate::geohash::GeoHash;
use crate::geometry::{GeoBox, GeoPolygon};
use crate::spec::IndexSpec;
use crate::tree::KeyNode;
use geo::Point;

/// All documents inside a polygon of three or more vertices.
///
/// The ray-casting test over the cell representative is conclusive away
/// from the edges; within the error band of an edge it returns
/// "inconclusive" and the stored locations hashed to the candidate's cell
/// are tested exactly.
pub struct PolygonRegion {
    poly: GeoPolygon,
    bounds: GeoBox,
    max_dim: f64,
    start: GeoHash,
}

impl PolygonRegion {
    pub fn new(spec: &IndexSpec, points: Vec<Point>) -> Result<Self> {
        if points.len() < 3 {
            return Err(GeodexError::EmptyPolygon);
        }
        let poly = GeoPolygon::new(points);
        let bounds = poly.bounds();
        Ok(PolygonRegion {
            start: spec.hash_point(&poly.centroid())?,
            max_dim: bounds.max_dim(),
            bounds,
            poly,
        })
    }
}

impl Region for PolygonRegion {
    fn expand_start_hash(&self) -> GeoHash {
        self.start
    }

    fn fits_in_box(&self, width: f64) -> bool {
        self.max_dim <= width
    }

    fn intersects_box(&self, cur: &GeoBox) -> bool {
        self.bounds.intersects_ratio(cur) > 0.0
    }

    fn check_distance(&mut self, node: &KeyNode, ctx: &QueryCtx) -> Option<f64> {
        let h = node.key.hash;
        let p = ctx.spec.unhash_point(&h);

        match self.poly.contains(&p, ctx.spec.error()) {
            1 => return Some(0.0),
            -1 => return None,
            _ => {}
        }

        // Inconclusive near an edge; test the stored locations that hash
        // to this cell.
        let doc = ctx.store.get(node.loc)?;
        let locs = ctx.spec.get_locs(doc).ok()?;
        for loc in &locs {
            if ctx.spec.hash_point(loc).ok()? != h {
                continue;
            }
            if self.poly.contains(loc, 0.0) > 0 {
                return Some(0.0);
            }
        }
        None
    }
}
