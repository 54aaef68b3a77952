//! Axis-aligned box containment.

use crate::accumulator::QueryCtx;
use crate::browse::Region;
use crate::error::{GeodexError, Result};
use crate::geohash::GeoHash;
use crate::geometry::GeoBox;
use crate::spec::IndexSpec;
use crate::tree::KeyNode;
use geo::Point;

/// All documents inside a rectangle.
///
/// Degenerate input (min above max on either axis) is normalized by
/// swapping, and coordinates outside the index interval are clamped to it;
/// both adjustments are surfaced through a debug diagnostic since they
/// silently change the region the user asked for.
pub struct RectRegion {
    want: GeoBox,
    want_len: f64,
    fudge: f64,
    start: GeoHash,
}

impl RectRegion {
    pub fn new(spec: &IndexSpec, min: Point, max: Point) -> Result<Self> {
        let requested = GeoBox::new(min, max);
        let want = Self::fix_box(spec, requested);
        if want != requested {
            tracing::debug!(
                requested = ?requested,
                effective = ?want,
                "box query bounds normalized to the index interval"
            );
        }

        if !(want.area() > 0.0) {
            return Err(GeodexError::BadQuery("need an area > 0".into()));
        }

        let center = want.center();
        let fudge = spec.error();
        Ok(RectRegion {
            want,
            want_len: fudge
                + (want.max.x() - want.min.x()).max(want.max.y() - want.min.y()),
            fudge,
            start: spec.hash_point(&center)?,
        })
    }

    fn fix_box(spec: &IndexSpec, b: GeoBox) -> GeoBox {
        let (mut min_x, mut max_x) = (b.min.x(), b.max.x());
        let (mut min_y, mut max_y) = (b.min.y(), b.max.y());
        if min_x > max_x {
            std::mem::swap(&mut min_x, &mut max_x);
        }
        if min_y > max_y {
            std::mem::swap(&mut min_y, &mut max_y);
        }
        GeoBox::new(
            Point::new(min_x.max(spec.min()), min_y.max(spec.min())),
            Point::new(max_x.min(spec.max()), max_y.min(spec.max())),
        )
    }

    pub fn bounds(&self) -> &GeoBox {
        &self.want
    }
}

impl Region for RectRegion {
    fn expand_start_hash(&self) -> GeoHash {
        self.start
    }

    fn fits_in_box(&self, width: f64) -> bool {
        width >= self.want_len
    }

    fn intersects_box(&self, cur: &GeoBox) -> bool {
        self.want.intersects_ratio(cur) > 0.0
    }

    fn check_distance(&mut self, node: &KeyNode, ctx: &QueryCtx) -> Option<f64> {
        let approx = ctx.spec.unhash_point(&node.key.hash);
        let approx_inside = self.want.inside(&approx, self.fudge);

        if approx_inside && self.want.on_boundary(&approx, self.fudge) {
            // Cell representative sits on the edge band; only the stored
            // locations can settle it.
            let doc = ctx.store.get(node.loc)?;
            let locs = ctx.spec.get_locs(doc).ok()?;
            return locs
                .iter()
                .any(|loc| self.want.inside(loc, 0.0))
                .then_some(0.0);
        }

        approx_inside.then_some(0.0)
    }
}
