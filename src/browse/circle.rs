//! Circle containment, planar or spherical.

use crate::accumulator::QueryCtx;
use crate::browse::Region;
use crate::error::{GeodexError, Result};
use crate::geohash::GeoHash;
use crate::geometry::{
    compute_x_scan_distance, distance_within, rad2deg, spheredist_deg, DistType, GeoBox,
};
use crate::spec::IndexSpec;
use crate::tree::KeyNode;
use geo::Point;

/// All documents within `max_distance` of a center point.
///
/// The scan box is widened by the quantization error; candidates whose
/// approximate distance falls inside that error band are settled by an
/// exact per-location check.
pub struct CircleRegion {
    dist_type: DistType,
    start: GeoHash,
    start_pt: Point,
    max_distance: f64,
    x_scan: f64,
    y_scan: f64,
    bbox: GeoBox,
}

impl CircleRegion {
    /// Planar circle (`$center`).
    pub fn plain(spec: &IndexSpec, center: Point, max_distance: f64) -> Result<Self> {
        Self::new(spec, center, max_distance, DistType::Plain)
    }

    /// Spherical circle (`$centerSphere`), radius in radians.
    pub fn sphere(spec: &IndexSpec, center: Point, max_distance: f64) -> Result<Self> {
        Self::new(spec, center, max_distance, DistType::Sphere)
    }

    fn new(
        spec: &IndexSpec,
        center: Point,
        max_distance: f64,
        dist_type: DistType,
    ) -> Result<Self> {
        if !(max_distance > 0.0) {
            return Err(GeodexError::BadQuery("need a max distance > 0".into()));
        }

        let (x_scan, y_scan) = match dist_type {
            DistType::Plain => {
                let scan = max_distance + spec.error();
                (scan, scan)
            }
            DistType::Sphere => {
                if max_distance >= std::f64::consts::PI {
                    return Err(GeodexError::BadQuery(
                        "Spherical MaxDistance > PI. Are you sure you are using radians?".into(),
                    ));
                }
                let y_scan = rad2deg(max_distance) + spec.error();
                let x_scan = compute_x_scan_distance(center.y(), y_scan);
                if !(center.x() + x_scan < 180.0
                    && center.x() - x_scan > -180.0
                    && center.y() + y_scan < 90.0
                    && center.y() - y_scan > -90.0)
                {
                    return Err(GeodexError::BadQuery(
                        "Spherical distance would require wrapping, which isn't implemented yet"
                            .into(),
                    ));
                }
                (x_scan, y_scan)
            }
        };

        Ok(CircleRegion {
            dist_type,
            start: spec.hash_point(&center)?,
            start_pt: center,
            max_distance,
            x_scan,
            y_scan,
            bbox: GeoBox::new(
                Point::new(center.x() - x_scan, center.y() - y_scan),
                Point::new(center.x() + x_scan, center.y() + y_scan),
            ),
        })
    }
}

impl Region for CircleRegion {
    fn expand_start_hash(&self) -> GeoHash {
        self.start
    }

    fn fits_in_box(&self, width: f64) -> bool {
        width >= self.x_scan.max(self.y_scan)
    }

    fn intersects_box(&self, cur: &GeoBox) -> bool {
        self.bbox.intersects_ratio(cur) > 0.0
    }

    fn check_distance(&mut self, node: &KeyNode, ctx: &QueryCtx) -> Option<f64> {
        let h = node.key.hash;
        let (d, error) = match self.dist_type {
            DistType::Plain => (ctx.spec.distance_hash(&self.start, &h), ctx.spec.error()),
            DistType::Sphere => (
                spheredist_deg(&self.start_pt, &ctx.spec.unhash_point(&h)),
                ctx.spec.error_sphere(),
            ),
        };

        // Inside the error band the cell representative can't settle it;
        // check the stored locations exactly.
        if d >= self.max_distance - error && d <= self.max_distance + error {
            let doc = ctx.store.get(node.loc)?;
            let locs = ctx.spec.get_locs(doc).ok()?;
            for loc in &locs {
                match self.dist_type {
                    DistType::Plain => {
                        if distance_within(&self.start_pt, loc, self.max_distance) {
                            return Some(d);
                        }
                    }
                    DistType::Sphere => {
                        // Only the locations hashed to this candidate's
                        // cell; the rest show up under their own keys.
                        if ctx.spec.hash_point(loc).ok()? != h {
                            continue;
                        }
                        if spheredist_deg(&self.start_pt, loc) <= self.max_distance {
                            return Some(d);
                        }
                    }
                }
            }
            return None;
        }

        (d <= self.max_distance).then_some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> IndexSpec {
        IndexSpec::parse(&json!({"loc": "2d"}), &json!({})).unwrap()
    }

    #[test]
    fn rejects_bad_radii() {
        let spec = spec();
        assert!(CircleRegion::plain(&spec, Point::new(0.0, 0.0), 0.0).is_err());
        assert!(CircleRegion::plain(&spec, Point::new(0.0, 0.0), -1.0).is_err());
        assert!(CircleRegion::sphere(&spec, Point::new(0.0, 0.0), 3.2).is_err());
    }

    #[test]
    fn spherical_wrap_is_rejected() {
        let spec = spec();
        // A one-radian circle near the date line would wrap.
        assert!(CircleRegion::sphere(&spec, Point::new(179.0, 0.0), 1.0).is_err());
        assert!(CircleRegion::sphere(&spec, Point::new(0.0, 89.0), 1.0).is_err());
        assert!(CircleRegion::sphere(&spec, Point::new(0.0, 0.0), 0.01).is_ok());
    }

    #[test]
    fn plain_scan_box_includes_error() {
        let spec = spec();
        let c = CircleRegion::plain(&spec, Point::new(10.0, 10.0), 2.0).unwrap();
        assert!(c.fits_in_box(2.0 + spec.error()));
        assert!(!c.fits_in_box(1.0));
        assert!(c.intersects_box(&GeoBox::square(11.0, 11.0, 1.0)));
        assert!(!c.intersects_box(&GeoBox::square(50.0, 50.0, 1.0)));
    }
}
