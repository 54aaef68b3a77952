//! Grid clustering of box-query results for map rendering.
//!
//! Matched locations are greedily assigned to the first cluster whose
//! bounds contain them; bounds are recomputed around the running centroid
//! in web-Mercator space with a half-extent derived from the query box and
//! the grid granularity. Clusters that end up with a single member degrade
//! to plain markers.

use crate::error::Result;
use crate::geometry::GeoBox;
use crate::spec::IndexSpec;
use geo::Point;
use serde_json::Value;
use std::f64::consts::PI;

/// Web-Mercator latitude clamp.
pub const MIN_LAT: f64 = -85.05112878;
pub const MAX_LAT: f64 = 85.05112878;

/// Default grid granularity for clustering.
pub const DEFAULT_GRID_SIZE: f64 = 5.0;

/// Project a lon/lat point into the unit web-Mercator square. Latitude is
/// clamped to the Mercator domain; note the projected y axis points down.
pub fn point_to_projection(p: &Point) -> Point {
    let x = (p.x() + 180.0) / 360.0;
    let lat = p.y().clamp(MIN_LAT, MAX_LAT);
    let s = (lat * PI / 180.0).sin();
    let y = 0.5 - ((1.0 + s) / (1.0 - s)).ln() / (4.0 * PI);
    Point::new(x, y)
}

/// Inverse of [`point_to_projection`].
pub fn projection_to_point(p: &Point) -> Point {
    let x = (p.x() - 0.5) * 360.0;
    let y = 90.0 - 360.0 * ((p.y() - 0.5) * 2.0 * PI).exp().atan() / PI;
    Point::new(x, y)
}

/// A single un-clustered result.
#[derive(Debug, Clone)]
pub struct GeoMarker {
    pub point: Point,
    pub obj: Value,
}

/// One running cluster: member count, tight bounds, running centroid, and
/// the centroid-centered search box membership is tested against.
#[derive(Debug, Clone)]
pub struct ClusterBox {
    search: GeoBox,
    bounds: GeoBox,
    pub count: u64,
    center_x: f64,
    center_y: f64,
    extend: f64,
    first_marker: Option<GeoMarker>,
}

impl ClusterBox {
    fn new(extend: f64) -> Self {
        ClusterBox {
            search: GeoBox::new(Point::new(0.0, 0.0), Point::new(0.0, 0.0)),
            bounds: GeoBox::new(Point::new(0.0, 0.0), Point::new(0.0, 0.0)),
            count: 0,
            center_x: 0.0,
            center_y: 0.0,
            extend,
            first_marker: None,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(self.center_x, self.center_y)
    }

    pub fn bounds(&self) -> &GeoBox {
        &self.bounds
    }

    /// Whether `p` falls inside the current search box.
    pub fn contains(&self, p: &Point) -> bool {
        self.count > 0 && self.search.inside(p, 0.0)
    }

    fn add_point(&mut self, p: Point, marker: GeoMarker) {
        if self.count == 0 {
            self.bounds = GeoBox::new(p, p);
            self.center_x = p.x();
            self.center_y = p.y();
            self.first_marker = Some(marker);
        } else {
            self.bounds.extend(&p);
            let n = self.count as f64;
            self.center_x = (p.x() + self.center_x * n) / (n + 1.0);
            self.center_y = (p.y() + self.center_y * n) / (n + 1.0);
        }
        self.refresh_search_box();
        self.count += 1;
    }

    /// Re-center the search box on the running centroid, half-extent
    /// `extend` in projected space. Projected y grows downward, hence the
    /// sign flip.
    fn refresh_search_box(&mut self) {
        let cen = point_to_projection(&self.center());
        self.search = GeoBox::new(
            projection_to_point(&Point::new(cen.x() - self.extend, cen.y() + self.extend)),
            projection_to_point(&Point::new(cen.x() + self.extend, cen.y() - self.extend)),
        );
    }
}

/// Accumulates matched documents into clusters and markers.
pub struct ClusterBuilder {
    want: GeoBox,
    extend: f64,
    need_cluster: bool,
    clusters: Vec<ClusterBox>,
    markers: Vec<GeoMarker>,
}

impl ClusterBuilder {
    pub fn new(want: GeoBox, grid_size: f64, need_cluster: bool) -> Self {
        let min_pro = point_to_projection(&want.min);
        let max_pro = point_to_projection(&want.max);
        let extend = (max_pro.x() - min_pro.x()).min(min_pro.y() - max_pro.y()) / grid_size;
        ClusterBuilder {
            want,
            extend,
            need_cluster,
            clusters: Vec::new(),
            markers: Vec::new(),
        }
    }

    /// Fold every in-box location of `doc` into the running clusters.
    pub fn add_document(&mut self, spec: &IndexSpec, doc: &Value) -> Result<()> {
        for loc in spec.get_locs(doc)? {
            if !self.want.inside(&loc, 0.0) {
                continue;
            }
            let marker = GeoMarker {
                point: loc,
                obj: doc.clone(),
            };
            if !self.need_cluster {
                self.markers.push(marker);
                continue;
            }
            match self.clusters.iter_mut().find(|c| c.contains(&loc)) {
                Some(cluster) => cluster.add_point(loc, marker),
                None => {
                    let mut cluster = ClusterBox::new(self.extend);
                    cluster.add_point(loc, marker);
                    self.clusters.push(cluster);
                }
            }
        }
        Ok(())
    }

    /// Final clusters and markers; single-member clusters degrade to
    /// markers.
    pub fn finish(self) -> (Vec<ClusterBox>, Vec<GeoMarker>) {
        let mut markers = self.markers;
        let mut clusters = Vec::new();
        for cluster in self.clusters {
            if cluster.count == 1 {
                markers.push(cluster.first_marker.clone().expect("single-member cluster"));
            } else if cluster.count > 1 {
                clusters.push(cluster);
            }
        }
        (clusters, markers)
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
    fn projection_round_trips() {
        for (x, y) in [(0.0, 0.0), (-74.0, 40.7), (120.0, -33.0)] {
            let p = Point::new(x, y);
            let back = projection_to_point(&point_to_projection(&p));
            assert!((back.x() - x).abs() < 1e-9);
            assert!((back.y() - y).abs() < 1e-9);
        }
    }

    #[test]
    fn projection_clamps_latitude() {
        let p = point_to_projection(&Point::new(0.0, 89.9));
        assert!(p.y().is_finite());
        assert_eq!(
            p.y(),
            point_to_projection(&Point::new(0.0, MAX_LAT)).y()
        );
    }

    #[test]
    fn nearby_points_cluster_and_singles_degrade() {
        let spec = spec();
        let want = GeoBox::new(Point::new(-10.0, -10.0), Point::new(10.0, 10.0));
        let mut builder = ClusterBuilder::new(want, DEFAULT_GRID_SIZE, true);

        // Two tight points plus one far-away single.
        builder
            .add_document(&spec, &json!({"loc": [1.0, 1.0], "n": 0}))
            .unwrap();
        builder
            .add_document(&spec, &json!({"loc": [1.01, 1.01], "n": 1}))
            .unwrap();
        builder
            .add_document(&spec, &json!({"loc": [-8.0, -8.0], "n": 2}))
            .unwrap();
        // A point outside the box is ignored entirely.
        builder
            .add_document(&spec, &json!({"loc": [50.0, 50.0], "n": 3}))
            .unwrap();

        let (clusters, markers) = builder.finish();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].count, 2);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].obj["n"], 2);

        let c = clusters[0].center();
        assert!((c.x() - 1.005).abs() < 1e-9);
    }

    #[test]
    fn cluster_disabled_emits_markers_only() {
        let spec = spec();
        let want = GeoBox::new(Point::new(-10.0, -10.0), Point::new(10.0, 10.0));
        let mut builder = ClusterBuilder::new(want, DEFAULT_GRID_SIZE, false);
        builder
            .add_document(&spec, &json!({"loc": [1.0, 1.0]}))
            .unwrap();
        builder
            .add_document(&spec, &json!({"loc": [1.01, 1.01]}))
            .unwrap();
        let (clusters, markers) = builder.finish();
        assert!(clusters.is_empty());
        assert_eq!(markers.len(), 2);
    }
}
