//! Planar geometry primitives and spherical distance.
//!
//! Points are plain `geo::Point<f64>` pairs; equality is bit-exact. The box
//! and polygon types here carry the fudge-tolerant predicates the
//! approximate/exact two-stage filters need, which is why they are not the
//! `geo` crate's own rect/polygon algorithms.

use geo::Point;

/// Which distance a query runs under: flat-plane Euclidean, or the
/// great-circle approximation over degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistType {
    #[default]
    Plain,
    Sphere,
}

/// Degrees to radians.
#[inline]
pub fn deg2rad(d: f64) -> f64 {
    d.to_radians()
}

/// Radians to degrees.
#[inline]
pub fn rad2deg(r: f64) -> f64 {
    r.to_degrees()
}

/// Euclidean distance between two points.
#[inline]
pub fn distance(a: &Point, b: &Point) -> f64 {
    let dx = a.x() - b.x();
    let dy = a.y() - b.y();
    (dx * dx + dy * dy).sqrt()
}

/// Whether `b` lies within `max_distance` of `a` (inclusive).
#[inline]
pub fn distance_within(a: &Point, b: &Point, max_distance: f64) -> bool {
    let dx = a.x() - b.x();
    let dy = a.y() - b.y();
    dx * dx + dy * dy <= max_distance * max_distance
}

/// Great-circle distance in radians between two points given in radians
/// (x is longitude, y is latitude).
///
/// Computed from the dot product of the two position vectors, clamped so
/// coincident points return exactly 0 and antipodal points exactly π
/// instead of producing NaN from `acos` rounding.
pub fn spheredist_rad(p1: &Point, p2: &Point) -> f64 {
    let (sin_x1, cos_x1) = p1.x().sin_cos();
    let (sin_y1, cos_y1) = p1.y().sin_cos();
    let (sin_x2, cos_x2) = p2.x().sin_cos();
    let (sin_y2, cos_y2) = p2.y().sin_cos();

    let cross_prod = (cos_y1 * cos_x1 * cos_y2 * cos_x2)
        + (cos_y1 * sin_x1 * cos_y2 * sin_x2)
        + (sin_y1 * sin_y2);

    if cross_prod >= 1.0 || cross_prod <= -1.0 {
        return if cross_prod > 0.0 { 0.0 } else { std::f64::consts::PI };
    }
    cross_prod.acos()
}

/// Great-circle distance in radians between two points given in degrees.
pub fn spheredist_deg(p1: &Point, p2: &Point) -> f64 {
    spheredist_rad(
        &Point::new(deg2rad(p1.x()), deg2rad(p1.y())),
        &Point::new(deg2rad(p2.x()), deg2rad(p2.y())),
    )
}

/// Expand a latitude extent (degrees) to a longitude extent that is safe at
/// latitude `y`: the circle of longitude shrinks toward the poles, so the
/// scan has to widen by the worst-case cosine over the latitude band.
/// Latitudes are clipped to ±89 to keep the divisor finite.
pub fn compute_x_scan_distance(y: f64, max_dist_degrees: f64) -> f64 {
    max_dist_degrees
        / deg2rad((y + max_dist_degrees).min(89.0))
            .cos()
            .min(deg2rad((y - max_dist_degrees).max(-89.0)).cos())
}

/// An axis-aligned rectangle, `min <= max` componentwise once normalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBox {
    pub min: Point,
    pub max: Point,
}

impl GeoBox {
    pub fn new(min: Point, max: Point) -> Self {
        GeoBox { min, max }
    }

    /// A square with its lower-left corner at `(x, y)`.
    pub fn square(x: f64, y: f64, size: f64) -> Self {
        GeoBox {
            min: Point::new(x, y),
            max: Point::new(x + size, y + size),
        }
    }

    fn between(min: f64, max: f64, val: f64, fudge: f64) -> bool {
        val + fudge >= min && val <= max + fudge
    }

    fn on_boundary_value(bound: f64, val: f64, fudge: f64) -> bool {
        val >= bound - fudge && val <= bound + fudge
    }

    /// Overlap of `[amin, amax]` and `[bmin, bmax]`: the lower bound of the
    /// intersection when `want_min`, otherwise the upper bound. `None` when
    /// the intervals are disjoint.
    fn mid(amin: f64, amax: f64, bmin: f64, bmax: f64, want_min: bool) -> Option<f64> {
        debug_assert!(amin <= amax);
        debug_assert!(bmin <= bmax);
        if amin < bmin {
            if amax < bmin {
                return None;
            }
            return Some(if want_min { bmin } else { amax });
        }
        if amin > bmax {
            return None;
        }
        Some(if want_min { amin } else { bmax })
    }

    /// Intersection ratio: the intersection area over the average of the two
    /// areas, in `[0, 1]`. Zero means disjoint.
    pub fn intersects_ratio(&self, other: &GeoBox) -> f64 {
        let min_x = Self::mid(self.min.x(), self.max.x(), other.min.x(), other.max.x(), true);
        let max_x = Self::mid(self.min.x(), self.max.x(), other.min.x(), other.max.x(), false);
        let min_y = Self::mid(self.min.y(), self.max.y(), other.min.y(), other.max.y(), true);
        let max_y = Self::mid(self.min.y(), self.max.y(), other.min.y(), other.max.y(), false);

        let (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) = (min_x, max_x, min_y, max_y)
        else {
            return 0.0;
        };

        let intersection = GeoBox::new(Point::new(min_x, min_y), Point::new(max_x, max_y));
        intersection.area() / ((self.area() + other.area()) / 2.0)
    }

    pub fn area(&self) -> f64 {
        (self.max.x() - self.min.x()) * (self.max.y() - self.min.y())
    }

    /// The longer of the two side lengths.
    pub fn max_dim(&self) -> f64 {
        (self.max.x() - self.min.x()).max(self.max.y() - self.min.y())
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.min.x() + self.max.x()) / 2.0,
            (self.min.y() + self.max.y()) / 2.0,
        )
    }

    /// Whether `p` lies within `fudge` of one of the four edges.
    pub fn on_boundary(&self, p: &Point, fudge: f64) -> bool {
        Self::on_boundary_value(self.min.x(), p.x(), fudge)
            || Self::on_boundary_value(self.max.x(), p.x(), fudge)
            || Self::on_boundary_value(self.min.y(), p.y(), fudge)
            || Self::on_boundary_value(self.max.y(), p.y(), fudge)
    }

    pub fn inside(&self, p: &Point, fudge: f64) -> bool {
        self.inside_xy(p.x(), p.y(), fudge)
    }

    pub fn inside_xy(&self, x: f64, y: f64, fudge: f64) -> bool {
        Self::between(self.min.x(), self.max.x(), x, fudge)
            && Self::between(self.min.y(), self.max.y(), y, fudge)
    }

    /// Whether `other` lies entirely inside this box.
    pub fn contains_box(&self, other: &GeoBox, fudge: f64) -> bool {
        self.inside(&other.min, fudge) && self.inside(&other.max, fudge)
    }

    /// Grow the box to include `p`.
    pub fn extend(&mut self, p: &Point) {
        if p.x() < self.min.x() {
            self.min = Point::new(p.x(), self.min.y());
        } else if p.x() > self.max.x() {
            self.max = Point::new(p.x(), self.max.y());
        }
        if p.y() < self.min.y() {
            self.min = Point::new(self.min.x(), p.y());
        } else if p.y() > self.max.y() {
            self.max = Point::new(self.max.x(), p.y());
        }
    }
}

/// A simple polygon, at least three vertices, not necessarily closed (the
/// edge from the last vertex back to the first is implied).
#[derive(Debug, Clone)]
pub struct GeoPolygon {
    points: Vec<Point>,
}

impl GeoPolygon {
    pub fn new(points: Vec<Point>) -> Self {
        GeoPolygon { points }
    }

    pub fn size(&self) -> usize {
        self.points.len()
    }

    /// Ray-casting containment with an error tolerance.
    ///
    /// Returns `+1` when `p` is inside, `-1` when outside, and `0` when `p`
    /// lies within `fudge` of an edge, i.e. the answer is inconclusive at
    /// this precision and the caller should fall back to an exact test on
    /// the document's stored location.
    pub fn contains(&self, p: &Point, fudge: f64) -> i32 {
        let fudge_box = GeoBox::new(
            Point::new(p.x() - fudge, p.y() - fudge),
            Point::new(p.x() + fudge, p.y() + fudge),
        );

        let mut counter = 0;
        let n = self.size();
        let mut p1 = self.points[0];
        for i in 1..=n {
            let p2 = self.points[i % n];

            // When the error box comes near this segment, decide whether the
            // segment actually crosses it; if it does the result is
            // inconclusive.
            if fudge > 0.0
                && fudge_box.min.y() <= p1.y().max(p2.y())
                && fudge_box.max.y() >= p1.y().min(p2.y())
                && fudge_box.min.x() <= p1.x().max(p2.x())
                && fudge_box.max.x() >= p1.x().min(p2.x())
            {
                if fudge_box.inside(&p1, 0.0) || fudge_box.inside(&p2, 0.0) {
                    return 0;
                }

                // Segment crossing the top or bottom edge of the box.
                if p1.y() != p2.y() {
                    let inv_slope = (p2.x() - p1.x()) / (p2.y() - p1.y());

                    let x_top = (fudge_box.max.y() - p1.y()) * inv_slope + p1.x();
                    if fudge_box.min.x() <= x_top && fudge_box.max.x() >= x_top {
                        return 0;
                    }

                    let x_bottom = (fudge_box.min.y() - p1.y()) * inv_slope + p1.x();
                    if fudge_box.min.x() <= x_bottom && fudge_box.max.x() >= x_bottom {
                        return 0;
                    }
                }

                // Segment crossing the left or right edge.
                if p1.x() != p2.x() {
                    let slope = (p2.y() - p1.y()) / (p2.x() - p1.x());

                    let y_right = (fudge_box.max.x() - p1.x()) * slope + p1.y();
                    if fudge_box.min.y() <= y_right && fudge_box.max.y() >= y_right {
                        return 0;
                    }

                    let y_left = (fudge_box.min.x() - p1.x()) * slope + p1.y();
                    if fudge_box.min.y() <= y_left && fudge_box.max.y() >= y_left {
                        return 0;
                    }
                }
            }

            // The ray cast itself.
            if p.y() > p1.y().min(p2.y())
                && p.y() <= p1.y().max(p2.y())
                && p.x() <= p1.x().max(p2.x())
                && p1.y() != p2.y()
            {
                let x_intersect =
                    (p.y() - p1.y()) * (p2.x() - p1.x()) / (p2.y() - p1.y()) + p1.x();
                if p1.x() == p2.x() || p.x() <= x_intersect {
                    counter += 1;
                }
            }

            p1 = p2;
        }

        if counter % 2 == 0 {
            -1
        } else {
            1
        }
    }

    /// Center of mass by the signed-area formula.
    pub fn centroid(&self) -> Point {
        let n = self.size();
        let mut cx = 0.0;
        let mut cy = 0.0;
        let mut signed_area = 0.0;

        for i in 0..n {
            let p0 = &self.points[i];
            let p1 = &self.points[(i + 1) % n];
            let a = p0.x() * p1.y() - p1.x() * p0.y();
            signed_area += a;
            cx += (p0.x() + p1.x()) * a;
            cy += (p0.y() + p1.y()) * a;
        }

        signed_area *= 0.5;
        Point::new(cx / (6.0 * signed_area), cy / (6.0 * signed_area))
    }

    /// Axis-aligned bounding box.
    pub fn bounds(&self) -> GeoBox {
        let mut b = GeoBox::new(self.points[0], self.points[0]);
        for p in &self.points[1..] {
            b.extend(p);
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EARTH_RADIUS_KM: f64 = 6371.0;
    const EARTH_RADIUS_MILES: f64 = EARTH_RADIUS_KM * 0.621371192;

    #[test]
    fn box_inside_with_and_without_fudge() {
        let b = GeoBox::new(
            Point::new(29.762283, -95.364271),
            Point::new(29.764283000000002, -95.36227099999999),
        );
        assert!(b.inside_xy(29.763, -95.363, 0.0));
        assert!(!b.inside_xy(32.9570255, -96.1082497, 0.0));
        assert!(!b.inside_xy(32.9570255, -96.1082497, 0.01));
    }

    #[test]
    fn box_intersection_ratio() {
        let a = GeoBox::square(0.0, 0.0, 2.0);
        assert_eq!(a.intersects_ratio(&a), 1.0);

        let disjoint = GeoBox::square(5.0, 5.0, 1.0);
        assert_eq!(a.intersects_ratio(&disjoint), 0.0);

        // Half overlap on one axis: intersection 2, average area 4.
        let shifted = GeoBox::square(1.0, 0.0, 2.0);
        let ratio = a.intersects_ratio(&shifted);
        assert!((ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn box_boundary_detection() {
        let b = GeoBox::square(0.0, 0.0, 2.0);
        assert!(b.on_boundary(&Point::new(0.0005, 1.0), 0.001));
        assert!(!b.on_boundary(&Point::new(1.0, 1.0), 0.001));
    }

    #[test]
    fn spherical_distance_known_airports() {
        // Great-circle worked example: Nashville to Los Angeles.
        let bna = Point::new(-86.67, 36.12);
        let lax = Point::new(-118.40, 33.94);

        let d1 = spheredist_deg(&bna, &lax);
        let d2 = spheredist_deg(&lax, &bna);
        assert!((0.45305..=0.45307).contains(&d1));
        assert!((0.45305..=0.45307).contains(&d2));

        // Same pair in radians.
        let bna_rad = Point::new(-1.5127, 0.6304);
        let lax_rad = Point::new(-2.0665, 0.5924);
        let d = spheredist_rad(&bna_rad, &lax_rad);
        assert!((0.45305..=0.45307).contains(&d));

        let jfk = Point::new(-73.77694444, 40.63861111);
        let miles = spheredist_deg(&jfk, &lax) * EARTH_RADIUS_MILES;
        assert!(miles > 2469.0 && miles < 2470.0);
    }

    #[test]
    fn spherical_distance_degenerate_points() {
        let bna = Point::new(-86.67, 36.12);
        let zero = Point::new(0.0, 0.0);
        let antizero = Point::new(0.0, -180.0);

        assert!(spheredist_deg(&bna, &bna) < 1e-6);
        assert!(spheredist_deg(&zero, &zero) < 1e-6);
        assert!((std::f64::consts::PI - spheredist_deg(&zero, &antizero)).abs() < 1e-6);
        assert!((std::f64::consts::PI - spheredist_deg(&antizero, &zero)).abs() < 1e-6);
    }

    #[test]
    fn polygon_contains_conclusive_and_fuzzy() {
        let square = GeoPolygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(4.0, 4.0),
            Point::new(0.0, 4.0),
        ]);

        assert_eq!(square.contains(&Point::new(2.0, 2.0), 0.0), 1);
        assert_eq!(square.contains(&Point::new(5.0, 2.0), 0.0), -1);
        // Near an edge with tolerance: inconclusive.
        assert_eq!(square.contains(&Point::new(3.999, 2.0), 0.01), 0);
        assert_eq!(square.contains(&Point::new(4.001, 2.0), 0.01), 0);
    }

    #[test]
    fn polygon_centroid_and_bounds() {
        let square = GeoPolygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(4.0, 4.0),
            Point::new(0.0, 4.0),
        ]);
        let c = square.centroid();
        assert!((c.x() - 2.0).abs() < 1e-12);
        assert!((c.y() - 2.0).abs() < 1e-12);

        let b = square.bounds();
        assert_eq!(b.min, Point::new(0.0, 0.0));
        assert_eq!(b.max, Point::new(4.0, 4.0));
        assert_eq!(b.max_dim(), 4.0);
    }

    #[test]
    fn x_scan_distance_widens_toward_poles() {
        let at_equator = compute_x_scan_distance(0.0, 1.0);
        let at_60 = compute_x_scan_distance(60.0, 1.0);
        assert!(at_60 > at_equator);
        assert!(at_equator >= 1.0);
        // Clipping keeps the result finite near the pole.
        assert!(compute_x_scan_distance(89.5, 2.0).is_finite());
    }
}
