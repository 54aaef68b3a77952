//! Index schema: coordinate quantization and document key extraction.
//!
//! An [`IndexSpec`] is parsed from a key pattern like
//! `{"loc": "2d", "category": 1}` plus an options document, and owns the
//! mapping between floating-point coordinates and geohash cells: quantize,
//! dequantize, hash, unhash, cell sizes and the derived quantization error.
//! It also knows how to pull locations and composite index keys out of a
//! document.

use crate::error::{GeodexError, Result};
use crate::geohash::GeoHash;
use crate::geometry::{deg2rad, distance, GeoBox};
use geo::Point;
use serde_json::Value;

/// Marker value identifying the geo member of a key pattern.
pub const GEO_2D_NAME: &str = "2d";

/// Schema of one 2D geospatial index.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    /// Dotted path of the geo field. Always the first member of the pattern.
    geo: String,
    /// Companion fields, in key-pattern order.
    other: Vec<String>,
    bits: u8,
    min: f64,
    max: f64,
    scaling: f64,
    /// Diagonal of one cell at full precision: an upper bound on how far an
    /// exact location can sit from its cell representative.
    error: f64,
    /// The same bound in radians, for spherical filters.
    error_sphere: f64,
}

/// One index entry produced from a document: the location hash followed by
/// the companion-field values.
#[derive(Debug, Clone)]
pub struct IndexKey {
    pub hash: GeoHash,
    pub companions: Vec<Value>,
}

fn config_val(options: &Value, name: &str, default: f64) -> f64 {
    options.get(name).and_then(Value::as_f64).unwrap_or(default)
}

impl IndexSpec {
    /// Parse a key pattern and options document into a spec.
    ///
    /// The pattern must contain exactly one `"2d"` member and it must come
    /// first; remaining members are companion fields. Recognized options:
    /// `bits` (1..=32, default 26), `min` and `max` (default ±180).
    pub fn parse(key_pattern: &Value, options: &Value) -> Result<Self> {
        let pattern = key_pattern.as_object().ok_or_else(|| {
            GeodexError::BadIndexSpec("key pattern must be an object".into())
        })?;

        let mut geo = String::new();
        let mut other = Vec::new();
        for (name, v) in pattern {
            if v.as_str() == Some(GEO_2D_NAME) {
                if !geo.is_empty() {
                    return Err(GeodexError::BadIndexSpec("can't have 2 geo fields".into()));
                }
                if !other.is_empty() {
                    return Err(GeodexError::BadIndexSpec(
                        "2d has to be first in index".into(),
                    ));
                }
                geo = name.clone();
            } else {
                other.push(name.clone());
            }
        }
        if geo.is_empty() {
            return Err(GeodexError::BadIndexSpec("no geo field specified".into()));
        }

        let bits = config_val(options, "bits", 26.0);
        if !(bits > 0.0 && bits <= 32.0) {
            return Err(GeodexError::BadIndexSpec(
                "bits in geo index must be between 1 and 32".into(),
            ));
        }
        let bits = bits as u8;

        let max = config_val(options, "max", 180.0);
        let min = config_val(options, "min", -180.0);
        if min >= max {
            return Err(GeodexError::BadIndexSpec(format!(
                "bad geo interval [ {min}, {max} )"
            )));
        }

        let num_buckets = (1u64 << 32) as f64;
        let scaling = num_buckets / (max - min);

        let mut spec = IndexSpec {
            geo,
            other,
            bits,
            min,
            max,
            scaling,
            error: 0.0,
            error_sphere: 0.0,
        };

        let a = GeoHash::new(0, 0, bits);
        let b = a.move_cell(1, 1);
        spec.error = spec.distance_hash(&a, &b);
        spec.error_sphere = deg2rad(spec.error);
        Ok(spec)
    }

    pub fn geo_field(&self) -> &str {
        &self.geo
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Quantization error (cell diagonal at full precision), in coordinate
    /// units.
    pub fn error(&self) -> f64 {
        self.error
    }

    /// Quantization error in radians.
    pub fn error_sphere(&self) -> f64 {
        self.error_sphere
    }

    /// Map an axis value in `[min, max)` to its 32-bit quantized form.
    pub fn quantize(&self, v: f64) -> Result<u32> {
        if !(v >= self.min && v < self.max) {
            return Err(GeodexError::BadValue(format!(
                "point not in interval of [ {}, {} )",
                self.min, self.max
            )));
        }
        Ok(((v - self.min) * self.scaling) as u32)
    }

    /// Inverse of [`IndexSpec::quantize`], up to one quantization step.
    pub fn dequantize(&self, v: u32) -> f64 {
        v as f64 / self.scaling + self.min
    }

    /// Hash a coordinate pair at this spec's precision.
    pub fn hash(&self, x: f64, y: f64) -> Result<GeoHash> {
        Ok(GeoHash::new(self.quantize(x)?, self.quantize(y)?, self.bits))
    }

    pub fn hash_point(&self, p: &Point) -> Result<GeoHash> {
        self.hash(p.x(), p.y())
    }

    /// The cell representative: the lower-left corner of the hash's cell.
    pub fn unhash_point(&self, h: &GeoHash) -> Point {
        let (x, y) = h.unhash();
        Point::new(self.dequantize(x), self.dequantize(y))
    }

    /// Euclidean distance between two cell representatives.
    pub fn distance_hash(&self, a: &GeoHash, b: &GeoHash) -> f64 {
        distance(&self.unhash_point(a), &self.unhash_point(b))
    }

    /// Diagonal of `h`'s cell.
    pub fn size_diag(&self, h: &GeoHash) -> f64 {
        self.distance_hash(h, &h.move_cell(1, 1))
    }

    /// Edge length of `h`'s cell. The grid wraps, so a neighbor that lands
    /// back at `min` is read as `max`.
    pub fn size_edge(&self, h: &GeoHash) -> f64 {
        let a = self.unhash_point(h);
        let b = self.unhash_point(&h.move_cell(1, 1));
        let bx = if b.x() == self.min { self.max } else { b.x() };
        (a.x() - bx).abs()
    }

    /// The square cell covered by `h`.
    pub fn cell_box(&self, h: &GeoHash) -> GeoBox {
        let min = self.unhash_point(h);
        let edge = self.size_edge(h);
        GeoBox::square(min.x(), min.y(), edge)
    }

    /// Hash a query operand: an object or array is read as a location; a
    /// string is the pre-hashed textual form.
    pub fn hash_element(&self, e: &Value) -> Result<GeoHash> {
        match e {
            Value::Object(_) | Value::Array(_) => {
                let p = point_from(e)?;
                self.hash_point(&p)
            }
            Value::String(s) => GeoHash::parse(s),
            other => Err(GeodexError::BadValue(format!(
                "can't hash element: {other}"
            ))),
        }
    }

    /// All locations stored in `doc`'s geo field.
    pub fn get_locs(&self, doc: &Value) -> Result<Vec<Point>> {
        let mut locs = Vec::new();
        self.walk_locations(doc, None, Some(&mut locs))?;
        Ok(locs)
    }

    /// All index keys `doc` produces: one per location, each carrying the
    /// companion-field values.
    pub fn get_keys(&self, doc: &Value) -> Result<Vec<IndexKey>> {
        let mut keys = Vec::new();
        self.walk_locations(doc, Some(&mut keys), None)?;
        Ok(keys)
    }

    /// Shared walk over the location grammar:
    ///
    /// ```text
    /// locs ::= [loc, loc, ..., loc] | {k: loc, k: loc} | loc
    /// loc  ::= {k1: #, k2: #} | [#, #] | {}
    /// ```
    ///
    /// An array whose first element is a number is a single location;
    /// otherwise it is an array of locations. Empty locations are skipped.
    fn walk_locations(
        &self,
        doc: &Value,
        mut keys: Option<&mut Vec<IndexKey>>,
        mut locs: Option<&mut Vec<Point>>,
    ) -> Result<()> {
        let mut geo_values = Vec::new();
        collect_dotted(doc, &self.geo, false, &mut geo_values);

        for geo in geo_values {
            let elements: Vec<&Value> = match geo {
                Value::Array(a) => a.iter().collect(),
                Value::Object(m) => m.values().collect(),
                _ => continue,
            };
            if elements.is_empty() {
                continue;
            }

            let single = elements[0].is_number();
            for &element in &elements {
                let loc_obj: &Value = if single {
                    geo
                } else {
                    if !matches!(element, Value::Array(_) | Value::Object(_)) {
                        return Err(GeodexError::BadValue(
                            "location object expected, location array not in correct format"
                                .into(),
                        ));
                    }
                    if is_empty_container(element) {
                        continue;
                    }
                    element
                };

                let p = point_from(loc_obj)?;
                if let Some(locs) = locs.as_deref_mut() {
                    locs.push(p);
                }

                if let Some(keys) = keys.as_deref_mut() {
                    let hash = self.hash_point(&p)?;
                    let mut companions = Vec::with_capacity(self.other.len());
                    for field in &self.other {
                        let mut values = Vec::new();
                        collect_dotted(doc, field, true, &mut values);
                        companions.push(match values.len() {
                            0 => Value::Null,
                            1 => values[0].clone(),
                            _ => Value::Array(values.into_iter().cloned().collect()),
                        });
                    }
                    keys.push(IndexKey { hash, companions });
                }

                if single {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn is_empty_container(v: &Value) -> bool {
    match v {
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

/// Read a location's first two numeric members as an `(x, y)` pair.
pub fn point_from(loc: &Value) -> Result<Point> {
    let mut it: Box<dyn Iterator<Item = &Value>> = match loc {
        Value::Array(a) => Box::new(a.iter()),
        Value::Object(m) => Box::new(m.values()),
        other => {
            return Err(GeodexError::BadValue(format!(
                "location object expected, got: {other}"
            )))
        }
    };

    let x = it.next().ok_or_else(|| GeodexError::BadValue("geo field is empty".into()))?;
    let y = it
        .next()
        .ok_or_else(|| GeodexError::BadValue("geo field only has 1 element".into()))?;

    match (x.as_f64(), y.as_f64()) {
        (Some(x), Some(y)) => Ok(Point::new(x, y)),
        _ => Err(GeodexError::BadValue(format!(
            "geo values have to be numbers: {loc}"
        ))),
    }
}

/// Resolve a dotted path inside a document, traversing arrays along the way.
/// With `expand_last`, a final array value contributes its elements instead
/// of itself (companion-field semantics); the geo field keeps the array
/// whole so the location grammar can inspect it.
fn collect_dotted<'v>(doc: &'v Value, path: &str, expand_last: bool, out: &mut Vec<&'v Value>) {
    fn step<'v>(v: &'v Value, segs: &[&str], expand_last: bool, out: &mut Vec<&'v Value>) {
        if segs.is_empty() {
            if expand_last {
                if let Value::Array(a) = v {
                    out.extend(a.iter());
                    return;
                }
            }
            out.push(v);
            return;
        }
        match v {
            Value::Object(m) => {
                if let Some(next) = m.get(segs[0]) {
                    step(next, &segs[1..], expand_last, out);
                }
            }
            Value::Array(a) => {
                for e in a {
                    step(e, segs, expand_last, out);
                }
            }
            _ => {}
        }
    }
    let segs: Vec<&str> = path.split('.').collect();
    step(doc, &segs, expand_last, out);
}
