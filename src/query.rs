//! Query parsing, cursors, and the spatial commands.
//!
//! The factory recognizes the operator forms below on a collection's geo
//! field and builds the matching engine:
//!
//! ```text
//! {geo: {$near: [x, y], $maxDistance: r}}
//! {geo: {$nearSphere: [x, y], $maxDistance: r}}      // r in radians
//! {geo: {$within: {$center: [[x, y], r]}}}
//! {geo: {$within: {$centerSphere: [[x, y], r]}}}     // r in radians
//! {geo: {$within: {$box: [[x0, y0], [x1, y1]]}}}
//! {geo: {$within: {$polygon: [[x0, y0], ...]}}}
//! ```
//!
//! Remaining non-operator fields of the query compile into the document
//! predicate. On top of the cursors sit the `geo_near`, `geo_cluster`, and
//! `geo_walk` commands.

use crate::accumulator::{GeoPoint, Predicate, QueryCtx};
use crate::browse::{CircleRegion, GeoBrowse, PolygonRegion, RectRegion};
use crate::cluster::{ClusterBuilder, DEFAULT_GRID_SIZE};
use crate::db::Collection;
use crate::error::{GeodexError, Result};
use crate::geohash::GeoHash;
use crate::geometry::{DistType, GeoBox};
use crate::search::GeoSearch;
use crate::spec::point_from;
use geo::Point;
use serde_json::{json, Value};
use std::time::Instant;

/// Default result count for nearest queries.
pub const DEFAULT_NUM_WANTED: usize = 100;

/// A parsed spatial operator.
#[derive(Debug, Clone)]
pub enum GeoQueryOp {
    Near {
        point: Point,
        max_distance: f64,
        dist_type: DistType,
    },
    WithinCenter {
        center: Point,
        radius: f64,
        dist_type: DistType,
    },
    WithinBox {
        min: Point,
        max: Point,
    },
    WithinPolygon {
        points: Vec<Point>,
    },
}

/// Pull the spatial operator for `geo_field` out of a query document.
pub fn parse_geo_query(geo_field: &str, query: &Value) -> Result<GeoQueryOp> {
    let Some(clause) = query.get(geo_field).and_then(Value::as_object) else {
        return Err(GeodexError::BadQuery(format!(
            "missing geo field ({geo_field}) in : {query}"
        )));
    };
    let Some((op, operand)) = clause.iter().next() else {
        return Err(GeodexError::BadQuery(format!(
            "missing geo field ({geo_field}) in : {query}"
        )));
    };

    if let Some(suffix) = op.strip_prefix("$near") {
        let dist_type = match suffix {
            "" => DistType::Plain,
            "Sphere" => DistType::Sphere,
            _ => {
                return Err(GeodexError::BadQuery(format!(
                    "invalid $near search type: {op}"
                )))
            }
        };
        let point = point_from(operand)?;
        // A third positional element is the distance bound; an explicit
        // $maxDistance sibling overrides it.
        let mut max_distance = f64::MAX;
        if let Some(arr) = operand.as_array() {
            if arr.len() > 2 {
                if let Some(d) = arr[2].as_f64() {
                    max_distance = d;
                }
            }
        }
        if let Some(d) = clause.get("$maxDistance").and_then(Value::as_f64) {
            max_distance = d;
        }
        return Ok(GeoQueryOp::Near {
            point,
            max_distance,
            dist_type,
        });
    }

    if op == "$within" {
        let within = operand.as_object().ok_or_else(|| {
            GeodexError::BadQuery("$within has to take an object or array".into())
        })?;
        let Some((shape, operand)) = within.iter().next() else {
            return Err(GeodexError::BadQuery("unknown $within type:".into()));
        };

        if let Some(suffix) = shape.strip_prefix("$center") {
            let dist_type = match suffix {
                "" => DistType::Plain,
                "Sphere" => DistType::Sphere,
                _ => {
                    return Err(GeodexError::BadQuery(format!(
                        "invalid $center query type: {shape}"
                    )))
                }
            };
            let arr = operand.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                GeodexError::BadQuery("$center needs 2 fields (middle,max distance)".into())
            })?;
            if !matches!(arr[0], Value::Array(_) | Value::Object(_)) {
                return Err(GeodexError::BadQuery(
                    "the first field of $center object must be a location object".into(),
                ));
            }
            let center = point_from(&arr[0])?;
            let radius = arr[1].as_f64().ok_or_else(|| {
                GeodexError::BadQuery("need a max distance > 0".into())
            })?;
            return Ok(GeoQueryOp::WithinCenter {
                center,
                radius,
                dist_type,
            });
        }

        if shape == "$box" {
            let arr = operand.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                GeodexError::BadQuery("$box needs 2 fields (bottomLeft,topRight)".into())
            })?;
            return Ok(GeoQueryOp::WithinBox {
                min: point_from(&arr[0])?,
                max: point_from(&arr[1])?,
            });
        }

        if shape.starts_with("$poly") {
            let arr = operand.as_array().ok_or_else(|| {
                GeodexError::BadQuery("$polygon has to take an object or array".into())
            })?;
            let points = arr.iter().map(point_from).collect::<Result<Vec<_>>>()?;
            return Ok(GeoQueryOp::WithinPolygon { points });
        }

        return Err(GeodexError::BadQuery(format!(
            "unknown $within type: {shape}"
        )));
    }

    Err(GeodexError::BadQuery(format!(
        "missing geo field ({geo_field}) in : {query}"
    )))
}

/// Cursor over the results of any spatial operator.
///
/// Nearest queries run eagerly and hand the cursor an owned, sorted result
/// vector; region queries stay lazy and fill as the cursor advances.
pub enum GeoCursor<'a> {
    Near(NearCursor),
    Circle(GeoBrowse<'a, CircleRegion>),
    Box(GeoBrowse<'a, RectRegion>),
    Polygon(GeoBrowse<'a, PolygonRegion>),
}

/// Materialized nearest-query results in ascending exact distance.
pub struct NearCursor {
    results: Vec<GeoPoint>,
    pos: usize,
    nscanned: u64,
}

impl NearCursor {
    fn new(results: Vec<GeoPoint>) -> Self {
        let nscanned = u64::from(!results.is_empty());
        NearCursor {
            results,
            pos: 0,
            nscanned,
        }
    }

    pub fn results(&self) -> &[GeoPoint] {
        &self.results
    }
}

impl<'a> GeoCursor<'a> {
    pub fn ok(&mut self) -> Result<bool> {
        match self {
            GeoCursor::Near(c) => Ok(c.pos < c.results.len()),
            GeoCursor::Circle(b) => b.ok(),
            GeoCursor::Box(b) => b.ok(),
            GeoCursor::Polygon(b) => b.ok(),
        }
    }

    pub fn advance(&mut self) -> Result<bool> {
        match self {
            GeoCursor::Near(c) => {
                c.pos += 1;
                let ok = c.pos < c.results.len();
                if ok {
                    c.nscanned += 1;
                }
                Ok(ok)
            }
            GeoCursor::Circle(b) => b.advance(),
            GeoCursor::Box(b) => b.advance(),
            GeoCursor::Polygon(b) => b.advance(),
        }
    }

    pub fn current(&self) -> Option<&GeoPoint> {
        match self {
            GeoCursor::Near(c) => c.results.get(c.pos),
            GeoCursor::Circle(b) => b.current(),
            GeoCursor::Box(b) => b.current(),
            GeoCursor::Polygon(b) => b.current(),
        }
    }

    pub fn nscanned(&self) -> u64 {
        match self {
            GeoCursor::Near(c) => c.nscanned,
            GeoCursor::Circle(b) => b.nscanned(),
            GeoCursor::Box(b) => b.nscanned(),
            GeoCursor::Polygon(b) => b.nscanned(),
        }
    }

    /// Drain every remaining result.
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
}

impl Collection {
    fn query_ctx(&self) -> QueryCtx<'_> {
        QueryCtx {
            spec: self.spec(),
            store: self.store(),
            interrupt: self.interrupt_flag(),
        }
    }

    /// Build a cursor for a spatial query document. `num_wanted` bounds
    /// nearest-query results only.
    pub fn find_geo(&self, query: &Value, num_wanted: usize) -> Result<GeoCursor<'_>> {
        let op = parse_geo_query(self.spec().geo_field(), query)?;
        let predicate = Predicate::compile(query, self.spec().geo_field());
        let ctx = self.query_ctx();

        match op {
            GeoQueryOp::Near {
                point,
                max_distance,
                dist_type,
            } => {
                let mut search = GeoSearch::new(
                    ctx,
                    self.tree(),
                    point,
                    num_wanted,
                    predicate,
                    max_distance,
                    dist_type,
                )?;
                search.exec()?;
                Ok(GeoCursor::Near(NearCursor::new(search.into_results())))
            }
            GeoQueryOp::WithinCenter {
                center,
                radius,
                dist_type,
            } => {
                let region = match dist_type {
                    DistType::Plain => CircleRegion::plain(self.spec(), center, radius)?,
                    DistType::Sphere => CircleRegion::sphere(self.spec(), center, radius)?,
                };
                Ok(GeoCursor::Circle(GeoBrowse::new(
                    ctx,
                    self.tree(),
                    region,
                    predicate,
                )))
            }
            GeoQueryOp::WithinBox { min, max } => {
                let region = RectRegion::new(self.spec(), min, max)?;
                Ok(GeoCursor::Box(GeoBrowse::new(
                    ctx,
                    self.tree(),
                    region,
                    predicate,
                )))
            }
            GeoQueryOp::WithinPolygon { points } => {
                let region = PolygonRegion::new(self.spec(), points)?;
                Ok(GeoCursor::Polygon(GeoBrowse::new(
                    ctx,
                    self.tree(),
                    region,
                    predicate,
                )))
            }
        }
    }

    /// The `geoNear` command: up to `num` documents around `near`, sorted
    /// by exact distance, with scan statistics.
    ///
    /// Options: `near` (required), `num` (default 100), `query`,
    /// `maxDistance`, `spherical`, `distanceMultiplier`, `start` (textual
    /// hash override for the expansion seed).
    pub fn geo_near(&self, cmd: &Value) -> Result<Value> {
        let started = Instant::now();

        let near = cmd
            .get("near")
            .ok_or_else(|| GeodexError::BadQuery("'near' param missing/invalid".into()))?;
        let near_pt = point_from(near)?;

        let num_wanted = match cmd.get("num").and_then(Value::as_i64) {
            Some(n) if n < 0 => n.unsigned_abs() as usize,
            Some(0) | None => DEFAULT_NUM_WANTED,
            Some(n) => n as usize,
        };
        let max_distance = cmd
            .get("maxDistance")
            .and_then(Value::as_f64)
            .unwrap_or(f64::MAX);
        let dist_type = if cmd.get("spherical").and_then(Value::as_bool).unwrap_or(false) {
            DistType::Sphere
        } else {
            DistType::Plain
        };
        let distance_multiplier = cmd
            .get("distanceMultiplier")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        let filter = cmd.get("query").cloned().unwrap_or(Value::Null);
        let predicate = Predicate::compile(&filter, self.spec().geo_field());

        let mut search = GeoSearch::new(
            self.query_ctx(),
            self.tree(),
            near_pt,
            num_wanted,
            predicate,
            max_distance,
            dist_type,
        )?;
        if let Some(start) = cmd.get("start").and_then(Value::as_str) {
            search.set_start(GeoHash::parse(start)?);
        }
        let near_hash = self.spec().hash_point(&near_pt)?;
        search.exec()?;

        let btreelocs = search.btree_locs();
        let nscanned = search.keys_examined();
        let objects_loaded = search.objects_loaded();
        let farthest = search.farthest();
        let results = search.into_results();

        let mut total_distance = 0.0;
        let out: Vec<Value> = results
            .iter()
            .map(|p| {
                let dis = distance_multiplier * p.exact_distance.unwrap_or(0.0);
                total_distance += dis;
                json!({ "dis": dis, "obj": p.doc })
            })
            .collect();
        let avg_distance = if out.is_empty() {
            0.0
        } else {
            total_distance / out.len() as f64
        };

        Ok(json!({
            "near": near_hash.to_string(),
            "results": out,
            "stats": {
                "time": started.elapsed().as_millis() as u64,
                "btreelocs": btreelocs,
                "nscanned": nscanned,
                "objectsLoaded": objects_loaded,
                "avgDistance": avg_distance,
                "maxDistance": farthest,
            },
        }))
    }

    /// The `geoCluster` command: grid-cluster every match of a box query.
    ///
    /// Options: `box` (required), `query`, `gridSize` (default 5),
    /// `disableCluster`.
    pub fn geo_cluster(&self, cmd: &Value) -> Result<Value> {
        let started = Instant::now();

        let box_spec = cmd
            .get("box")
            .and_then(Value::as_array)
            .filter(|a| a.len() == 2)
            .ok_or_else(|| {
                GeodexError::BadQuery("'box' has to take an object or array".into())
            })?;
        let grid_size = cmd
            .get("gridSize")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_GRID_SIZE);
        let need_cluster = !cmd
            .get("disableCluster")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let filter = cmd.get("query").cloned().unwrap_or(Value::Null);
        let predicate = Predicate::compile(&filter, self.spec().geo_field());

        let region = RectRegion::new(
            self.spec(),
            point_from(&box_spec[0])?,
            point_from(&box_spec[1])?,
        )?;
        let want: GeoBox = *region.bounds();
        let mut browse = GeoBrowse::new(self.query_ctx(), self.tree(), region, predicate);

        let mut builder = ClusterBuilder::new(want, grid_size, need_cluster);
        if browse.ok()? {
            while let Some(p) = browse.current() {
                builder.add_document(self.spec(), &p.doc)?;
                if !browse.advance()? {
                    break;
                }
            }
        }
        let nscanned = browse.nscanned();

        let (clusters, markers) = builder.finish();
        let cluster_objs: Vec<Value> = clusters
            .iter()
            .map(|c| {
                json!({
                    "bounds": [
                        [c.bounds().min.x(), c.bounds().min.y()],
                        [c.bounds().max.x(), c.bounds().max.y()],
                    ],
                    "count": c.count,
                    "center": [c.center().x(), c.center().y()],
                })
            })
            .collect();
        let marker_objs: Vec<Value> = markers
            .iter()
            .map(|m| {
                json!({
                    "point": [m.point.x(), m.point.y()],
                    "obj": m.obj,
                })
            })
            .collect();

        Ok(json!({
            "clusters": cluster_objs,
            "markers": marker_objs,
            "stats": {
                "timems": started.elapsed().as_millis() as u64,
                "nscanned": nscanned,
            },
        }))
    }

    /// Debug walk over the raw index: logs up to `max` entries in key
    /// order and returns how many were visited.
    pub fn geo_walk(&self, max: usize) -> usize {
        let mut n = 0;
        for node in self.tree().iter().take(max) {
            tracing::info!(
                hash = %node.key.hash,
                word = format_args!("{:#018x}", node.key.hash.word()),
                loc = node.loc,
                "geo walk"
            );
            n += 1;
        }
        n
    }
}
