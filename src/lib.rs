//! Embedded 2D geospatial document index with journal-based crash
//! recovery.
//!
//! Documents carrying planar coordinate fields are indexed under a
//! bit-interleaved geohash key; the index answers proximity, containment
//! (circle, box, polygon), and map-clustering queries. A separate journal
//! subsystem replays durable group-commit sections into memory-mapped data
//! files after a crash.
//!
//! ```rust
//! use geodex::Collection;
//! use serde_json::json;
//!
//! # fn main() -> geodex::Result<()> {
//! let mut coll = Collection::with_pattern(&json!({"loc": "2d"}), &json!({}))?;
//! coll.insert(json!({"loc": [-74.0060, 40.7128], "name": "nyc"}))?;
//! coll.insert(json!({"loc": [-73.7781, 40.6413], "name": "jfk"}))?;
//!
//! let near = coll.geo_near(&json!({"near": [-74.0, 40.7], "num": 1}))?;
//! assert_eq!(near["results"][0]["obj"]["name"], "nyc");
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod browse;
pub mod cluster;
pub mod db;
pub mod error;
pub mod geohash;
pub mod geometry;
pub mod journal;
pub mod query;
pub mod search;
pub mod spec;
pub mod tree;
pub mod types;

pub use db::{Collection, DocStore, InterruptFlag};
pub use error::{GeodexError, Result};
pub use geohash::GeoHash;
pub use geometry::{DistType, GeoBox, GeoPolygon};
pub use journal::{recover, JournalEntry, JournalWriter, RecoveryJob};
pub use query::{GeoCursor, GeoQueryOp};
pub use search::{GeoHopper, GeoSearch};
pub use spec::{IndexKey, IndexSpec};
pub use tree::{GeoTree, KeyNode, RecordId};
pub use types::{Config, DurOptions};

pub use geo::Point;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
