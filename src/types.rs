//! Configuration types.

use serde::{Deserialize, Serialize};

/// Recovery behavior switches, the moral equivalent of startup
/// `--durOptions` flags.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DurOptions {
    /// Parse and verify every journal file but apply nothing; recovery
    /// then fails on purpose so the operator sees the scan result.
    #[serde(default)]
    pub scan_only: bool,

    /// Log every journal entry while replaying.
    #[serde(default)]
    pub dump_journal: bool,
}

/// Engine configuration, loadable from JSON.
///
/// ```rust
/// use geodex::Config;
///
/// let config: Config = serde_json::from_str(r#"{
///     "geohash_bits": 26,
///     "dur": { "scan_only": false }
/// }"#).unwrap();
/// assert_eq!(config.geohash_bits, 26);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Geohash precision per axis for spatial indexing (1-32).
    #[serde(default = "Config::default_geohash_bits")]
    pub geohash_bits: u8,

    /// Lower bound of the coordinate interval (inclusive).
    #[serde(default = "Config::default_min")]
    pub min: f64,

    /// Upper bound of the coordinate interval (exclusive).
    #[serde(default = "Config::default_max")]
    pub max: f64,

    /// Recovery switches.
    #[serde(default)]
    pub dur: DurOptions,
}

impl Config {
    const fn default_geohash_bits() -> u8 {
        26
    }

    const fn default_min() -> f64 {
        -180.0
    }

    const fn default_max() -> f64 {
        180.0
    }

    /// Index options document derived from this configuration, as accepted
    /// by [`crate::IndexSpec::parse`].
    pub fn index_options(&self) -> serde_json::Value {
        serde_json::json!({
            "bits": self.geohash_bits,
            "min": self.min,
            "max": self.max,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            geohash_bits: Self::default_geohash_bits(),
            min: Self::default_min(),
            max: Self::default_max(),
            dur: DurOptions::default(),
        }
    }
}
