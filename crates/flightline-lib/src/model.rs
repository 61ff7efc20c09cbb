//! Record types for the spatial tables
//!
//! One struct per stored table row. Geometries are `geo` types in projected
//! grid coordinates (meters); timestamps are naive local clock readings from
//! the device exports.

use chrono::NaiveDateTime;
use geo::{Coord, LineString, MultiLineString, MultiPolygon, Point};
use std::collections::BTreeMap;

/// Timestamp rendering used in stored columns and source keys
pub(crate) const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Sowing state reported by the bucket at a GPS reading
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketState {
    /// Bucket closed, machine in transit
    Closed = 0,
    /// Bucket open, bait flowing
    Open = 1,
}

impl BucketState {
    #[inline]
    pub fn is_open(self) -> bool {
        self == BucketState::Open
    }
}

impl From<i64> for BucketState {
    fn from(value: i64) -> Self {
        if value == 1 {
            BucketState::Open
        } else {
            BucketState::Closed
        }
    }
}

impl From<BucketState> for i64 {
    fn from(value: BucketState) -> Self {
        value as i64
    }
}

/// One GPS reading from a machine's track
#[derive(Clone, Debug, PartialEq)]
pub struct TrackPoint {
    /// Store row id, `None` until inserted
    pub id: Option<i64>,
    /// Source key `"{date_time}|{speed}"`, unique per machine within a batch
    pub src_id: String,
    pub date_time: NaiveDateTime,
    /// Ground speed in knots as reported by the device
    pub speed: f64,
    pub heading: f64,
    pub altitude: f64,
    /// Swath width in meters (already translated at ingest)
    pub width: f64,
    pub machine_code: String,
    pub bucket_size: i64,
    /// Load assignment, `None` until segmentation has run
    pub load_number: Option<i64>,
    pub batch_id: String,
    pub bucket_state: BucketState,
    pub geom: Point<f64>,
}

impl TrackPoint {
    #[inline]
    pub fn coord(&self) -> Coord<f64> {
        self.geom.0
    }
}

/// A derived coverage row, generic over the pass geometry
///
/// The detailed pass emits [`LineString`]s, the merge pass
/// [`MultiLineString`]s and the buffer pass [`MultiPolygon`]s; everything
/// else about the row is shared.
#[derive(Clone, Debug, PartialEq)]
pub struct CoverageSegment<G> {
    pub src_id: String,
    pub date_time: NaiveDateTime,
    /// Derived speed figure (`seconds * distance * 1.94384`), not the GPS speed
    pub speed: f64,
    pub heading: f64,
    pub altitude: f64,
    pub width: f64,
    pub machine_code: String,
    pub bucket_size: i64,
    pub load_number: i64,
    pub batch_id: String,
    pub bucket_state: BucketState,
    /// kg/ha over the segment
    pub coverage_rate: f64,
    pub hectares: f64,
    /// Planar length in meters
    pub distance: f64,
    /// Elapsed seconds attributed to the segment
    pub seconds: f64,
    /// Sowing run index within the load
    pub line_number: i64,
    pub geom: G,
}

pub type DetailedSegment = CoverageSegment<LineString<f64>>;
pub type MergedLine = CoverageSegment<MultiLineString<f64>>;
pub type BufferedSwath = CoverageSegment<MultiPolygon<f64>>;

/// One merged non-sowing leg of a load
#[derive(Clone, Debug, PartialEq)]
pub struct FlightPathRow {
    pub machine_code: String,
    pub load_number: i64,
    pub batch_id: String,
    /// Transit leg index within the load
    pub line_number: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub geom: MultiLineString<f64>,
}

/// Per-load summary row, one per machine and load
#[derive(Clone, Debug, PartialEq)]
pub struct LoadSummary {
    pub machine_code: String,
    pub batch_id: String,
    pub load_number: i64,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub bucket_size: i64,
    pub sum_hectares: f64,
    pub coverage_rate: f64,
    pub average_speed: f64,
    /// Total seconds spent sowing the load
    pub runout_time: f64,
    pub distance_spreading: f64,
    /// Raw-data folder the batch was staged from
    pub dir_location: String,
    pub target_speed: f64,
}

/// Machine registry row
#[derive(Clone, Debug, PartialEq)]
pub struct Machine {
    pub machine_code: String,
    pub company: Option<String>,
    pub pilot: Option<String>,
    pub default_bucket_size: i64,
    /// Intended sow rate in kg/ha
    pub target_sow_rate: f64,
    /// Reported width -> actual swath width, keyed by the width's string rendering
    pub swath_translation: BTreeMap<String, f64>,
    pub active: bool,
}

impl Machine {
    /// Translate a reported width through the swath map
    ///
    /// Widths are matched by their string rendering (integer-valued widths
    /// render without a decimal point); unmapped widths pass through.
    pub fn translate_width(&self, width: f64) -> f64 {
        *self
            .swath_translation
            .get(&render_width(width))
            .unwrap_or(&width)
    }
}

/// Render a width the way swath maps key it: `120` rather than `120.0`
pub(crate) fn render_width(width: f64) -> String {
    if width.fract() == 0.0 {
        format!("{}", width as i64)
    } else {
        format!("{width}")
    }
}

/// Load-site polygon with its altitude trigger
#[derive(Clone, Debug, PartialEq)]
pub struct LoadSite {
    pub name: String,
    pub active: bool,
    /// Altitude at or below which a machine inside the polygon counts as at
    /// the site; `None` falls back to the project ceiling
    pub elevation_trigger: Option<f64>,
    pub geom: MultiPolygon<f64>,
}
