//! Device export readers and raw-data staging
//!
//! Flight recorders export a batch as a folder of JSON files plus a
//! `summary.txt`: `secondary.json` always exists and its record shape tells
//! the formats apart, `log.json` carries the sowing lines for recorders
//! that only log runs as line geometry. Batches are staged under
//! `raw_data/{machine}/{op_day}_{download_time}` and identified by
//! `{machine}_{op_day}_{download_time}`.
//!
//! # Architecture
//!
//! - [`classify_source`] sniffs the export format from field presence.
//! - [`TrackReader`] turns an export folder into `src_id -> TrackPoint`,
//!   projecting coordinates and translating swath widths on the way in.
//! - [`BatchFolder`] owns the staging side: destination naming, download
//!   time bumping, copying and archival.

use crate::coverage::MS_TO_KNOTS;
use crate::geometry;
use crate::model::{render_width, BucketState, TrackPoint, DATE_TIME_FORMAT};
use crate::projection::TransverseMercator;
use crate::{DataError, Result};
use chrono::{DateTime, Duration, NaiveDateTime};
use geo::{LineString, MultiPolygon, Point, Polygon};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Export formats the readers understand
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Sowing runs as lines in `log.json`, 1-second transit points in
    /// `secondary.json`
    TracmapLines,
    /// Every point in `secondary.json` with a boom state
    TracmapPoints,
    /// Tablet export: points with boom state plus target/actual rates
    TabulaPoints,
    Unrecognized,
}

/// Sniff the export format from the first `secondary.json` record's fields
pub fn classify_source(folder: &Path) -> Result<SourceKind> {
    let secondary = folder.join("secondary.json");
    if !secondary.exists() {
        return Ok(SourceKind::Unrecognized);
    }
    let records: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&secondary)?)?;
    let Some(first) = records.first().and_then(|value| value.as_object()) else {
        return Ok(SourceKind::Unrecognized);
    };

    let has_all = |keys: &[&str]| keys.iter().all(|key| first.contains_key(*key));
    let kind = if has_all(&[
        "date",
        "time",
        "lat",
        "lon",
        "speed",
        "heading",
        "gps_alt",
        "boom_state",
        "target_rate",
        "actual_rate",
        "width",
    ]) {
        SourceKind::TabulaPoints
    } else if has_all(&["date", "time", "speed", "heading", "gps_alt", "boom_state"]) {
        SourceKind::TracmapPoints
    } else if has_all(&["time", "speed", "heading", "gps_alt"]) {
        SourceKind::TracmapLines
    } else {
        SourceKind::Unrecognized
    };
    Ok(kind)
}

/// Point record shared by the tablet and point-logging recorder exports
#[derive(Debug, Deserialize)]
struct PointRecord {
    date: String,
    time: String,
    lon: f64,
    lat: f64,
    speed: f64,
    heading: f64,
    gps_alt: f64,
    boom_state: i64,
    width: f64,
}

/// One sowing run from `log.json`: line geometry in lon/lat parts
#[derive(Debug, Deserialize)]
struct LineRecord {
    time: String,
    speed: f64,
    width: f64,
    gps_alt: f64,
    coordinates: Vec<Vec<[f64; 2]>>,
}

/// One transit point from a line-logging recorder's `secondary.json`
#[derive(Debug, Deserialize)]
struct TransitRecord {
    time: String,
    speed: f64,
    heading: f64,
    width: f64,
    gps_alt: f64,
    lon: f64,
    lat: f64,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

/// Parse an export timestamp, with or without a UTC offset; offsets keep
/// the recorded wall time
fn parse_export_time(value: &str) -> Result<NaiveDateTime> {
    match DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z") {
        Ok(with_offset) => Ok(with_offset.naive_local()),
        Err(_) => Ok(NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")?),
    }
}

fn src_id(date_time: NaiveDateTime, speed: f64) -> String {
    format!("{}|{}", date_time.format(DATE_TIME_FORMAT), speed)
}

/// `summary.txt` metadata as `key: value` pairs
pub fn summary_metadata(folder: &Path) -> Result<BTreeMap<String, String>> {
    let path = folder.join("summary.txt");
    let mut metadata = BTreeMap::new();
    if !path.exists() {
        return Ok(metadata);
    }
    for line in std::fs::read_to_string(&path)?.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if !key.trim().is_empty() {
                metadata.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    Ok(metadata)
}

/// Reads one staged export folder into track points
pub struct TrackReader {
    kind: SourceKind,
    machine_code: String,
    batch_id: String,
    bucket_size: i64,
    swath_translation: BTreeMap<String, f64>,
    projection: TransverseMercator,
}

impl TrackReader {
    pub fn new(
        kind: SourceKind,
        machine_code: &str,
        batch_id: &str,
        bucket_size: i64,
        swath_translation: BTreeMap<String, f64>,
    ) -> Self {
        TrackReader {
            kind,
            machine_code: machine_code.to_string(),
            batch_id: batch_id.to_string(),
            bucket_size,
            swath_translation,
            projection: TransverseMercator::nztm2000(),
        }
    }

    fn translate_width(&self, width: f64) -> f64 {
        *self
            .swath_translation
            .get(&render_width(width))
            .unwrap_or(&width)
    }

    fn track_point(
        &self,
        date_time: NaiveDateTime,
        speed: f64,
        heading: f64,
        altitude: f64,
        width: f64,
        bucket_state: BucketState,
        geom: Point<f64>,
    ) -> TrackPoint {
        TrackPoint {
            id: None,
            src_id: src_id(date_time, speed),
            date_time,
            speed,
            heading,
            altitude,
            width: self.translate_width(width),
            machine_code: self.machine_code.clone(),
            bucket_size: self.bucket_size,
            load_number: None,
            batch_id: self.batch_id.clone(),
            bucket_state,
            geom,
        }
    }

    /// Read every record of a staged export folder
    ///
    /// # Returns
    ///
    /// Points keyed by `src_id`; a repeated key keeps the last record.
    pub fn read_folder(&self, folder: &Path) -> Result<BTreeMap<String, TrackPoint>> {
        let points = match self.kind {
            SourceKind::TracmapLines => self.read_lines_export(folder)?,
            SourceKind::TracmapPoints | SourceKind::TabulaPoints => {
                self.read_points_export(folder)?
            }
            SourceKind::Unrecognized => {
                return Err(DataError::UnrecognizedSource(folder.to_path_buf()));
            }
        };
        let metadata = summary_metadata(folder)?;
        tracing::info!(
            folder = %folder.display(),
            points = points.len(),
            metadata_keys = metadata.len(),
            "read export folder"
        );
        for (key, value) in &metadata {
            tracing::debug!(key, value, "summary metadata");
        }
        Ok(points)
    }

    fn read_points_export(&self, folder: &Path) -> Result<BTreeMap<String, TrackPoint>> {
        let mut points = BTreeMap::new();
        let records: Vec<PointRecord> = read_json(&folder.join("secondary.json"))?;
        for record in records {
            let date_time = parse_export_time(&format!("{}T{}", record.date, record.time))?;
            let geom = Point(self.projection.project(record.lon, record.lat));
            let point = self.track_point(
                date_time,
                record.speed,
                record.heading,
                record.gps_alt,
                record.width,
                BucketState::from(record.boom_state),
                geom,
            );
            points.insert(point.src_id.clone(), point);
        }
        Ok(points)
    }

    /// Line-logging recorders: vertices of each sowing line become Open
    /// points with the time interpolated along the line at the recorded
    /// speed; vertices closer than a second are folded into the next one.
    fn read_lines_export(&self, folder: &Path) -> Result<BTreeMap<String, TrackPoint>> {
        let mut points = BTreeMap::new();

        let lines: Vec<LineRecord> = read_json(&folder.join("log.json"))?;
        for record in &lines {
            if record.speed <= 0.0 {
                tracing::warn!(time = %record.time, "sowing line without a usable speed, skipped");
                continue;
            }
            let meters_per_second = record.speed / MS_TO_KNOTS;
            let mut tracker = parse_export_time(&record.time)?;

            for part in &record.coordinates {
                let Some(first) = part.first() else {
                    continue;
                };
                let mut anchor = self.projection.project(first[0], first[1]);
                let point = self.track_point(
                    tracker,
                    record.speed,
                    0.0,
                    record.gps_alt,
                    record.width,
                    BucketState::Open,
                    Point(anchor),
                );
                points.insert(point.src_id.clone(), point);

                for vertex in &part[1..] {
                    let coord = self.projection.project(vertex[0], vertex[1]);
                    let seconds = geometry::distance(anchor, coord) / meters_per_second;
                    if seconds.round() == 0.0 {
                        continue;
                    }
                    tracker += Duration::milliseconds((seconds * 1000.0).round() as i64);
                    let point = self.track_point(
                        tracker,
                        record.speed,
                        0.0,
                        record.gps_alt,
                        record.width,
                        BucketState::Open,
                        Point(coord),
                    );
                    points.insert(point.src_id.clone(), point);
                    anchor = coord;
                }
            }
        }

        let transit: Vec<TransitRecord> = read_json(&folder.join("secondary.json"))?;
        for record in transit {
            let date_time = parse_export_time(&record.time)?;
            let geom = Point(self.projection.project(record.lon, record.lat));
            let point = self.track_point(
                date_time,
                record.speed,
                record.heading,
                record.gps_alt,
                record.width,
                BucketState::Closed,
                geom,
            );
            points.insert(point.src_id.clone(), point);
        }

        Ok(points)
    }
}

/// A staged (or to-be-staged) raw-data batch folder
#[derive(Clone, Debug)]
pub struct BatchFolder {
    raw_data: PathBuf,
    machine_code: String,
    op_day: String,
    download_time: String,
}

impl BatchFolder {
    /// `op_day` is `ddmmyyyy`, `download_time` is `HHMM`; machine codes are
    /// uppercased for folder names
    pub fn new(raw_data: &Path, machine_code: &str, op_day: &str, download_time: &str) -> Self {
        BatchFolder {
            raw_data: raw_data.to_path_buf(),
            machine_code: machine_code.to_uppercase(),
            op_day: op_day.to_string(),
            download_time: download_time.to_string(),
        }
    }

    #[inline]
    pub fn machine_code(&self) -> &str {
        &self.machine_code
    }

    #[inline]
    pub fn download_time(&self) -> &str {
        &self.download_time
    }

    pub fn batch_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.machine_code, self.op_day, self.download_time
        )
    }

    pub fn folder(&self) -> PathBuf {
        self.raw_data
            .join(&self.machine_code)
            .join(format!("{}_{}", self.op_day, self.download_time))
    }

    /// Advance the download time minute by minute until the destination
    /// folder name is free, up to 60 attempts
    pub fn bump_until_free(&mut self) -> Result<()> {
        let machine_folder = self.raw_data.join(&self.machine_code);
        if !machine_folder.exists() {
            std::fs::create_dir_all(&machine_folder)?;
        }
        for _ in 0..60 {
            if !self.folder().exists() {
                return Ok(());
            }
            let minutes: u32 = self.download_time.parse().unwrap_or(0);
            self.download_time = format!("{:04}", minutes + 1);
        }
        Err(DataError::DestinationExists(self.folder()))
    }

    /// Copy the device export into the staging folder
    pub fn stage_from(&self, source: &Path) -> Result<()> {
        if !source.exists() {
            return Err(DataError::SourceMissing(source.to_path_buf()));
        }
        let destination = self.folder();
        if destination.exists() {
            return Err(DataError::DestinationExists(destination));
        }
        copy_dir_recursive(source, &destination)?;
        tracing::info!(
            source = %source.display(),
            destination = %destination.display(),
            "staged batch"
        );
        Ok(())
    }
}

fn copy_dir_recursive(source: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rename a batch's staged folder to `deleted_{op_day}_{download_time}`
///
/// # Returns
///
/// The archive path, or `None` when the folder is already gone (the rows
/// may outlive the folder; that is not an error).
pub fn archive_batch(raw_data: &Path, batch_id: &str) -> Result<Option<PathBuf>> {
    let mut parts = batch_id.split('_');
    let (Some(machine), Some(day), Some(time)) = (parts.next(), parts.next(), parts.next()) else {
        tracing::warn!(batch_id, "malformed batch id, nothing archived");
        return Ok(None);
    };
    let folder_name = format!("{day}_{time}");
    let source = raw_data.join(machine).join(&folder_name);
    if !source.exists() {
        tracing::warn!(folder = %source.display(), "batch folder not found, nothing archived");
        return Ok(None);
    }
    let destination = raw_data.join(machine).join(format!("deleted_{folder_name}"));
    std::fs::rename(&source, &destination)?;
    tracing::info!(folder = %destination.display(), "archived batch folder");
    Ok(Some(destination))
}

/// Walk a device tree for folders holding a non-empty export
pub fn valid_source_folders(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk_exports(root, &mut found)?;
    found.sort();
    Ok(found)
}

fn walk_exports(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let secondary = dir.join("secondary.json");
    if secondary.exists() {
        match std::fs::read_to_string(&secondary)
            .ok()
            .and_then(|text| serde_json::from_str::<Vec<serde_json::Value>>(&text).ok())
        {
            Some(records) if !records.is_empty() => found.push(dir.to_path_buf()),
            _ => tracing::debug!(folder = %dir.display(), "export without records, skipped"),
        }
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            walk_exports(&entry.path(), found)?;
        }
    }
    Ok(())
}

/// GeoJSON-ish polygon input for load site registration: a bare geometry,
/// a feature or a feature collection (first feature wins)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SiteFile {
    Collection { features: Vec<SiteFeature> },
    Feature { geometry: SiteGeometry },
    Geometry(SiteGeometry),
}

#[derive(Debug, Deserialize)]
struct SiteFeature {
    geometry: SiteGeometry,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SiteGeometry {
    Polygon { coordinates: Vec<Vec<[f64; 2]>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<[f64; 2]>>> },
}

/// Read a load site polygon file and project it onto the grid
///
/// Coordinates are WGS84 longitude/latitude as devices and mapping tools
/// export them; the stored geometry is in grid meters like every other
/// layer.
pub fn read_site_polygon(path: &Path) -> Result<MultiPolygon<f64>> {
    if !path.exists() {
        return Err(DataError::SourceMissing(path.to_path_buf()));
    }
    let file: SiteFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let geometry = match file {
        SiteFile::Collection { features } => match features.into_iter().next() {
            Some(feature) => feature.geometry,
            None => {
                return Err(DataError::DataIntegrityViolation {
                    reason: format!("no features in site file {}", path.display()),
                });
            }
        },
        SiteFile::Feature { geometry } => geometry,
        SiteFile::Geometry(geometry) => geometry,
    };
    let projection = TransverseMercator::nztm2000();
    let project_ring = |ring: Vec<[f64; 2]>| {
        LineString::from(
            ring.iter()
                .map(|&[lon, lat]| projection.project(lon, lat))
                .collect::<Vec<_>>(),
        )
    };
    let project_polygon = |rings: Vec<Vec<[f64; 2]>>| {
        let mut rings = rings.into_iter();
        let exterior = rings
            .next()
            .map(&project_ring)
            .unwrap_or_else(|| LineString::new(Vec::new()));
        Polygon::new(exterior, rings.map(&project_ring).collect())
    };
    let polygons = match geometry {
        SiteGeometry::Polygon { coordinates } => vec![project_polygon(coordinates)],
        SiteGeometry::MultiPolygon { coordinates } => {
            coordinates.into_iter().map(project_polygon).collect()
        }
    };
    Ok(MultiPolygon(polygons))
}
