//! Coverage line builders
//!
//! Three passes over one machine and load: the detailed pass turns every
//! sowing point into a short midpoint-to-midpoint segment with derived rate
//! metrics, the merge pass folds contiguous segments of one sowing run into a
//! single line, and the buffer pass expands merged lines into swath polygons.
//!
//! The coverage rate assumes the bucket discharges evenly per active second:
//! `bucket_kg / active_seconds = kg/s`, `distance * width / 10000 = ha`, and
//! the per-segment rate is `kg/s / ha`.

use crate::geometry;
use crate::model::{
    BucketState, BufferedSwath, CoverageSegment, DetailedSegment, MergedLine, TrackPoint,
    render_width,
};
use crate::{DataError, Result};
use chrono::NaiveDateTime;
use geo::{LineString, MultiLineString};
use std::collections::{BTreeMap, BTreeSet};

/// Knots per meter-per-second
pub(crate) const MS_TO_KNOTS: f64 = 1.94384;

/// Product of the three coverage passes for one load
#[derive(Clone, Debug)]
pub struct CoverageBuild {
    pub detailed: Vec<DetailedSegment>,
    pub merged: Vec<MergedLine>,
    pub buffered: Vec<BufferedSwath>,
}

impl CoverageBuild {
    /// Total sown hectares across the merged lines
    pub fn hectares(&self) -> f64 {
        self.merged.iter().map(|line| line.hectares).sum()
    }
}

/// Run all three passes; `None` when the load has no sowing points
pub fn build_coverage(
    points: &[TrackPoint],
    swath_translation: &BTreeMap<String, f64>,
) -> Result<Option<CoverageBuild>> {
    let Some(detailed) = build_detailed_segments(points)? else {
        return Ok(None);
    };
    let merged = merge_detailed_segments(&detailed)?;
    let buffered = buffer_merged_lines(&merged, swath_translation);
    Ok(Some(CoverageBuild {
        detailed,
        merged,
        buffered,
    }))
}

fn elapsed_seconds(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Segment geometry for the point at `index`: first and last points take the
/// half-segment to their single neighbor, interior points the line through
/// both neighbor midpoints. Neighbors come from the full point list, sowing
/// or not.
pub(crate) fn midpoint_line(points: &[TrackPoint], index: usize) -> LineString<f64> {
    let last = points.len() - 1;
    if index == 0 {
        let mid = geometry::midpoint(points[0].coord(), points[1].coord());
        LineString(vec![points[0].coord(), mid])
    } else if index == last {
        let mid = geometry::midpoint(points[last - 1].coord(), points[last].coord());
        LineString(vec![mid, points[last].coord()])
    } else {
        let before = geometry::midpoint(points[index - 1].coord(), points[index].coord());
        let after = geometry::midpoint(points[index].coord(), points[index + 1].coord());
        LineString(vec![before, points[index].coord(), after])
    }
}

/// Elapsed seconds attributed to the point at `index`: half the time delta
/// between its neighbors, and half the single-neighbor delta at the ends
pub(crate) fn midpoint_seconds(points: &[TrackPoint], index: usize) -> f64 {
    let last = points.len() - 1;
    if index == 0 {
        elapsed_seconds(points[0].date_time, points[1].date_time) / 2.0
    } else if index == last {
        elapsed_seconds(points[last - 1].date_time, points[last].date_time) / 2.0
    } else {
        elapsed_seconds(points[index - 1].date_time, points[index + 1].date_time) / 2.0
    }
}

/// Detailed pass: one segment per sowing point
///
/// `points` is the complete time-ordered track of one machine and load.
/// Returns `None` when no point has the bucket open (nothing to build, not
/// an error). A load that does sow but has fewer than two points cannot
/// carry segment geometry and is rejected as degenerate rather than dropped.
pub fn build_detailed_segments(points: &[TrackPoint]) -> Result<Option<Vec<DetailedSegment>>> {
    let active_count = points
        .iter()
        .filter(|p| p.bucket_state.is_open())
        .count();
    if active_count == 0 {
        return Ok(None);
    }
    if points.len() < 2 {
        let first = &points[0];
        return Err(DataError::DegenerateLoad {
            machine: first.machine_code.clone(),
            load: first.load_number.unwrap_or(0),
            points: points.len(),
        });
    }

    let bucket_size = points[0].bucket_size;
    let load_kg_second = bucket_size as f64 / active_count as f64;

    let mut segments = Vec::with_capacity(active_count);
    let mut line_number: i64 = 0;
    let mut previous_state = points[0].bucket_state;

    for (index, point) in points.iter().enumerate() {
        if !point.bucket_state.is_open() {
            previous_state = point.bucket_state;
            continue;
        }
        if previous_state == BucketState::Closed {
            line_number += 1;
        }
        previous_state = point.bucket_state;

        let geom = midpoint_line(points, index);
        let seconds = midpoint_seconds(points, index);
        let distance = geometry::line_length(&geom);
        let hectares = distance * point.width / 10_000.0;
        let coverage_rate = if hectares > 0.0 {
            load_kg_second / hectares
        } else {
            tracing::warn!(
                src_id = %point.src_id,
                "zero-length sowing segment, coverage rate set to 0"
            );
            0.0
        };
        let speed = seconds * distance * MS_TO_KNOTS;

        segments.push(CoverageSegment {
            src_id: point.src_id.clone(),
            date_time: point.date_time,
            speed,
            heading: point.heading,
            altitude: point.altitude,
            width: point.width,
            machine_code: point.machine_code.clone(),
            bucket_size,
            load_number: point.load_number.unwrap_or(0),
            batch_id: point.batch_id.clone(),
            bucket_state: point.bucket_state,
            coverage_rate,
            hectares,
            distance,
            seconds,
            line_number,
            geom,
        });
    }

    Ok(Some(segments))
}

/// Accumulates one sowing run during the merge pass
struct RunAccumulator {
    first: DetailedSegment,
    geoms: Vec<LineString<f64>>,
    distance: f64,
    hectares: f64,
    seconds: f64,
    speeds: Vec<f64>,
    altitudes: Vec<f64>,
    coverage_rates: Vec<f64>,
}

impl RunAccumulator {
    fn start(segment: &DetailedSegment) -> Self {
        RunAccumulator {
            first: segment.clone(),
            geoms: vec![segment.geom.clone()],
            distance: segment.distance,
            hectares: segment.hectares,
            seconds: segment.seconds,
            speeds: vec![segment.speed],
            altitudes: vec![segment.altitude],
            coverage_rates: vec![segment.coverage_rate],
        }
    }

    fn push(&mut self, segment: &DetailedSegment) {
        self.geoms.push(segment.geom.clone());
        self.distance += segment.distance;
        self.hectares += segment.hectares;
        self.seconds += segment.seconds;
        self.speeds.push(segment.speed);
        self.altitudes.push(segment.altitude);
        self.coverage_rates.push(segment.coverage_rate);
    }

    fn finish(self) -> MergedLine {
        let count = self.speeds.len() as f64;
        CoverageSegment {
            src_id: self.first.src_id,
            date_time: self.first.date_time,
            speed: self.speeds.iter().sum::<f64>() / count,
            heading: self.first.heading,
            altitude: self.altitudes.iter().sum::<f64>() / count,
            width: self.first.width,
            machine_code: self.first.machine_code,
            bucket_size: self.first.bucket_size,
            load_number: self.first.load_number,
            batch_id: self.first.batch_id,
            bucket_state: BucketState::Open,
            coverage_rate: self.coverage_rates.iter().sum::<f64>() / count,
            hectares: self.hectares,
            distance: self.distance,
            seconds: self.seconds,
            line_number: self.first.line_number,
            geom: MultiLineString(self.geoms),
        }
    }
}

/// Merge pass: one line per sowing run
///
/// Emits a run whenever the line number changes and flushes the final run at
/// the end, so trailing single-segment runs always survive. Distance,
/// hectares and seconds are summed over the run; speed, altitude and
/// coverage rate are averaged; identity columns come from the run's first
/// segment.
pub fn merge_detailed_segments(segments: &[DetailedSegment]) -> Result<Vec<MergedLine>> {
    let mut merged = Vec::new();
    let mut current: Option<RunAccumulator> = None;

    for segment in segments {
        match current.as_mut() {
            Some(run) if run.first.line_number == segment.line_number => run.push(segment),
            Some(_) => {
                if let Some(run) = current.take() {
                    merged.push(run.finish());
                }
                current = Some(RunAccumulator::start(segment));
            }
            None => current = Some(RunAccumulator::start(segment)),
        }
    }
    if let Some(run) = current.take() {
        merged.push(run.finish());
    }

    let distinct: BTreeSet<i64> = segments.iter().map(|s| s.line_number).collect();
    if merged.len() != distinct.len() {
        return Err(DataError::DataIntegrityViolation {
            reason: format!(
                "merged {} runs from {} distinct line numbers",
                merged.len(),
                distinct.len()
            ),
        });
    }

    Ok(merged)
}

/// Buffer pass: expand each merged line into a swath polygon
///
/// The stored width is translated through the machine's swath map (exact
/// string match on the width's rendering, untranslated widths pass through)
/// and the line buffered by half the translated width with flat caps and
/// mitered joins. Attributes carry over with `width` set to the translated
/// value and the bucket state forced open.
pub fn buffer_merged_lines(
    lines: &[MergedLine],
    swath_translation: &BTreeMap<String, f64>,
) -> Vec<BufferedSwath> {
    lines
        .iter()
        .map(|line| {
            let width = *swath_translation
                .get(&render_width(line.width))
                .unwrap_or(&line.width);
            CoverageSegment {
                src_id: line.src_id.clone(),
                date_time: line.date_time,
                speed: line.speed,
                heading: line.heading,
                altitude: line.altitude,
                width,
                machine_code: line.machine_code.clone(),
                bucket_size: line.bucket_size,
                load_number: line.load_number,
                batch_id: line.batch_id.clone(),
                bucket_state: BucketState::Open,
                coverage_rate: line.coverage_rate,
                hectares: line.hectares,
                distance: line.distance,
                seconds: line.seconds,
                line_number: line.line_number,
                geom: geometry::buffer_line(&line.geom, width / 2.0),
            }
        })
        .collect()
}
