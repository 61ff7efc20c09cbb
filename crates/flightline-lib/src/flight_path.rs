//! Flight path builder
//!
//! The complement of the coverage passes: where coverage lines trace the
//! sowing runs, flight path lines trace the transit legs flown with the
//! bucket closed. Ferry flights to and from the load site and the turns
//! between runs end up here, numbered so they interleave with the coverage
//! line numbers of the same load.

use crate::coverage::midpoint_line;
use crate::model::{BucketState, FlightPathRow, TrackPoint};
use crate::{DataError, Result};
use chrono::NaiveDateTime;
use geo::{LineString, MultiLineString};

struct FlightLine {
    start_time: NaiveDateTime,
    end_time: Option<NaiveDateTime>,
    geoms: Vec<LineString<f64>>,
}

/// Build the transit lines for one machine and load
///
/// `points` is the complete time-ordered track of the load. Line 0 is
/// anchored at the load's first point; a new line opens every time the
/// bucket closes after sowing. Lines that never receive a transit point are
/// dropped, so a load that starts sowing immediately has no line 0.
///
/// # Returns
///
/// One row per transit leg, ascending by line number. Empty when the load
/// has no transit points.
pub fn build_flight_path_rows(points: &[TrackPoint]) -> Result<Vec<FlightPathRow>> {
    if points.is_empty() {
        return Ok(Vec::new());
    }
    let has_transit = points.iter().any(|p| !p.bucket_state.is_open());
    if has_transit && points.len() < 2 {
        let first = &points[0];
        return Err(DataError::DegenerateLoad {
            machine: first.machine_code.clone(),
            load: first.load_number.unwrap_or(0),
            points: points.len(),
        });
    }

    let first = &points[0];
    let mut lines = vec![FlightLine {
        start_time: first.date_time,
        end_time: None,
        geoms: Vec::new(),
    }];
    let mut previous_state = first.bucket_state;

    for (index, point) in points.iter().enumerate() {
        if point.bucket_state.is_open() {
            previous_state = point.bucket_state;
            continue;
        }
        if previous_state == BucketState::Open {
            lines.push(FlightLine {
                start_time: point.date_time,
                end_time: Some(point.date_time),
                geoms: Vec::new(),
            });
        }
        previous_state = point.bucket_state;
        if let Some(line) = lines.last_mut() {
            line.geoms.push(midpoint_line(points, index));
            line.end_time = Some(point.date_time);
        }
    }

    let rows = lines
        .into_iter()
        .enumerate()
        .filter_map(|(line_number, line)| {
            if line.geoms.is_empty() {
                return None;
            }
            Some(FlightPathRow {
                machine_code: first.machine_code.clone(),
                load_number: first.load_number.unwrap_or(0),
                batch_id: first.batch_id.clone(),
                line_number: line_number as i64,
                start_time: line.start_time,
                end_time: line.end_time.unwrap_or(line.start_time),
                geom: MultiLineString(line.geoms),
            })
        })
        .collect();

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use geo::{Coord, Point};

    fn base_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 11, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn create_test_point(seconds: i64, x: f64, bucket: i64) -> TrackPoint {
        TrackPoint {
            id: Some(seconds),
            src_id: format!("src_{seconds}"),
            date_time: base_time() + Duration::seconds(seconds),
            speed: 55.0,
            heading: 90.0,
            altitude: 150.0,
            width: 100.0,
            machine_code: "PBX".to_string(),
            bucket_size: 600,
            load_number: Some(1),
            batch_id: "PBX_02112023_0930".to_string(),
            bucket_state: BucketState::from(bucket),
            geom: Point::new(x, 0.0),
        }
    }

    #[test]
    fn test_transit_legs_before_and_after_sowing() {
        let points = vec![
            create_test_point(0, 0.0, 0),
            create_test_point(1, 10.0, 0),
            create_test_point(2, 20.0, 1),
            create_test_point(3, 30.0, 1),
            create_test_point(4, 40.0, 0),
            create_test_point(5, 50.0, 0),
        ];
        let rows = build_flight_path_rows(&points).unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].line_number, 0);
        assert_eq!(rows[0].start_time, base_time());
        assert_eq!(rows[0].end_time, base_time() + Duration::seconds(1));
        assert_eq!(rows[0].geom.0.len(), 2);
        assert_eq!(
            rows[0].geom.0[0].0,
            vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 5.0, y: 0.0 }]
        );

        assert_eq!(rows[1].line_number, 1);
        assert_eq!(rows[1].start_time, base_time() + Duration::seconds(4));
        assert_eq!(rows[1].end_time, base_time() + Duration::seconds(5));
        assert_eq!(rows[1].geom.0.len(), 2);

        assert_eq!(rows[0].machine_code, "PBX");
        assert_eq!(rows[0].load_number, 1);
        assert_eq!(rows[0].batch_id, "PBX_02112023_0930");
    }

    #[test]
    fn test_immediate_sowing_skips_line_zero() {
        let points = vec![
            create_test_point(0, 0.0, 1),
            create_test_point(1, 10.0, 1),
            create_test_point(2, 20.0, 0),
            create_test_point(3, 30.0, 0),
        ];
        let rows = build_flight_path_rows(&points).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].line_number, 1);
        assert_eq!(rows[0].start_time, base_time() + Duration::seconds(2));
    }

    #[test]
    fn test_all_sowing_yields_no_rows() {
        let points = vec![create_test_point(0, 0.0, 1), create_test_point(1, 10.0, 1)];
        assert!(build_flight_path_rows(&points).unwrap().is_empty());
    }

    #[test]
    fn test_empty_input_yields_no_rows() {
        assert!(build_flight_path_rows(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_single_transit_point_is_degenerate() {
        let points = vec![create_test_point(0, 0.0, 0)];
        let result = build_flight_path_rows(&points);
        assert!(matches!(
            result,
            Err(DataError::DegenerateLoad { points: 1, .. })
        ));
    }

    #[test]
    fn test_alternating_buckets_interleave_line_numbers() {
        let points = vec![
            create_test_point(0, 0.0, 0),
            create_test_point(1, 10.0, 1),
            create_test_point(2, 20.0, 0),
            create_test_point(3, 30.0, 1),
            create_test_point(4, 40.0, 0),
        ];
        let rows = build_flight_path_rows(&points).unwrap();
        let numbers: Vec<i64> = rows.iter().map(|r| r.line_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert!(rows.iter().all(|r| r.geom.0.len() == 1));
    }
}
