//! Load summary aggregation
//!
//! Rolls the detailed coverage segments of one load into a single summary
//! row: totals for area, distance and runout time, means for rate and
//! speed, and the target figures the operation was planned against. The
//! target speed works backwards from the bucket size and the prescribed
//! sow rate to the ground speed that would empty the bucket exactly on
//! target.

use crate::coverage::MS_TO_KNOTS;
use crate::model::{DetailedSegment, LoadSummary, Machine};
use std::path::Path;

/// Summarize one load's detailed segments
///
/// `segments` is the detailed coverage output for a single machine and
/// load, `machine` supplies the prescribed sow rate and `raw_data_folder`
/// anchors the audit path back to the staged download. Returns `None` when
/// the load produced no detailed segments.
pub fn summarize_segments(
    segments: &[DetailedSegment],
    machine: &Machine,
    raw_data_folder: &Path,
) -> Option<LoadSummary> {
    let first = segments.first()?;
    let count = segments.len() as f64;

    let start_time = segments.iter().map(|s| s.date_time).min()?;
    let end_time = segments.iter().map(|s| s.date_time).max()?;
    let sum_hectares: f64 = segments.iter().map(|s| s.hectares).sum();
    let coverage_rate = segments.iter().map(|s| s.coverage_rate).sum::<f64>() / count;
    let average_speed = segments.iter().map(|s| s.speed).sum::<f64>() / count;
    let runout_time: f64 = segments.iter().map(|s| s.seconds).sum();
    let distance_spreading: f64 = segments.iter().map(|s| s.distance).sum();

    let dir_location = raw_data_folder
        .join(&first.machine_code)
        .join(&first.batch_id)
        .display()
        .to_string();

    // Seconds of discharge per kilogram, then the speed that would spread
    // the whole bucket at the prescribed rate.
    let kg_second = runout_time / first.bucket_size as f64;
    let target_ha = first.bucket_size as f64 / machine.target_sow_rate;
    let target_distance = target_ha * 10_000.0 / first.width;
    let target_seconds = target_ha * (kg_second + 1.0);
    let target_speed = (target_distance / target_seconds) * MS_TO_KNOTS;

    Some(LoadSummary {
        machine_code: first.machine_code.clone(),
        batch_id: first.batch_id.clone(),
        load_number: first.load_number,
        start_time,
        end_time,
        bucket_size: first.bucket_size,
        sum_hectares,
        coverage_rate,
        average_speed,
        runout_time,
        distance_spreading,
        dir_location,
        target_speed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketState, CoverageSegment};
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use geo::{Coord, LineString};
    use std::collections::BTreeMap;

    fn base_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 11, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn create_test_machine() -> Machine {
        Machine {
            machine_code: "PBX".to_string(),
            company: Some("Heli Ops".to_string()),
            pilot: None,
            default_bucket_size: 600,
            target_sow_rate: 6.0,
            swath_translation: BTreeMap::new(),
            active: true,
        }
    }

    fn create_test_segment(
        offset: i64,
        distance: f64,
        seconds: f64,
        speed: f64,
        coverage_rate: f64,
    ) -> DetailedSegment {
        CoverageSegment {
            src_id: format!("seg_{offset}"),
            date_time: base_time() + Duration::seconds(offset),
            speed,
            heading: 90.0,
            altitude: 150.0,
            width: 100.0,
            machine_code: "PBX".to_string(),
            bucket_size: 600,
            load_number: 1,
            batch_id: "PBX_02112023_0930".to_string(),
            bucket_state: BucketState::Open,
            coverage_rate,
            hectares: distance * 100.0 / 10_000.0,
            distance,
            seconds,
            line_number: 0,
            geom: LineString(vec![
                Coord { x: 0.0, y: 0.0 },
                Coord { x: distance, y: 0.0 },
            ]),
        }
    }

    #[test]
    fn test_no_segments_returns_none() {
        let machine = create_test_machine();
        assert!(summarize_segments(&[], &machine, Path::new("raw_data")).is_none());
    }

    #[test]
    fn test_sums_means_and_targets() {
        let segments = vec![
            create_test_segment(0, 5.0, 0.5, 10.0, 4000.0),
            create_test_segment(1, 15.0, 1.5, 20.0, 2000.0),
        ];
        let machine = create_test_machine();
        let summary = summarize_segments(&segments, &machine, Path::new("raw_data")).unwrap();

        assert_eq!(summary.machine_code, "PBX");
        assert_eq!(summary.batch_id, "PBX_02112023_0930");
        assert_eq!(summary.load_number, 1);
        assert_eq!(summary.bucket_size, 600);
        assert_eq!(summary.start_time, base_time());
        assert_eq!(summary.end_time, base_time() + Duration::seconds(1));
        assert!((summary.sum_hectares - 0.2).abs() < 1e-9);
        assert!((summary.coverage_rate - 3000.0).abs() < 1e-9);
        assert!((summary.average_speed - 15.0).abs() < 1e-9);
        assert!((summary.runout_time - 2.0).abs() < 1e-9);
        assert!((summary.distance_spreading - 20.0).abs() < 1e-9);

        // 600 kg at 6 kg/ha plans 100 ha; at 100 m swath that is 10 km.
        let kg_second = 2.0 / 600.0;
        let expected_speed = (10_000.0 / (100.0 * (kg_second + 1.0))) * MS_TO_KNOTS;
        assert!((summary.target_speed - expected_speed).abs() < 1e-9);
    }

    #[test]
    fn test_dir_location_points_at_staged_batch() {
        let segments = vec![create_test_segment(0, 5.0, 0.5, 10.0, 4000.0)];
        let machine = create_test_machine();
        let summary =
            summarize_segments(&segments, &machine, Path::new("project/raw_data")).unwrap();
        let expected = Path::new("project/raw_data")
            .join("PBX")
            .join("PBX_02112023_0930")
            .display()
            .to_string();
        assert_eq!(summary.dir_location, expected);
    }

    #[test]
    fn test_identity_columns_come_from_first_segment() {
        let mut second = create_test_segment(5, 5.0, 0.5, 10.0, 4000.0);
        second.batch_id = "PBX_02112023_1100".to_string();
        let segments = vec![create_test_segment(0, 5.0, 0.5, 10.0, 4000.0), second];
        let machine = create_test_machine();
        let summary = summarize_segments(&segments, &machine, Path::new("raw_data")).unwrap();
        assert_eq!(summary.batch_id, "PBX_02112023_0930");
    }

    #[test]
    fn test_start_end_are_min_max_times() {
        let segments = vec![
            create_test_segment(10, 5.0, 0.5, 10.0, 4000.0),
            create_test_segment(2, 5.0, 0.5, 10.0, 4000.0),
            create_test_segment(7, 5.0, 0.5, 10.0, 4000.0),
        ];
        let machine = create_test_machine();
        let summary = summarize_segments(&segments, &machine, Path::new("raw_data")).unwrap();
        assert_eq!(summary.start_time, base_time() + Duration::seconds(2));
        assert_eq!(summary.end_time, base_time() + Duration::seconds(10));
    }
}
