//! Load segmentation engine
//!
//! Assigns a load number to every track point of one machine by walking the
//! time-ordered stream and detecting departures from load sites. A load is
//! one bucket fill, so the counter advances exactly when the machine leaves a
//! load site and the stream ahead confirms sowing before any site re-entry.

use crate::model::{LoadSite, TrackPoint};
use geo::Contains;
use std::collections::BTreeMap;

/// Engine settings sourced from the project configuration
#[derive(Clone, Copy, Debug)]
pub struct SegmentationConfig {
    /// Fallback altitude ceiling in meters for sites without their own
    /// elevation trigger
    pub site_ceiling: f64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        SegmentationConfig { site_ceiling: 50.0 }
    }
}

/// Machine position relative to the load sites during the scan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MachineState {
    /// Inside an active site at or below its trigger altitude
    AtSite,
    /// Departed, with no sowing confirmed before the next site re-entry
    DepartedUnresolved,
    /// Departed and the lookahead confirmed sowing; the counter has advanced
    DepartedConfirmedNewLoad,
}

/// Whether a point counts as at a load site: inside an active site polygon
/// at or below the site's trigger altitude
fn in_load_site(point: &TrackPoint, sites: &[LoadSite], config: &SegmentationConfig) -> bool {
    sites.iter().any(|site| {
        site.active
            && point.altitude <= site.elevation_trigger.unwrap_or(config.site_ceiling)
            && site.geom.contains(&point.geom)
    })
}

/// Scan forward from a departing point: does the bucket open before the
/// machine is back at a site? The bucket check precedes the site check at
/// every point, so a departure that is already sowing confirms immediately.
fn sowing_before_site_return(
    rest: &[TrackPoint],
    sites: &[LoadSite],
    config: &SegmentationConfig,
) -> bool {
    for point in rest {
        if point.bucket_state.is_open() {
            return true;
        }
        if in_load_site(point, sites, config) {
            return false;
        }
    }
    false
}

fn record(assignments: &mut BTreeMap<i64, i64>, point: &TrackPoint, load: i64) {
    match point.id {
        Some(id) => {
            assignments.insert(id, load);
        }
        None => tracing::warn!(src_id = %point.src_id, "skipping unsaved point in load numbering"),
    }
}

/// Assign load numbers to a machine's unnumbered points
///
/// `points` is the machine's complete track in time order, already-numbered
/// points included: they reseed the counter and the site state but are never
/// reassigned, which keeps reruns over numbered data idempotent. The first
/// point only seeds the state; departures are decided from the second point
/// on. New load numbers are monotonic non-decreasing along the scan.
///
/// # Returns
/// The `id -> load_number` map for points that were previously unnumbered.
pub fn assign_load_numbers(
    points: &[TrackPoint],
    sites: &[LoadSite],
    config: &SegmentationConfig,
) -> BTreeMap<i64, i64> {
    let mut assignments = BTreeMap::new();
    let mut load_counter: i64 = 0;
    let mut state = MachineState::AtSite;

    for (index, point) in points.iter().enumerate() {
        let at_site = in_load_site(point, sites, config);

        if index == 0 {
            state = if at_site {
                MachineState::AtSite
            } else {
                MachineState::DepartedUnresolved
            };
            match point.load_number {
                Some(load) => load_counter = load,
                None => record(&mut assignments, point, load_counter),
            }
            continue;
        }

        // Numbered points carry their decision already; follow them.
        if let Some(load) = point.load_number {
            load_counter = load;
            state = match (state, at_site) {
                (_, true) => MachineState::AtSite,
                (MachineState::AtSite, false) => MachineState::DepartedUnresolved,
                (departed, false) => departed,
            };
            continue;
        }

        state = match (state, at_site) {
            (MachineState::AtSite, true) => MachineState::AtSite,
            (MachineState::AtSite, false) => {
                // Departure: one lookahead decides whether this is a new load,
                // cached in the state until the machine is back at a site.
                if sowing_before_site_return(&points[index..], sites, config) {
                    load_counter += 1;
                    tracing::debug!(
                        machine = %point.machine_code,
                        load = load_counter,
                        "departure confirmed new load"
                    );
                    MachineState::DepartedConfirmedNewLoad
                } else {
                    MachineState::DepartedUnresolved
                }
            }
            (_, true) => MachineState::AtSite,
            (departed, false) => departed,
        };

        record(&mut assignments, point, load_counter);
    }

    assignments
}
