//! Per-pass simulation steps: realize board/alight times against the
//! current vehicle schedule and flag missed transfers.

use log::{debug, info};

use crate::loading::VehicleLoadProfile;
use crate::pathset::{LinkMode, PathSet};
use crate::supply::TransitSupply;

/// Attach board and alight times (and the boarding stop's overcap state)
/// from the current schedule to every transit link of every path. Works on
/// the whole pathset, not just chosen paths, so an unchosen path can still
/// be evaluated for re-choice.
pub fn find_passenger_vehicle_times(
    pathsets: &mut [PathSet],
    supply: &TransitSupply,
    profile: &VehicleLoadProfile,
) {
    for pathset in pathsets.iter_mut() {
        for path in &mut pathset.paths {
            for link in &mut path.links {
                if !link.mode.is_transit() {
                    continue;
                }
                let trip = match link.trip {
                    Some(t) => t,
                    None => continue,
                };
                if let Some(idx) = supply.stop_time_index(trip, link.a_seq) {
                    let row = &profile.rows()[idx];
                    link.board_time_min = Some(row.departure_min);
                    link.overcap = row.overcap;
                    link.overcap_frac = row.overcap_frac;
                }
                if let Some(idx) = supply.stop_time_index(trip, link.b_seq) {
                    link.alight_time_min = Some(profile.rows()[idx].arrival_min);
                }
            }
        }
    }
}

/// Walk each path forward and recompute realized link times from the
/// attached board/alight times. A transit boarding whose vehicle departs
/// before the passenger reaches the stop has a negative wait and is a
/// missed transfer; the flag rolls up from links to paths.
///
/// Returns `(missed transfer links, missed transfer paths)`.
pub fn flag_missed_transfers(pathsets: &mut [PathSet]) -> (usize, usize) {
    let mut missed_links = 0;
    let mut missed_paths = 0;
    for pathset in pathsets.iter_mut() {
        for path in &mut pathset.paths {
            let mut prev_b_time: Option<f64> = None;
            let mut path_missed = false;
            for link in &mut path.links {
                match link.mode {
                    LinkMode::Access => {
                        // Access is untouched by vehicle delays.
                        link.sim_a_time_min = link.pf_a_time_min;
                        link.sim_b_time_min = link.pf_b_time_min;
                        link.sim_wait_time_min = 0.0;
                        link.missed_xfer = false;
                    }
                    LinkMode::Transit => {
                        let board = link.board_time_min.unwrap_or(link.pf_a_time_min);
                        let alight = link.alight_time_min.unwrap_or(link.pf_b_time_min);
                        link.alight_delay_min = alight - link.pf_b_time_min;
                        link.sim_a_time_min = prev_b_time.unwrap_or(link.pf_a_time_min);
                        link.sim_b_time_min = alight;
                        link.sim_wait_time_min = board - link.sim_a_time_min;
                        link.missed_xfer = link.sim_wait_time_min < 0.0;
                    }
                    LinkMode::Transfer | LinkMode::Egress => {
                        link.sim_a_time_min = prev_b_time.unwrap_or(link.pf_a_time_min);
                        link.sim_b_time_min = link.sim_a_time_min + link.pf_link_time_min;
                        link.sim_wait_time_min = 0.0;
                        link.missed_xfer = false;
                    }
                }
                link.sim_link_time_min = link.sim_b_time_min - link.sim_a_time_min;
                if link.missed_xfer {
                    missed_links += 1;
                    path_missed = true;
                }
                prev_b_time = Some(link.sim_b_time_min);
            }
            path.missed_xfer = path_missed;
            if path_missed {
                missed_paths += 1;
                debug!(
                    "request {} path has a missed transfer",
                    pathset.request_id
                );
            }
        }
    }
    info!(
        "          flag_missed_transfers found {} missed transfer trip legs for {} paths",
        missed_links, missed_paths
    );
    (missed_links, missed_paths)
}

/// When running without simulation, realized fields simply restate the
/// pathfinding results.
pub fn reset_sim_times_to_pathfinding(pathsets: &mut [PathSet]) {
    for pathset in pathsets.iter_mut() {
        for path in &mut pathset.paths {
            path.missed_xfer = false;
            for link in &mut path.links {
                link.alight_delay_min = 0.0;
                link.sim_a_time_min = link.pf_a_time_min;
                link.sim_b_time_min = link.pf_b_time_min;
                link.sim_link_time_min = link.pf_link_time_min;
                link.sim_wait_time_min = link.pf_wait_time_min;
                link.missed_xfer = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loading::VehicleLoadProfile;
    use crate::test_helpers::{
        chosen_transit_pathset, transfer_pathset, two_stop_supply, two_trip_transfer_supply,
    };

    #[test]
    fn realized_times_come_from_schedule() {
        let supply = two_stop_supply(None);
        let profile = VehicleLoadProfile::from_supply(&supply);
        let mut pathsets = vec![chosen_transit_pathset(0, 0, 1, 2)];
        find_passenger_vehicle_times(&mut pathsets, &supply, &profile);
        let link = &pathsets[0].paths[0].links[1];
        assert_eq!(link.board_time_min, Some(481.0));
        assert_eq!(link.alight_time_min, Some(490.0));
    }

    #[test]
    fn vehicle_departing_before_arrival_is_missed_transfer() {
        // Trip 0 arrives stop 1 at 490; trip 1 departs stop 1 at 489.
        let supply = two_trip_transfer_supply(490.0, 489.0);
        let profile = VehicleLoadProfile::from_supply(&supply);
        let mut pathsets = vec![transfer_pathset(0)];
        find_passenger_vehicle_times(&mut pathsets, &supply, &profile);
        let (links, paths) = flag_missed_transfers(&mut pathsets);
        assert_eq!((links, paths), (1, 1));
        let second_leg = &pathsets[0].paths[0].links[2];
        assert!(second_leg.sim_wait_time_min < 0.0);
        assert!(second_leg.missed_xfer);
        assert!(pathsets[0].paths[0].missed_xfer);
        assert!(!pathsets[0].arrived());
    }

    #[test]
    fn feasible_connection_not_flagged() {
        let supply = two_trip_transfer_supply(490.0, 495.0);
        let profile = VehicleLoadProfile::from_supply(&supply);
        let mut pathsets = vec![transfer_pathset(0)];
        find_passenger_vehicle_times(&mut pathsets, &supply, &profile);
        let (links, paths) = flag_missed_transfers(&mut pathsets);
        assert_eq!((links, paths), (0, 0));
        assert!(pathsets[0].arrived());
    }
}
