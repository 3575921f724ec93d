//! Capacity enforcement: find over-capacity boardings, bump passengers,
//! and maintain the bump-wait registry that feeds back into pathfinding.

use std::collections::HashMap;

use log::{debug, info};

use crate::config::AssignmentConfig;
use crate::loading::VehicleLoadProfile;
use crate::pathset::{ChosenStatus, PathSet};
use crate::supply::{StopId, TransitSupply, TripId};

/// Earliest pathfinder A-time among passengers ever bumped from a
/// boarding, keyed by `(trip, sequence, stop)`. Monotone: updates take the
/// minimum, so a stored time never increases across iterations. The label
/// engines treat a boarding as infeasible for passengers arriving later
/// than `earliest - bump_buffer`.
#[derive(Debug, Clone, Default)]
pub struct BumpWait {
    map: HashMap<(TripId, u32, StopId), f64>,
}

impl BumpWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-or-min.
    pub fn record(&mut self, trip: TripId, sequence: u32, stop: StopId, a_time_min: f64) {
        self.map
            .entry((trip, sequence, stop))
            .and_modify(|t| *t = t.min(a_time_min))
            .or_insert(a_time_min);
    }

    pub fn earliest(&self, trip: TripId, sequence: u32, stop: StopId) -> Option<f64> {
        self.map.get(&(trip, sequence, stop)).copied()
    }

    /// Bulk load, used when restoring registry state for worker snapshots.
    pub fn extend_min(&mut self, entries: impl IntoIterator<Item = ((TripId, u32, StopId), f64)>) {
        for ((trip, seq, stop), t) in entries {
            self.record(trip, seq, stop, t);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(TripId, u32, StopId), &f64)> {
        self.map.iter()
    }
}

struct BumpCandidate {
    pathset_idx: usize,
    path_idx: usize,
    link_idx: usize,
    row_idx: usize,
    sim_a_time: f64,
    pf_a_time: f64,
    request_id: usize,
    trip: TripId,
    a_seq: u32,
    a_stop: StopId,
}

/// One pass of the inner capacity loop.
///
/// Marks `bumpstop_boarded` on chosen boardings at at-capacity stops,
/// selects the bump stops (first over-capacity stop per trip, or the single
/// earliest when `bump_one_at_a_time`), bumps the latest-priority chosen
/// boardings beyond capacity plus all unchosen boardings there as a hedge,
/// and folds the bumped passengers' pathfinder A-times into the registry.
///
/// Returns the number of chosen paths bumped; zero means the load is
/// feasible and the loop can stop.
pub fn flag_bump_overcap_passengers(
    iteration: u32,
    simulation_iteration: u32,
    bump_iter: u32,
    pathsets: &mut [PathSet],
    profile: &mut VehicleLoadProfile,
    supply: &TransitSupply,
    config: &AssignmentConfig,
    bump_wait: &mut BumpWait,
) -> usize {
    // Chosen boardings at exactly-at-capacity stops squeezed on.
    for pathset in pathsets.iter_mut() {
        for path in &mut pathset.paths {
            if !path.chosen.is_chosen() || path.is_bumped() {
                continue;
            }
            for link in &mut path.links {
                let (trip, a_seq) = match (link.trip, link.mode.is_transit()) {
                    (Some(t), true) => (t, link.a_seq),
                    _ => continue,
                };
                if let Some(idx) = supply.stop_time_index(trip, a_seq) {
                    let row = &profile.rows()[idx];
                    if row.capacity.is_some() && row.overcap == 0.0 {
                        link.bumpstop_boarded = Some(true);
                    }
                }
            }
        }
    }

    // Over-capacity rows, first per trip.
    let mut bump_rows: Vec<usize> = Vec::new();
    for range in profile.trip_ranges() {
        if let Some(idx) = profile.rows()[range.clone()]
            .iter()
            .position(|r| r.overcap > 0.0)
        {
            bump_rows.push(range.start + idx);
        }
    }
    if bump_rows.is_empty() {
        info!("          No over-capacity vehicles");
        return 0;
    }

    if !config.capacity_constraint {
        // Loads are reported but nobody gets bumped.
        return 0;
    }

    if config.bump_one_at_a_time {
        bump_rows.sort_by(|&a, &b| {
            profile.rows()[a]
                .arrival_min
                .total_cmp(&profile.rows()[b].arrival_min)
                .then(profile.rows()[a].trip.cmp(&profile.rows()[b].trip))
        });
        bump_rows.truncate(1);
    }
    info!(
        "          Need to bump {} passengers from {} trip-stops",
        bump_rows
            .iter()
            .map(|&i| profile.rows()[i].overcap.max(0.0))
            .sum::<f64>(),
        bump_rows.len()
    );

    let is_bump_row: HashMap<(TripId, u32), usize> = bump_rows
        .iter()
        .map(|&i| {
            let row = &profile.rows()[i];
            ((row.trip, row.sequence), i)
        })
        .collect();

    // Collect boardings at the bump stops.
    let mut chosen_candidates: Vec<BumpCandidate> = Vec::new();
    let mut unchosen_hedge: Vec<(usize, usize)> = Vec::new();
    for (pathset_idx, pathset) in pathsets.iter().enumerate() {
        for (path_idx, path) in pathset.paths.iter().enumerate() {
            if path.is_bumped() {
                continue;
            }
            for (link_idx, link) in path.links.iter().enumerate() {
                let trip = match (link.trip, link.mode.is_transit()) {
                    (Some(t), true) => t,
                    _ => continue,
                };
                let row_idx = match is_bump_row.get(&(trip, link.a_seq)) {
                    Some(&i) => i,
                    None => continue,
                };
                if path.chosen.is_chosen() {
                    chosen_candidates.push(BumpCandidate {
                        pathset_idx,
                        path_idx,
                        link_idx,
                        row_idx,
                        sim_a_time: link.sim_a_time_min,
                        pf_a_time: link.pf_a_time_min,
                        request_id: pathset.request_id,
                        trip,
                        a_seq: link.a_seq,
                        a_stop: link.a_stop,
                    });
                } else {
                    unchosen_hedge.push((pathset_idx, path_idx));
                }
            }
        }
    }

    // Bump order: realized A-time, trip, boarding sequence, then latest
    // pathfinder A-time and request id first among equals.
    chosen_candidates.sort_by(|a, b| {
        a.sim_a_time
            .total_cmp(&b.sim_a_time)
            .then(a.trip.cmp(&b.trip))
            .then(a.a_seq.cmp(&b.a_seq))
            .then(b.pf_a_time.total_cmp(&a.pf_a_time))
            .then(b.request_id.cmp(&a.request_id))
    });

    let mut group_counts: HashMap<usize, f64> = HashMap::new();
    let mut bumped_paths: Vec<(usize, usize)> = Vec::new();
    for cand in &chosen_candidates {
        let count = group_counts.entry(cand.row_idx).or_insert(0.0);
        let overcap = profile.rows()[cand.row_idx].overcap;
        let bumped = *count < overcap;
        *count += 1.0;

        let link = &mut pathsets[cand.pathset_idx].paths[cand.path_idx].links[cand.link_idx];
        link.bumpstop_boarded = Some(!bumped);
        if bumped {
            bumped_paths.push((cand.pathset_idx, cand.path_idx));
            bump_wait.record(cand.trip, cand.a_seq, cand.a_stop, cand.pf_a_time);
            debug!(
                "bumping request {} path {} from trip {} seq {} (pf A-time {:.1})",
                cand.request_id, cand.path_idx, cand.trip, cand.a_seq, cand.pf_a_time
            );
        }
    }

    bumped_paths.sort_unstable();
    bumped_paths.dedup();
    let chosen_paths_bumped = bumped_paths.len();

    for (pathset_idx, path_idx) in bumped_paths {
        let path = &mut pathsets[pathset_idx].paths[path_idx];
        path.bump_iter = bump_iter as i32;
        path.chosen = ChosenStatus::Rejected;
    }

    // Hedge: unchosen paths boarding at a bump stop would only get bumped
    // later; take them out of contention now.
    unchosen_hedge.sort_unstable();
    unchosen_hedge.dedup();
    for (pathset_idx, path_idx) in unchosen_hedge {
        let path = &mut pathsets[pathset_idx].paths[path_idx];
        if !path.is_bumped() {
            path.bump_iter = bump_iter as i32;
        }
    }

    info!(
        "        -> bump_iter {} (iter {}.{:02}) bumped {} chosen paths",
        bump_iter, iteration, simulation_iteration, chosen_paths_bumped
    );
    chosen_paths_bumped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loading::put_passengers_on_vehicles;
    use crate::test_helpers::{chosen_transit_pathset, two_stop_supply};

    #[test]
    fn bump_wait_is_monotone() {
        let mut bw = BumpWait::new();
        bw.record(3, 1, 0, 480.0);
        bw.record(3, 1, 0, 492.0);
        assert_eq!(bw.earliest(3, 1, 0), Some(480.0));
        bw.record(3, 1, 0, 475.0);
        assert_eq!(bw.earliest(3, 1, 0), Some(475.0));
        assert_eq!(bw.earliest(3, 2, 0), None);
        assert_eq!(bw.len(), 1);
    }

    #[test]
    fn over_capacity_boarding_bumps_surplus() {
        let supply = two_stop_supply(Some(1.0));
        let config = AssignmentConfig::default().with_capacity_constraint(true);
        let mut profile = crate::loading::VehicleLoadProfile::from_supply(&supply);
        let mut pathsets = vec![
            chosen_transit_pathset(0, 0, 1, 2),
            chosen_transit_pathset(1, 0, 1, 2),
        ];
        // Both arrive at the boarding stop at the same time.
        for ps in &mut pathsets {
            for link in &mut ps.paths[0].links {
                link.sim_a_time_min = 480.0;
                link.pf_a_time_min = 480.0;
            }
        }
        put_passengers_on_vehicles(&mut profile, &supply, &pathsets, 1, 0, false);

        let mut bw = BumpWait::new();
        let bumped = flag_bump_overcap_passengers(
            1, 0, 0, &mut pathsets, &mut profile, &supply, &config, &mut bw,
        );
        assert_eq!(bumped, 1);
        assert_eq!(bw.earliest(0, 1, 0), Some(480.0));

        // Exactly one path survived; reloading leaves the vehicle full but
        // not over capacity.
        put_passengers_on_vehicles(&mut profile, &supply, &pathsets, 1, 1, false);
        let row = &profile.trip_rows(0)[0];
        assert_eq!(row.boards, 1);
        assert!(row.overcap <= 0.0);

        let bumped_again = flag_bump_overcap_passengers(
            1, 0, 1, &mut pathsets, &mut profile, &supply, &config, &mut bw,
        );
        assert_eq!(bumped_again, 0);
        // The survivor squeezed onto an at-capacity vehicle.
        let survivor = pathsets
            .iter()
            .find(|ps| ps.chosen_path().is_some())
            .unwrap();
        let link = survivor.chosen_path().unwrap().transit_links().next().unwrap();
        assert_eq!(link.bumpstop_boarded, Some(true));
    }

    #[test]
    fn bumped_passenger_no_later_than_boarded_ones() {
        let supply = two_stop_supply(Some(1.0));
        let config = AssignmentConfig::default().with_capacity_constraint(true);
        let mut profile = crate::loading::VehicleLoadProfile::from_supply(&supply);
        let mut pathsets = vec![
            chosen_transit_pathset(0, 0, 1, 2),
            chosen_transit_pathset(1, 0, 1, 2),
        ];
        // Request 0 reaches the stop earlier.
        for link in &mut pathsets[0].paths[0].links {
            link.sim_a_time_min = 478.0;
            link.pf_a_time_min = 478.0;
        }
        for link in &mut pathsets[1].paths[0].links {
            link.sim_a_time_min = 480.0;
            link.pf_a_time_min = 480.0;
        }
        put_passengers_on_vehicles(&mut profile, &supply, &pathsets, 1, 0, false);
        let mut bw = BumpWait::new();
        flag_bump_overcap_passengers(
            1, 0, 0, &mut pathsets, &mut profile, &supply, &config, &mut bw,
        );
        let bumped_a_time: f64 = pathsets
            .iter()
            .flat_map(|ps| &ps.paths)
            .filter(|p| p.is_bumped())
            .map(|p| p.links[0].sim_a_time_min)
            .fold(f64::NAN, f64::max);
        let boarded_min_a_time: f64 = pathsets
            .iter()
            .filter_map(|ps| ps.chosen_path())
            .map(|p| p.links[0].sim_a_time_min)
            .fold(f64::INFINITY, f64::min);
        assert!(bumped_a_time <= boarded_min_a_time);
    }

    #[test]
    fn capacity_constraint_off_reports_without_bumping() {
        let supply = two_stop_supply(Some(1.0));
        let config = AssignmentConfig::default();
        let mut profile = crate::loading::VehicleLoadProfile::from_supply(&supply);
        let mut pathsets = vec![
            chosen_transit_pathset(0, 0, 1, 2),
            chosen_transit_pathset(1, 0, 1, 2),
        ];
        put_passengers_on_vehicles(&mut profile, &supply, &pathsets, 1, 0, false);
        let mut bw = BumpWait::new();
        let bumped = flag_bump_overcap_passengers(
            1, 0, 0, &mut pathsets, &mut profile, &supply, &config, &mut bw,
        );
        assert_eq!(bumped, 0);
        assert!(bw.is_empty());
        assert!(pathsets.iter().all(|ps| ps.chosen_path().is_some()));
    }
}
