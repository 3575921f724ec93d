//! Vehicle loading: aggregate chosen passenger links into per-stop boards,
//! alights and onboard counts, smooth with MSA across outer iterations, and
//! refresh dwell and travel times for the next pathfinding pass.

use std::ops::Range;

use log::debug;

use crate::pathset::PathSet;
use crate::supply::{StopId, TransitSupply, TripId};

/// Fixed dwell overhead when a vehicle serves passengers at a stop, seconds.
const DWELL_CONSTANT_SEC: f64 = 4.0;
/// Marginal dwell per boarding passenger, seconds.
const DWELL_PER_BOARD_SEC: f64 = 2.5;
/// Marginal dwell per alighting passenger, seconds.
const DWELL_PER_ALIGHT_SEC: f64 = 1.5;
/// Acceleration/deceleration penalty for making a stop, seconds.
const ACCEL_DECEL_SEC: f64 = 12.0;

/// One `(trip, stop sequence)` row of the load profile.
#[derive(Debug, Clone)]
pub struct VehicleLoadRow {
    pub trip: TripId,
    pub sequence: u32,
    pub stop: StopId,
    pub arrival_min: f64,
    pub departure_min: f64,
    /// Scheduled times from the input feed; the refresh never lets a
    /// vehicle run ahead of these.
    pub sched_arrival_min: f64,
    pub sched_departure_min: f64,
    /// Run time from the previous stop per the input schedule, seconds.
    pub travel_time_sec: f64,
    pub dwell_time_sec: f64,
    pub capacity: Option<f64>,
    pub seated_capacity: Option<f64>,
    pub boards: u32,
    pub alights: u32,
    pub onboard: i64,
    pub standees: f64,
    pub friction: f64,
    /// Onboard minus capacity; NaN when the trip has no capacity.
    pub overcap: f64,
    /// Share of this stop's boards that are over capacity.
    pub overcap_frac: f64,
    pub msa_boards: f64,
    pub msa_alights: f64,
    pub msa_onboard: f64,
    pub msa_standees: f64,
    pub msa_friction: f64,
    pub msa_overcap: f64,
}

/// Load profile over every `(trip, sequence)` of the supply, row-aligned
/// with [`TransitSupply::stop_times`].
#[derive(Debug, Clone)]
pub struct VehicleLoadProfile {
    rows: Vec<VehicleLoadRow>,
    trip_ranges: Vec<Range<usize>>,
}

impl VehicleLoadProfile {
    pub fn from_supply(supply: &TransitSupply) -> Self {
        let mut rows = Vec::with_capacity(supply.stop_times().len());
        let mut trip_ranges = vec![0..0; supply.num_trips()];
        let mut prev: Option<(TripId, f64)> = None;
        for st in supply.stop_times() {
            let trip = supply.trip(st.trip);
            let travel_time_sec = match prev {
                Some((t, prev_dep)) if t == st.trip => (st.arrival_min - prev_dep) * 60.0,
                _ => 0.0,
            };
            prev = Some((st.trip, st.departure_min));
            rows.push(VehicleLoadRow {
                trip: st.trip,
                sequence: st.sequence,
                stop: st.stop,
                arrival_min: st.arrival_min,
                departure_min: st.departure_min,
                sched_arrival_min: st.arrival_min,
                sched_departure_min: st.departure_min,
                travel_time_sec,
                dwell_time_sec: (st.departure_min - st.arrival_min) * 60.0,
                capacity: trip.capacity,
                seated_capacity: trip.seated_capacity,
                boards: 0,
                alights: 0,
                onboard: 0,
                standees: 0.0,
                friction: 0.0,
                overcap: trip.capacity.map_or(f64::NAN, |c| -c),
                overcap_frac: 0.0,
                msa_boards: 0.0,
                msa_alights: 0.0,
                msa_onboard: 0.0,
                msa_standees: 0.0,
                msa_friction: 0.0,
                msa_overcap: 0.0,
            });
        }
        // Trip ranges from the sorted row order.
        let mut row = 0;
        while row < rows.len() {
            let trip = rows[row].trip;
            let start = row;
            while row < rows.len() && rows[row].trip == trip {
                row += 1;
            }
            trip_ranges[trip] = start..row;
        }
        Self { rows, trip_ranges }
    }

    pub fn rows(&self) -> &[VehicleLoadRow] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [VehicleLoadRow] {
        &mut self.rows
    }

    pub fn trip_rows(&self, trip: TripId) -> &[VehicleLoadRow] {
        &self.rows[self.trip_ranges[trip].clone()]
    }

    pub fn trip_ranges(&self) -> &[Range<usize>] {
        &self.trip_ranges
    }

    /// Row index of `(trip, sequence)`; rows are supply-aligned so this
    /// matches [`TransitSupply::stop_time_index`].
    pub fn row_index(&self, supply: &TransitSupply, trip: TripId, sequence: u32) -> Option<usize> {
        supply.stop_time_index(trip, sequence)
    }

    /// Empty all counts, as at the start of an odd (full pathfinding)
    /// iteration.
    pub fn reset_onboard(&mut self) {
        for row in &mut self.rows {
            row.boards = 0;
            row.alights = 0;
            row.onboard = 0;
            row.standees = 0.0;
            row.friction = 0.0;
            row.overcap = row.capacity.map_or(f64::NAN, |c| -c);
            row.overcap_frac = 0.0;
        }
    }
}

/// Aggregate the chosen, unbumped passenger trip links onto the vehicles:
/// boards and alights per `(trip, sequence)`, onboard as the running sum,
/// overcap against capacity, and the MSA-smoothed mirrors.
///
/// MSA folds in with `lambda = 1/iteration` once per simulation pass (at
/// `bump_iter == 0`); when `msa` is off the smoothed columns simply mirror
/// the raw ones.
pub fn put_passengers_on_vehicles(
    profile: &mut VehicleLoadProfile,
    supply: &TransitSupply,
    pathsets: &[PathSet],
    iteration: u32,
    bump_iter: u32,
    msa: bool,
) {
    for row in profile.rows.iter_mut() {
        row.boards = 0;
        row.alights = 0;
    }

    for pathset in pathsets {
        let path = match pathset.chosen_path() {
            Some(p) => p,
            None => continue,
        };
        if path.is_bumped() {
            continue;
        }
        for link in path.transit_links() {
            let trip = match link.trip {
                Some(t) => t,
                None => continue,
            };
            if let Some(idx) = supply.stop_time_index(trip, link.a_seq) {
                profile.rows[idx].boards += 1;
            }
            if let Some(idx) = supply.stop_time_index(trip, link.b_seq) {
                profile.rows[idx].alights += 1;
            }
        }
    }

    let msa_lambda = if msa { 1.0 / f64::from(iteration.max(1)) } else { 1.0 };
    let fold_msa = bump_iter == 0;

    for range in profile.trip_ranges.clone() {
        let mut onboard: i64 = 0;
        let mut msa_onboard: f64 = 0.0;
        for row in &mut profile.rows[range] {
            onboard += i64::from(row.boards) - i64::from(row.alights);
            row.onboard = onboard;
            row.overcap = row.capacity.map_or(f64::NAN, |c| onboard as f64 - c);
            row.overcap_frac = if row.boards > 0 && row.overcap > 0.0 {
                row.overcap / f64::from(row.boards)
            } else {
                0.0
            };
            row.standees = row
                .seated_capacity
                .map_or(0.0, |seated| (onboard as f64 - seated).max(0.0));
            // Standee-minutes over the incoming segment.
            row.friction = row.standees * row.travel_time_sec / 60.0;

            if fold_msa {
                row.msa_boards =
                    msa_lambda * f64::from(row.boards) + (1.0 - msa_lambda) * row.msa_boards;
                row.msa_alights =
                    msa_lambda * f64::from(row.alights) + (1.0 - msa_lambda) * row.msa_alights;
            }
            msa_onboard += row.msa_boards - row.msa_alights;
            row.msa_onboard = msa_onboard;
            row.msa_overcap = row
                .capacity
                .map_or(0.0, |c| (msa_onboard - c).max(0.0));
            row.msa_standees = row
                .seated_capacity
                .map_or(0.0, |seated| (msa_onboard - seated).max(0.0));
            row.msa_friction = row.msa_standees * row.travel_time_sec / 60.0;
        }
    }

    debug!(
        "loaded vehicles: {} boards / {} alights across {} rows",
        profile.rows.iter().map(|r| u64::from(r.boards)).sum::<u64>(),
        profile.rows.iter().map(|r| u64::from(r.alights)).sum::<u64>(),
        profile.rows.len()
    );
}

/// Refresh dwell and travel times from the current boards/alights, shifting
/// downstream stops. Vehicles hold to the scheduled departure when they
/// would otherwise run early.
pub fn update_trip_times(profile: &mut VehicleLoadProfile) {
    for range in profile.trip_ranges.clone() {
        let mut prev_departure: Option<f64> = None;
        for row in &mut profile.rows[range] {
            let activity = row.boards > 0 || row.alights > 0;
            row.dwell_time_sec = if activity {
                DWELL_CONSTANT_SEC
                    + DWELL_PER_BOARD_SEC * f64::from(row.boards)
                    + DWELL_PER_ALIGHT_SEC * f64::from(row.alights)
            } else {
                0.0
            };

            row.arrival_min = match prev_departure {
                None => row.sched_arrival_min,
                Some(dep) => {
                    let stop_penalty = if activity { ACCEL_DECEL_SEC } else { 0.0 };
                    let running = dep + (row.travel_time_sec + stop_penalty) / 60.0;
                    running.max(row.sched_arrival_min)
                }
            };
            row.departure_min =
                (row.arrival_min + row.dwell_time_sec / 60.0).max(row.sched_departure_min);
            prev_departure = Some(row.departure_min);
        }
    }
}

/// Push the profile's refreshed times and overcap column into a supply
/// snapshot for the next pathfinding pass.
pub fn refresh_supply(profile: &VehicleLoadProfile, supply: &mut TransitSupply, use_msa: bool) {
    let arrivals: Vec<f64> = profile.rows.iter().map(|r| r.arrival_min).collect();
    let departures: Vec<f64> = profile.rows.iter().map(|r| r.departure_min).collect();
    supply.apply_schedule(&arrivals, &departures);
    let overcap: Vec<f64> = profile
        .rows
        .iter()
        .map(|r| {
            let v = if use_msa { r.msa_overcap } else { r.overcap };
            if v.is_nan() {
                0.0
            } else {
                v
            }
        })
        .collect();
    supply.apply_overcap(&overcap);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathset::ChosenStatus;
    use crate::test_helpers::{chosen_transit_pathset, two_stop_supply};

    #[test]
    fn onboard_is_cumulative_sum_and_alights_balance() {
        let supply = two_stop_supply(None);
        let mut profile = VehicleLoadProfile::from_supply(&supply);
        let pathsets = vec![
            chosen_transit_pathset(0, 0, 1, 2),
            chosen_transit_pathset(1, 0, 1, 2),
        ];
        put_passengers_on_vehicles(&mut profile, &supply, &pathsets, 1, 0, false);

        let rows = profile.trip_rows(0);
        assert_eq!(rows[0].boards, 2);
        assert_eq!(rows[0].onboard, 2);
        assert_eq!(rows[1].alights, 2);
        assert_eq!(rows[1].onboard, 0);
        let total_boards: u32 = rows.iter().map(|r| r.boards).sum();
        let total_alights: u32 = rows.iter().map(|r| r.alights).sum();
        assert_eq!(total_boards, total_alights);
        assert!(rows.iter().all(|r| r.onboard >= 0));
    }

    #[test]
    fn bumped_and_unchosen_paths_not_loaded() {
        let supply = two_stop_supply(None);
        let mut profile = VehicleLoadProfile::from_supply(&supply);
        let mut bumped = chosen_transit_pathset(0, 0, 1, 2);
        bumped.paths[0].bump_iter = 0;
        let mut unchosen = chosen_transit_pathset(1, 0, 1, 2);
        unchosen.paths[0].chosen = ChosenStatus::NotChosenYet;
        put_passengers_on_vehicles(&mut profile, &supply, &[bumped, unchosen], 1, 0, false);
        assert_eq!(profile.trip_rows(0)[0].boards, 0);
    }

    #[test]
    fn msa_halves_toward_new_loads_at_iteration_two() {
        let supply = two_stop_supply(None);
        let mut profile = VehicleLoadProfile::from_supply(&supply);
        let pathsets = vec![
            chosen_transit_pathset(0, 0, 1, 2),
            chosen_transit_pathset(1, 0, 1, 2),
        ];
        // Iteration 1: raw == msa == 2 boards.
        put_passengers_on_vehicles(&mut profile, &supply, &pathsets, 1, 0, true);
        assert!((profile.trip_rows(0)[0].msa_boards - 2.0).abs() < 1e-12);
        // Iteration 2 with no riders: msa = 0.5*0 + 0.5*2 = 1.
        put_passengers_on_vehicles(&mut profile, &supply, &[], 2, 0, true);
        assert!((profile.trip_rows(0)[0].msa_boards - 1.0).abs() < 1e-12);
    }

    #[test]
    fn dwell_refresh_shifts_downstream_arrival() {
        let supply = two_stop_supply(None);
        let mut profile = VehicleLoadProfile::from_supply(&supply);
        let pathsets = vec![chosen_transit_pathset(0, 0, 1, 2)];
        put_passengers_on_vehicles(&mut profile, &supply, &pathsets, 1, 0, false);
        update_trip_times(&mut profile);
        let rows = profile.trip_rows(0);
        assert!(rows[0].dwell_time_sec > 0.0);
        // Departure held at or after schedule, arrival downstream delayed.
        assert!(rows[0].departure_min >= rows[0].sched_departure_min);
        assert!(rows[1].arrival_min > rows[1].sched_arrival_min);
    }

    #[test]
    fn overcap_tracks_capacity() {
        let supply = two_stop_supply(Some(1.0));
        let mut profile = VehicleLoadProfile::from_supply(&supply);
        let pathsets = vec![
            chosen_transit_pathset(0, 0, 1, 2),
            chosen_transit_pathset(1, 0, 1, 2),
        ];
        put_passengers_on_vehicles(&mut profile, &supply, &pathsets, 1, 0, false);
        let rows = profile.trip_rows(0);
        assert!((rows[0].overcap - 1.0).abs() < 1e-12);
        assert!((rows[0].overcap_frac - 0.5).abs() < 1e-12);
    }
}
