//! Immutable transit supply snapshot: time-expanded stop-times plus the
//! side indexes the label engines traverse.
//!
//! Stops, trips and zones are densely renumbered small integers; external
//! ids live in [`TripInfo`] and on the caller's side. One snapshot is shared
//! read-only by all workers during a pathfinding pass; the driver produces
//! the next snapshot by applying the schedule refresh between passes.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{AssignError, Result};

pub type StopId = usize;
pub type TripId = usize;
pub type TazId = usize;

/// One row of the time-expanded schedule. Times are minutes after midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTime {
    pub trip: TripId,
    pub stop: StopId,
    /// Strictly increasing within a trip; externally assigned, not
    /// necessarily contiguous.
    pub sequence: u32,
    pub arrival_min: f64,
    pub departure_min: f64,
    /// Onboard minus capacity from the previous iteration's load, consumed
    /// by the label engines for crowding-aware extensions.
    pub overcap: f64,
    /// Cumulative distance along the trip shape, if known.
    pub shape_dist: f64,
}

/// Per-trip attributes carried through to outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripInfo {
    pub external_id: String,
    pub route_id: String,
    pub service_id: String,
    pub direction_id: Option<u8>,
    /// Transit mode code for result records; None reports generic transit.
    pub mode: Option<i32>,
    /// Total vehicle capacity. None means unbounded.
    pub capacity: Option<f64>,
    pub seated_capacity: Option<f64>,
    /// Flat boarding fare in dollars, if fares are modeled.
    pub fare: Option<f64>,
}

/// Stop-to-stop walking transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEdge {
    pub from_stop: StopId,
    pub to_stop: StopId,
    pub time_min: f64,
    pub dist: f64,
}

/// Zone-to-stop connector, used for both access (zone to boarding stop) and
/// egress (alighting stop to zone).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorEdge {
    pub taz: TazId,
    pub stop: StopId,
    pub time_min: f64,
    pub dist: f64,
}

#[derive(Debug, Clone)]
pub struct TransitSupply {
    num_stops: usize,
    num_tazs: usize,
    stop_times: Vec<StopTime>,
    trips: Vec<TripInfo>,
    trip_ranges: Vec<Range<usize>>,
    /// Per stop: stop-time indexes ordered by departure time (board
    /// opportunities).
    boardings_at: Vec<Vec<usize>>,
    /// Per stop: stop-time indexes ordered by arrival time (alight
    /// opportunities).
    alightings_at: Vec<Vec<usize>>,
    transfers_from: Vec<Vec<TransferEdge>>,
    transfers_to: Vec<Vec<TransferEdge>>,
    access_edges: Vec<Vec<ConnectorEdge>>,
    egress_edges: Vec<Vec<ConnectorEdge>>,
}

impl TransitSupply {
    /// Bulk-load the schedule. Rows may arrive in any order; they are
    /// grouped by trip and sorted by sequence. Fails on negative or
    /// non-finite times, `arrival > departure`, out-of-range ids, or
    /// duplicate sequences within a trip.
    pub fn new(
        mut stop_times: Vec<StopTime>,
        trips: Vec<TripInfo>,
        num_stops: usize,
        num_tazs: usize,
    ) -> Result<Self> {
        for st in &stop_times {
            if st.trip >= trips.len() {
                return Err(AssignError::Supply(format!(
                    "stop-time references unknown trip {}",
                    st.trip
                )));
            }
            if st.stop >= num_stops {
                return Err(AssignError::Supply(format!(
                    "stop-time references unknown stop {}",
                    st.stop
                )));
            }
            if !st.arrival_min.is_finite() || !st.departure_min.is_finite() {
                return Err(AssignError::Supply(format!(
                    "trip {} has a non-finite stop time",
                    st.trip
                )));
            }
            if st.arrival_min < 0.0 || st.departure_min < 0.0 {
                return Err(AssignError::Supply(format!(
                    "trip {} has a negative stop time",
                    st.trip
                )));
            }
            if st.arrival_min > st.departure_min {
                return Err(AssignError::Supply(format!(
                    "trip {} departs stop {} before arriving",
                    st.trip, st.stop
                )));
            }
        }

        stop_times.sort_by(|a, b| a.trip.cmp(&b.trip).then(a.sequence.cmp(&b.sequence)));

        let mut trip_ranges = vec![0..0; trips.len()];
        let mut row = 0;
        while row < stop_times.len() {
            let trip = stop_times[row].trip;
            let start = row;
            while row < stop_times.len() && stop_times[row].trip == trip {
                if row > start && stop_times[row].sequence <= stop_times[row - 1].sequence {
                    return Err(AssignError::Supply(format!(
                        "trip {} has a duplicate stop sequence {}",
                        trip, stop_times[row].sequence
                    )));
                }
                row += 1;
            }
            trip_ranges[trip] = start..row;
        }

        let mut supply = Self {
            num_stops,
            num_tazs,
            stop_times,
            trips,
            trip_ranges,
            boardings_at: Vec::new(),
            alightings_at: Vec::new(),
            transfers_from: vec![Vec::new(); num_stops],
            transfers_to: vec![Vec::new(); num_stops],
            access_edges: vec![Vec::new(); num_tazs],
            egress_edges: vec![Vec::new(); num_tazs],
        };
        supply.rebuild_stop_indexes();
        Ok(supply)
    }

    pub fn with_transfers(mut self, edges: Vec<TransferEdge>) -> Result<Self> {
        for e in &edges {
            if e.from_stop >= self.num_stops || e.to_stop >= self.num_stops {
                return Err(AssignError::Supply(format!(
                    "transfer references unknown stop {} -> {}",
                    e.from_stop, e.to_stop
                )));
            }
            if !(e.time_min >= 0.0) {
                return Err(AssignError::Supply(format!(
                    "transfer {} -> {} has negative time",
                    e.from_stop, e.to_stop
                )));
            }
            self.transfers_from[e.from_stop].push(e.clone());
            self.transfers_to[e.to_stop].push(e.clone());
        }
        Ok(self)
    }

    pub fn with_access(mut self, edges: Vec<ConnectorEdge>) -> Result<Self> {
        for e in &edges {
            Self::check_connector(e, self.num_stops, self.num_tazs)?;
            self.access_edges[e.taz].push(e.clone());
        }
        Ok(self)
    }

    pub fn with_egress(mut self, edges: Vec<ConnectorEdge>) -> Result<Self> {
        for e in &edges {
            Self::check_connector(e, self.num_stops, self.num_tazs)?;
            self.egress_edges[e.taz].push(e.clone());
        }
        Ok(self)
    }

    fn check_connector(e: &ConnectorEdge, num_stops: usize, num_tazs: usize) -> Result<()> {
        if e.stop >= num_stops {
            return Err(AssignError::Supply(format!(
                "connector references unknown stop {}",
                e.stop
            )));
        }
        if e.taz >= num_tazs {
            return Err(AssignError::Supply(format!(
                "connector references unknown zone {}",
                e.taz
            )));
        }
        if !(e.time_min >= 0.0) {
            return Err(AssignError::Supply(format!(
                "connector for zone {} has negative time",
                e.taz
            )));
        }
        Ok(())
    }

    fn rebuild_stop_indexes(&mut self) {
        let mut boardings = vec![Vec::new(); self.num_stops];
        let mut alightings = vec![Vec::new(); self.num_stops];
        for (idx, st) in self.stop_times.iter().enumerate() {
            boardings[st.stop].push(idx);
            alightings[st.stop].push(idx);
        }
        for list in &mut boardings {
            list.sort_by(|&a, &b| {
                self.stop_times[a]
                    .departure_min
                    .total_cmp(&self.stop_times[b].departure_min)
            });
        }
        for list in &mut alightings {
            list.sort_by(|&a, &b| {
                self.stop_times[a]
                    .arrival_min
                    .total_cmp(&self.stop_times[b].arrival_min)
            });
        }
        self.boardings_at = boardings;
        self.alightings_at = alightings;
    }

    pub fn num_stops(&self) -> usize {
        self.num_stops
    }

    pub fn num_tazs(&self) -> usize {
        self.num_tazs
    }

    pub fn num_trips(&self) -> usize {
        self.trips.len()
    }

    pub fn stop_times(&self) -> &[StopTime] {
        &self.stop_times
    }

    pub fn trip(&self, trip: TripId) -> &TripInfo {
        &self.trips[trip]
    }

    pub fn trip_stop_times(&self, trip: TripId) -> &[StopTime] {
        &self.stop_times[self.trip_ranges[trip].clone()]
    }

    /// Row index of `(trip, sequence)` in the stop-times table.
    pub fn stop_time_index(&self, trip: TripId, sequence: u32) -> Option<usize> {
        let range = self.trip_ranges[trip].clone();
        let rows = &self.stop_times[range.clone()];
        rows.binary_search_by(|st| st.sequence.cmp(&sequence))
            .ok()
            .map(|offset| range.start + offset)
    }

    /// Board opportunities at a stop, ordered by departure time.
    pub fn boardings_at(&self, stop: StopId) -> impl Iterator<Item = &StopTime> + '_ {
        self.boardings_at[stop].iter().map(|&i| &self.stop_times[i])
    }

    /// Alight opportunities at a stop, ordered by arrival time.
    pub fn alightings_at(&self, stop: StopId) -> impl Iterator<Item = &StopTime> + '_ {
        self.alightings_at[stop].iter().map(|&i| &self.stop_times[i])
    }

    pub fn transfers_from(&self, stop: StopId) -> &[TransferEdge] {
        &self.transfers_from[stop]
    }

    pub fn transfers_to(&self, stop: StopId) -> &[TransferEdge] {
        &self.transfers_to[stop]
    }

    /// Access connectors for a zone; a zone past the loaded range simply
    /// has none.
    pub fn access_edges(&self, taz: TazId) -> &[ConnectorEdge] {
        self.access_edges.get(taz).map_or(&[], Vec::as_slice)
    }

    pub fn egress_edges(&self, taz: TazId) -> &[ConnectorEdge] {
        self.egress_edges.get(taz).map_or(&[], Vec::as_slice)
    }

    /// Capacity enforcement only runs when at least one trip declares a
    /// capacity.
    pub fn has_capacity_configured(&self) -> bool {
        self.trips.iter().any(|t| t.capacity.is_some())
    }

    /// Overwrite the per-row overcap column. `values` is aligned with
    /// [`stop_times`](Self::stop_times) order.
    pub fn apply_overcap(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.stop_times.len());
        for (st, &v) in self.stop_times.iter_mut().zip(values) {
            st.overcap = v;
        }
    }

    /// Install refreshed arrival/departure times (aligned with
    /// [`stop_times`](Self::stop_times) order) and rebuild the departure/
    /// arrival-ordered stop indexes.
    pub fn apply_schedule(&mut self, arrivals: &[f64], departures: &[f64]) {
        debug_assert_eq!(arrivals.len(), self.stop_times.len());
        debug_assert_eq!(departures.len(), self.stop_times.len());
        for (idx, st) in self.stop_times.iter_mut().enumerate() {
            st.arrival_min = arrivals[idx];
            st.departure_min = departures[idx];
        }
        self.rebuild_stop_indexes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{single_trip_supply, stop_time};

    #[test]
    fn sorts_and_indexes_stop_times() {
        // Rows deliberately out of order.
        let stop_times = vec![
            stop_time(0, 1, 2, 490.0, 490.0),
            stop_time(0, 0, 1, 480.0, 481.0),
        ];
        let supply = single_trip_supply(stop_times, None);
        let rows = supply.trip_stop_times(0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sequence, 1);
        assert_eq!(rows[1].sequence, 2);
        assert_eq!(supply.stop_time_index(0, 2), Some(1));
        assert_eq!(supply.stop_time_index(0, 3), None);

        let boardings: Vec<_> = supply.boardings_at(0).map(|st| st.sequence).collect();
        assert_eq!(boardings, vec![1]);
    }

    #[test]
    fn rejects_departure_before_arrival() {
        let stop_times = vec![stop_time(0, 0, 1, 481.0, 480.0)];
        let trips = vec![crate::test_helpers::trip_info("t1", None)];
        let err = TransitSupply::new(stop_times, trips, 2, 2).unwrap_err();
        assert!(matches!(err, AssignError::Supply(_)));
    }

    #[test]
    fn rejects_duplicate_sequence() {
        let stop_times = vec![
            stop_time(0, 0, 1, 480.0, 481.0),
            stop_time(0, 1, 1, 490.0, 490.0),
        ];
        let trips = vec![crate::test_helpers::trip_info("t1", None)];
        let err = TransitSupply::new(stop_times, trips, 2, 2).unwrap_err();
        assert!(matches!(err, AssignError::Supply(_)));
    }

    #[test]
    fn schedule_refresh_reorders_boardings() {
        let stop_times = vec![
            stop_time(0, 0, 1, 480.0, 481.0),
            stop_time(0, 1, 2, 490.0, 490.0),
            stop_time(1, 0, 1, 483.0, 484.0),
            stop_time(1, 1, 2, 493.0, 493.0),
        ];
        let trips = vec![
            crate::test_helpers::trip_info("t1", None),
            crate::test_helpers::trip_info("t2", None),
        ];
        let mut supply = TransitSupply::new(stop_times, trips, 2, 2).unwrap();

        // Delay trip 0 past trip 1.
        supply.apply_schedule(&[485.0, 495.0, 483.0, 493.0], &[486.0, 495.0, 484.0, 493.0]);
        let order: Vec<_> = supply.boardings_at(0).map(|st| st.trip).collect();
        assert_eq!(order, vec![1, 0]);
    }
}
