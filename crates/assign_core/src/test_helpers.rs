//! Tiny networks and fixtures shared across test modules.

use crate::demand::{Direction, Request};
use crate::pathset::{ChosenStatus, LinkMode, Path, PathLink, PathSet};
use crate::supply::{ConnectorEdge, StopId, StopTime, TransitSupply, TripId, TripInfo};

pub fn stop_time(trip: TripId, stop: StopId, sequence: u32, arrival: f64, departure: f64) -> StopTime {
    StopTime {
        trip,
        stop,
        sequence,
        arrival_min: arrival,
        departure_min: departure,
        overcap: 0.0,
        shape_dist: 0.0,
    }
}

pub fn trip_info(external_id: &str, capacity: Option<f64>) -> TripInfo {
    TripInfo {
        external_id: external_id.to_string(),
        route_id: format!("route_{external_id}"),
        service_id: "weekday".to_string(),
        direction_id: None,
        mode: None,
        capacity,
        seated_capacity: None,
        fare: None,
    }
}

pub fn connector(taz: usize, stop: StopId, time_min: f64) -> ConnectorEdge {
    ConnectorEdge {
        taz,
        stop,
        time_min,
        dist: 0.1 * time_min,
    }
}

/// One trip over the given stop times; stop and zone counts inferred.
pub fn single_trip_supply(stop_times: Vec<StopTime>, capacity: Option<f64>) -> TransitSupply {
    let num_stops = stop_times.iter().map(|st| st.stop + 1).max().unwrap_or(1);
    TransitSupply::new(stop_times, vec![trip_info("t1", capacity)], num_stops, 2)
        .expect("valid test supply")
}

/// One two-stop trip: depart stop 0 at 8:01 (arrive 8:00), arrive stop 1 at
/// 8:10. Zone 0 walks to stop 0, stop 1 walks to zone 1, two minutes each.
pub fn two_stop_supply(capacity: Option<f64>) -> TransitSupply {
    let stop_times = vec![
        stop_time(0, 0, 1, 480.0, 481.0),
        stop_time(0, 1, 2, 490.0, 490.0),
    ];
    TransitSupply::new(stop_times, vec![trip_info("t1", capacity)], 2, 2)
        .expect("valid test supply")
        .with_access(vec![connector(0, 0, 2.0)])
        .expect("valid access")
        .with_egress(vec![connector(1, 1, 2.0)])
        .expect("valid egress")
}

/// Two parallel trips from stop 0 to stop 1, leaving at 8:00 and 8:02.
pub fn two_parallel_trips_supply(capacity: Option<f64>) -> TransitSupply {
    let stop_times = vec![
        stop_time(0, 0, 1, 480.0, 480.0),
        stop_time(0, 1, 2, 490.0, 490.0),
        stop_time(1, 0, 1, 482.0, 482.0),
        stop_time(1, 1, 2, 492.0, 492.0),
    ];
    let trips = vec![trip_info("t1", capacity), trip_info("t2", capacity)];
    TransitSupply::new(stop_times, trips, 2, 2)
        .expect("valid test supply")
        .with_access(vec![connector(0, 0, 2.0)])
        .expect("valid access")
        .with_egress(vec![connector(1, 1, 2.0)])
        .expect("valid egress")
}

/// A two-leg connection through stop 1: trip 0 runs stop 0 to stop 1
/// arriving at `arr_x`, trip 1 runs stop 1 to stop 2 departing at `dep_b`.
pub fn two_trip_transfer_supply(arr_x: f64, dep_b: f64) -> TransitSupply {
    let stop_times = vec![
        stop_time(0, 0, 1, 479.0, 480.0),
        stop_time(0, 1, 2, arr_x, arr_x),
        stop_time(1, 1, 1, dep_b, dep_b),
        stop_time(1, 2, 2, dep_b + 10.0, dep_b + 10.0),
    ];
    let trips = vec![trip_info("t1", None), trip_info("t2", None)];
    TransitSupply::new(stop_times, trips, 3, 2)
        .expect("valid test supply")
        .with_access(vec![connector(0, 0, 2.0)])
        .expect("valid access")
        .with_egress(vec![connector(1, 2, 2.0)])
        .expect("valid egress")
}

pub fn outbound_request(request_id: usize, o_taz: usize, d_taz: usize, pref_min: f64) -> Request {
    Request {
        person_id: format!("p{request_id}"),
        request_id,
        o_taz,
        d_taz,
        direction: Direction::Outbound,
        preferred_time_min: pref_min,
        user_class: "all".to_string(),
        purpose: "work".to_string(),
        access_mode: "walk".to_string(),
        transit_mode: "transit".to_string(),
        egress_mode: "walk".to_string(),
        vot: 10.0,
    }
}

pub fn inbound_request(request_id: usize, o_taz: usize, d_taz: usize, pref_min: f64) -> Request {
    Request {
        direction: Direction::Inbound,
        ..outbound_request(request_id, o_taz, d_taz, pref_min)
    }
}

/// A chosen one-seat pathset on `two_stop_supply`: access to stop 0, ride
/// `(trip, a_seq..b_seq)` to stop 1, egress.
pub fn chosen_transit_pathset(request_id: usize, trip: TripId, a_seq: u32, b_seq: u32) -> PathSet {
    let mut access = PathLink::new(LinkMode::Access, 0, 0);
    access.pf_a_time_min = 478.0;
    access.pf_b_time_min = 480.0;
    access.pf_link_time_min = 2.0;

    let mut ride = PathLink::new(LinkMode::Transit, 0, 1);
    ride.trip = Some(trip);
    ride.a_seq = a_seq;
    ride.b_seq = b_seq;
    ride.pf_a_time_min = 480.0;
    ride.pf_wait_time_min = 1.0;
    ride.pf_b_time_min = 490.0;
    ride.pf_link_time_min = 10.0;
    ride.sim_a_time_min = 480.0;

    let mut egress = PathLink::new(LinkMode::Egress, 1, 1);
    egress.pf_a_time_min = 490.0;
    egress.pf_b_time_min = 492.0;
    egress.pf_link_time_min = 2.0;

    let mut path = Path::new(vec![access, ride, egress], 20.0, 1.0);
    path.chosen = ChosenStatus::Chosen {
        iteration: 1,
        sim_iter: 0,
    };
    path.probability = 1.0;
    PathSet {
        request_id,
        paths: vec![path],
        no_path: None,
        pf_iteration: 1,
    }
}

/// A chosen two-leg pathset on `two_trip_transfer_supply`: same-stop
/// connection from trip 0 to trip 1 at stop 1.
pub fn transfer_pathset(request_id: usize) -> PathSet {
    let mut access = PathLink::new(LinkMode::Access, 0, 0);
    access.pf_a_time_min = 477.0;
    access.pf_b_time_min = 479.0;
    access.pf_link_time_min = 2.0;

    let mut first = PathLink::new(LinkMode::Transit, 0, 1);
    first.trip = Some(0);
    first.a_seq = 1;
    first.b_seq = 2;
    first.pf_a_time_min = 479.0;
    first.pf_wait_time_min = 1.0;
    first.pf_b_time_min = 490.0;
    first.pf_link_time_min = 11.0;

    let mut second = PathLink::new(LinkMode::Transit, 1, 2);
    second.trip = Some(1);
    second.a_seq = 1;
    second.b_seq = 2;
    second.pf_a_time_min = 490.0;
    second.pf_wait_time_min = 5.0;
    second.pf_b_time_min = 505.0;
    second.pf_link_time_min = 15.0;

    let mut egress = PathLink::new(LinkMode::Egress, 2, 2);
    egress.pf_a_time_min = 505.0;
    egress.pf_b_time_min = 507.0;
    egress.pf_link_time_min = 2.0;

    let mut path = Path::new(vec![access, first, second, egress], 40.0, 1.0);
    path.chosen = ChosenStatus::Chosen {
        iteration: 1,
        sim_iter: 0,
    };
    path.probability = 1.0;
    PathSet {
        request_id,
        paths: vec![path],
        no_path: None,
        pf_iteration: 1,
    }
}
