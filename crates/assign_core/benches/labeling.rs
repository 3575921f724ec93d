use criterion::{black_box, criterion_group, criterion_main, Criterion};

use assign_core::capacity::BumpWait;
use assign_core::choice::WeightRegistry;
use assign_core::config::PathfindingConfig;
use assign_core::labeling::{
    DeterministicPathfinder, Pathfinder, SearchContext, StochasticPathfinder,
};
use assign_core::supply::{ConnectorEdge, StopTime, TransitSupply, TransferEdge, TripInfo};
use assign_core::test_helpers::outbound_request;

/// A corridor of `num_stops` stops served by `num_trips` staggered trips,
/// with walk transfers between neighboring stops.
fn corridor_supply(num_stops: usize, num_trips: usize) -> TransitSupply {
    let mut stop_times = Vec::new();
    let mut trips = Vec::new();
    for trip in 0..num_trips {
        trips.push(TripInfo {
            external_id: format!("t{trip}"),
            route_id: "corridor".to_string(),
            service_id: "weekday".to_string(),
            direction_id: Some(0),
            mode: None,
            capacity: Some(40.0),
            seated_capacity: None,
            fare: None,
        });
        let start = 420.0 + 3.0 * trip as f64;
        for stop in 0..num_stops {
            let t = start + 2.0 * stop as f64;
            stop_times.push(StopTime {
                trip,
                stop,
                sequence: stop as u32 + 1,
                arrival_min: t,
                departure_min: t + 0.5,
                overcap: 0.0,
                shape_dist: 0.4 * stop as f64,
            });
        }
    }
    let transfers: Vec<TransferEdge> = (1..num_stops)
        .map(|s| TransferEdge {
            from_stop: s - 1,
            to_stop: s,
            time_min: 4.0,
            dist: 0.3,
        })
        .collect();
    TransitSupply::new(stop_times, trips, num_stops, 2)
        .unwrap()
        .with_transfers(transfers)
        .unwrap()
        .with_access(vec![ConnectorEdge {
            taz: 0,
            stop: 0,
            time_min: 3.0,
            dist: 0.2,
        }])
        .unwrap()
        .with_egress(vec![ConnectorEdge {
            taz: 1,
            stop: num_stops - 1,
            time_min: 3.0,
            dist: 0.2,
        }])
        .unwrap()
}

fn bench_labeling(c: &mut Criterion) {
    let supply = corridor_supply(40, 12);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default().with_pathset_size(100);
    let ctx = SearchContext {
        supply: &supply,
        bump_wait: &bump_wait,
        weights: &registry,
        config: &config,
        bump_buffer_min: 5.0,
        base_seed: 17,
    };
    let request = outbound_request(0, 0, 1, 540.0);

    c.bench_function("tbsp_corridor", |b| {
        b.iter(|| {
            let outcome = DeterministicPathfinder
                .find_pathset(black_box(&request), &ctx, 1)
                .unwrap();
            black_box(outcome.pathset.paths.len())
        })
    });

    c.bench_function("tbhp_corridor", |b| {
        b.iter(|| {
            let outcome = StochasticPathfinder
                .find_pathset(black_box(&request), &ctx, 1)
                .unwrap();
            black_box(outcome.pathset.paths.len())
        })
    });
}

criterion_group!(benches, bench_labeling);
criterion_main!(benches);
