use super::*;
use crate::capacity::BumpWait;
use crate::choice::WeightRegistry;
use crate::config::PathfindingConfig;
use crate::test_helpers::{
    inbound_request, outbound_request, two_parallel_trips_supply, two_stop_supply,
};

fn search<'a>(
    supply: &'a TransitSupply,
    bump_wait: &'a BumpWait,
    registry: &'a WeightRegistry,
    config: &'a PathfindingConfig,
) -> SearchContext<'a> {
    SearchContext {
        supply,
        bump_wait,
        weights: registry,
        config,
        bump_buffer_min: 5.0,
        base_seed: 42,
    }
}

#[test]
fn deterministic_outbound_single_path() {
    let supply = two_stop_supply(None);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default();
    let ctx = search(&supply, &bump_wait, &registry, &config);
    let request = outbound_request(0, 0, 1, 495.0);

    let outcome = DeterministicPathfinder
        .find_pathset(&request, &ctx, 1)
        .unwrap();
    assert!(outcome.pathset.path_found());
    assert_eq!(outcome.pathset.paths.len(), 1);
    let path = &outcome.pathset.paths[0];
    assert_eq!(path.links.len(), 3);
    assert_eq!(path.links[0].mode, LinkMode::Access);
    assert_eq!(path.links[1].mode, LinkMode::Transit);
    assert_eq!(path.links[2].mode, LinkMode::Egress);
    assert_eq!(path.links[1].trip, Some(0));
    assert!((path.pf_probability - 1.0).abs() < 1e-12);

    // Leaves the origin just in time for the 8:01 departure, arrives 8:12.
    assert!((path.links[0].pf_a_time_min - 479.0).abs() < 1e-6);
    assert!((path.links[1].pf_wait_time_min - 0.0).abs() < 1e-6);
    assert!((path.links[2].pf_b_time_min - 492.0).abs() < 1e-6);
    assert!(outcome.perf.label_iterations > 0);
}

#[test]
fn deterministic_inbound_single_path() {
    let supply = two_stop_supply(None);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default();
    let ctx = search(&supply, &bump_wait, &registry, &config);
    let request = inbound_request(0, 0, 1, 470.0);

    let outcome = DeterministicPathfinder
        .find_pathset(&request, &ctx, 1)
        .unwrap();
    let path = &outcome.pathset.paths[0];
    assert_eq!(path.links.len(), 3);
    // Departs the origin at the preferred time, waits 9 minutes at the stop.
    assert!((path.links[0].pf_a_time_min - 470.0).abs() < 1e-6);
    assert!((path.links[1].pf_wait_time_min - 9.0).abs() < 1e-6);
    assert!((path.links[2].pf_b_time_min - 492.0).abs() < 1e-6);
}

#[test]
fn outbound_and_inbound_agree_on_a_time_reversible_request() {
    let supply = two_stop_supply(None);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default();
    let ctx = search(&supply, &bump_wait, &registry, &config);

    let out = DeterministicPathfinder
        .find_pathset(&outbound_request(0, 0, 1, 492.0), &ctx, 1)
        .unwrap();
    let inb = DeterministicPathfinder
        .find_pathset(&inbound_request(0, 0, 1, 479.0), &ctx, 1)
        .unwrap();
    let out_link = &out.pathset.paths[0].links[1];
    let in_link = &inb.pathset.paths[0].links[1];
    assert_eq!(out_link.trip, in_link.trip);
    assert_eq!(out_link.a_stop, in_link.a_stop);
    assert_eq!(out_link.b_stop, in_link.b_stop);
}

#[test]
fn unreachable_origin_returns_empty_pathset() {
    let supply = two_stop_supply(None);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default().with_time_window(0.0);
    let ctx = search(&supply, &bump_wait, &registry, &config);
    // With a zero window nothing lines up with the 8:15 preferred arrival.
    let request = outbound_request(0, 0, 1, 495.0);
    let outcome = DeterministicPathfinder
        .find_pathset(&request, &ctx, 1)
        .unwrap();
    assert!(!outcome.pathset.path_found());
    assert_eq!(outcome.pathset.no_path, Some(crate::pathset::NoPathReason::NoPath));
}

#[test]
fn zero_window_still_boards_an_exact_connection() {
    let supply = two_stop_supply(None);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default().with_time_window(0.0);
    let ctx = search(&supply, &bump_wait, &registry, &config);
    // Preferred arrival 8:12 puts the egress walk exactly on the 8:10
    // arrival at stop 1.
    let request = outbound_request(0, 0, 1, 492.0);
    let outcome = DeterministicPathfinder
        .find_pathset(&request, &ctx, 1)
        .unwrap();
    assert!(outcome.pathset.path_found());
}

#[test]
fn deterministic_prefers_cheaper_parallel_trip() {
    let supply = two_parallel_trips_supply(None);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default();
    let ctx = search(&supply, &bump_wait, &registry, &config);
    let request = outbound_request(0, 0, 1, 495.0);
    let outcome = DeterministicPathfinder
        .find_pathset(&request, &ctx, 1)
        .unwrap();
    // The 8:02 trip arrives at 8:12 with less wait before the 8:13 egress
    // anchor, so it costs less than the 8:00 trip.
    assert_eq!(outcome.pathset.paths[0].links[1].trip, Some(1));
}

#[test]
fn hyperpath_samples_both_parallel_trips() {
    let supply = two_parallel_trips_supply(None);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default()
        .with_dispersion(1.0)
        .with_pathset_size(1000);
    let ctx = search(&supply, &bump_wait, &registry, &config);
    let request = outbound_request(0, 0, 1, 495.0);

    let outcome = StochasticPathfinder
        .find_pathset(&request, &ctx, 1)
        .unwrap();
    assert_eq!(outcome.pathset.paths.len(), 2);
    let freq_sum: f64 = outcome.pathset.paths.iter().map(|p| p.pf_probability).sum();
    assert!((freq_sum - 1.0).abs() < 1e-9);

    let mut by_trip = std::collections::HashMap::new();
    for path in &outcome.pathset.paths {
        by_trip.insert(path.links[1].trip.unwrap(), path.pf_probability);
    }
    let slow = by_trip[&0];
    let fast = by_trip[&1];
    assert!(fast > slow);
    // Cost gap is 4 generalized minutes, so the draw ratio tracks exp(-4).
    let expected = (-4.0_f64).exp();
    let ratio = slow / fast;
    assert!(
        ratio > expected / 3.0 && ratio < expected * 3.0,
        "ratio {ratio} vs expected {expected}"
    );
}

#[test]
fn hyperpath_is_deterministic_given_seed() {
    let supply = two_parallel_trips_supply(None);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default().with_pathset_size(200);
    let ctx = search(&supply, &bump_wait, &registry, &config);
    let request = outbound_request(3, 0, 1, 495.0);

    let a = StochasticPathfinder.find_pathset(&request, &ctx, 2).unwrap();
    let b = StochasticPathfinder.find_pathset(&request, &ctx, 2).unwrap();
    assert_eq!(a.pathset.paths.len(), b.pathset.paths.len());
    for (pa, pb) in a.pathset.paths.iter().zip(&b.pathset.paths) {
        assert_eq!(pa.pf_probability, pb.pf_probability);
        assert_eq!(pa.pf_cost, pb.pf_cost);
        assert_eq!(pa.links.len(), pb.links.len());
        for (la, lb) in pa.links.iter().zip(&pb.links) {
            assert_eq!(la.trip, lb.trip);
            assert_eq!(la.a_stop, lb.a_stop);
            assert_eq!(la.b_stop, lb.b_stop);
        }
    }
}

#[test]
fn max_num_paths_one_collapses_to_single_draw() {
    let supply = two_parallel_trips_supply(None);
    let bump_wait = BumpWait::new();
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default()
        .with_pathset_size(500)
        .with_max_num_paths(1);
    let ctx = search(&supply, &bump_wait, &registry, &config);
    let request = outbound_request(0, 0, 1, 495.0);
    let outcome = StochasticPathfinder
        .find_pathset(&request, &ctx, 1)
        .unwrap();
    assert_eq!(outcome.pathset.paths.len(), 1);
    // The kept path is the dominant one.
    assert_eq!(outcome.pathset.paths[0].links[1].trip, Some(1));
}

#[test]
fn bump_wait_forbids_late_boardings() {
    let supply = two_stop_supply(Some(1.0));
    let mut bump_wait = BumpWait::new();
    // Someone who reached the stop at 8:01 was bumped here last iteration.
    bump_wait.record(0, 1, 0, 481.0);
    let registry = WeightRegistry::new();
    let config = PathfindingConfig::default();
    let ctx = search(&supply, &bump_wait, &registry, &config);

    let request = outbound_request(0, 0, 1, 495.0);
    let outcome = DeterministicPathfinder
        .find_pathset(&request, &ctx, 2)
        .unwrap();
    // With a five-minute bump buffer the only boarding is infeasible.
    assert!(!outcome.pathset.path_found());

    // Inbound: the passenger reaches the stop at 7:57, one minute past the
    // 7:56 cutoff implied by the registry entry and the buffer.
    let inbound = inbound_request(1, 0, 1, 475.0);
    let outcome = DeterministicPathfinder
        .find_pathset(&inbound, &ctx, 2)
        .unwrap();
    assert!(!outcome.pathset.path_found());

    // A passenger arriving before the cutoff still boards.
    let early = inbound_request(2, 0, 1, 470.0);
    let outcome = DeterministicPathfinder
        .find_pathset(&early, &ctx, 2)
        .unwrap();
    assert!(outcome.pathset.path_found());
}
