//! Path scoring and route choice: generalized cost from user-class weights,
//! path-size overlap correction, logit probabilities, and the seeded draw.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{OverlapVariable, PathfindingConfig};
use crate::demand::Request;
use crate::error::{AssignError, Result};
use crate::pathset::{ChosenStatus, LinkMode, Path, PathSet};
use crate::supply::{TransitSupply, TripId};

/// Weight row applied to one link's attributes. `time_min` weighs the
/// link's own minutes in motion (in-vehicle for transit, walking
/// otherwise); `wait_min` weighs the wait before a boarding and only
/// applies to transit links.
#[derive(Debug, Clone, Copy)]
pub struct LinkWeights {
    pub time_min: f64,
    pub wait_min: f64,
    pub transfer_penalty: f64,
    pub fare: f64,
}

/// Attributes handed to a user-class function when selecting a weight row.
#[derive(Debug, Clone, Copy)]
pub struct LinkAttrs {
    pub mode: LinkMode,
    pub trip: Option<TripId>,
    pub link_time_min: f64,
    pub dist: f64,
}

pub type UserClassFn = dyn Fn(&Request, &LinkAttrs) -> LinkWeights + Send + Sync;

/// Named registry of user-class weight functions. A compiled default,
/// `generic_user_class`, is always present.
pub struct WeightRegistry {
    functions: HashMap<String, Arc<UserClassFn>>,
}

impl Default for WeightRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
        };
        registry.register("generic_user_class", Arc::new(generic_user_class));
        registry
    }

    pub fn register(&mut self, name: &str, function: Arc<UserClassFn>) {
        self.functions.insert(name.to_string(), function);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<UserClassFn>> {
        self.functions.get(name).cloned().ok_or_else(|| {
            AssignError::Configuration(format!("user class function [{name}] not defined"))
        })
    }
}

/// Default weight row: in-vehicle minutes at 1.0, waits doubled, walking
/// doubled, and fares converted through the request's value of time.
pub fn generic_user_class(request: &Request, link: &LinkAttrs) -> LinkWeights {
    let fare_weight = if request.vot > 0.0 {
        60.0 / request.vot
    } else {
        0.0
    };
    match link.mode {
        LinkMode::Transit => LinkWeights {
            time_min: 1.0,
            wait_min: 2.0,
            transfer_penalty: 5.0,
            fare: fare_weight,
        },
        LinkMode::Transfer => LinkWeights {
            time_min: 2.5,
            wait_min: 2.0,
            transfer_penalty: 5.0,
            fare: fare_weight,
        },
        LinkMode::Access | LinkMode::Egress => LinkWeights {
            time_min: 2.0,
            wait_min: 2.0,
            transfer_penalty: 5.0,
            fare: fare_weight,
        },
    }
}

/// Generalized cost of one link given its realized (or pathfinding) time
/// and wait. `boarding_after_transfer` charges the per-transfer penalty,
/// floored by the configured minimum.
pub fn link_generalized_cost(
    weights: &LinkWeights,
    mode: LinkMode,
    link_time_min: f64,
    wait_time_min: f64,
    fare: f64,
    boarding_after_transfer: bool,
    min_transfer_penalty: f64,
) -> f64 {
    let mut cost = weights.time_min * link_time_min;
    if mode.is_transit() {
        cost += weights.wait_min * wait_time_min.max(0.0);
        cost += weights.fare * fare;
        if boarding_after_transfer {
            cost += weights.transfer_penalty.max(min_transfer_penalty);
        }
    }
    cost
}

/// Recompute realized link and path costs for every path in every pathset,
/// then the path-size correction and the logit probabilities.
///
/// After this pass, `sum(p.probability) == 1` within float tolerance for
/// every non-empty pathset.
pub fn calculate_cost(
    pathsets: &mut [PathSet],
    requests: &[Request],
    supply: &TransitSupply,
    registry: &WeightRegistry,
    config: &PathfindingConfig,
) -> Result<()> {
    let dispersion = config.stochastic_dispersion;
    for pathset in pathsets.iter_mut() {
        if !pathset.path_found() {
            continue;
        }
        let request = &requests[pathset.request_id];
        let user_class = registry.resolve(&config.user_class_function)?;

        for path in &mut pathset.paths {
            let mut total = 0.0;
            let mut boarded_before = false;
            for link in &mut path.links {
                let attrs = LinkAttrs {
                    mode: link.mode,
                    trip: link.trip,
                    link_time_min: link.sim_link_time_min,
                    dist: link.dist,
                };
                let weights = user_class(request, &attrs);
                let fare = link
                    .trip
                    .map(|t| supply.trip(t).fare.unwrap_or(0.0))
                    .unwrap_or(0.0);
                let ride_time = if link.mode.is_transit() {
                    link.sim_link_time_min - link.sim_wait_time_min.max(0.0)
                } else {
                    link.sim_link_time_min
                };
                link.sim_cost = link_generalized_cost(
                    &weights,
                    link.mode,
                    ride_time,
                    link.sim_wait_time_min,
                    fare,
                    link.mode.is_transit() && boarded_before,
                    config.min_transfer_penalty,
                );
                if link.mode.is_transit() {
                    boarded_before = true;
                }
                total += link.sim_cost;
            }
            path.sim_cost = total;
        }

        apply_path_size(pathset, supply, config);
        apply_logit(pathset, dispersion);
    }
    Ok(())
}

/// Key identifying a shareable transit segment for overlap purposes.
type SegmentKey = (TripId, u32, u32);

/// Path-size overlap correction: for each path,
/// `PS = sum over segments of (t/T) / sum over sharing paths of (T/T_j)^gamma`,
/// stored as `ln PS`. Only transit segments participate.
fn apply_path_size(pathset: &mut PathSet, supply: &TransitSupply, config: &PathfindingConfig) {
    let n = pathset.paths.len();
    if n == 0 {
        return;
    }
    if n == 1 {
        pathset.paths[0].ln_path_size = 0.0;
        return;
    }

    // Segment lists and total lengths per path.
    let mut segments: Vec<Vec<(SegmentKey, f64)>> = Vec::with_capacity(n);
    let mut totals: Vec<f64> = Vec::with_capacity(n);
    for path in &pathset.paths {
        let segs = path_segments(path, supply, config);
        let total: f64 = segs.iter().map(|(_, t)| t).sum();
        segments.push(segs);
        totals.push(total.max(f64::MIN_POSITIVE));
    }

    // Which paths use each segment.
    let mut users: HashMap<SegmentKey, Vec<usize>> = HashMap::new();
    for (path_idx, segs) in segments.iter().enumerate() {
        for (key, _) in segs {
            let entry = users.entry(*key).or_default();
            if entry.last() != Some(&path_idx) {
                entry.push(path_idx);
            }
        }
    }

    let gamma = config.overlap_scale_parameter;
    for (path_idx, path) in pathset.paths.iter_mut().enumerate() {
        let total = totals[path_idx];
        let mut ps = 0.0;
        for (key, t) in &segments[path_idx] {
            let denom: f64 = users[key]
                .iter()
                .map(|&j| (total / totals[j]).powf(gamma))
                .sum();
            ps += (t / total) / denom;
        }
        // A path with no transit segments (degenerate) counts as unshared.
        if segments[path_idx].is_empty() {
            ps = 1.0;
        }
        path.ln_path_size = ps.max(f64::MIN_POSITIVE).min(1.0).ln();
    }
}

/// Transit segments of a path with their overlap measure. Whole legs keyed
/// by (trip, board seq, alight seq), or stop-to-stop pieces when
/// `overlap_split_transit` is set.
fn path_segments(
    path: &Path,
    supply: &TransitSupply,
    config: &PathfindingConfig,
) -> Vec<(SegmentKey, f64)> {
    let mut segments = Vec::new();
    for link in path.transit_links() {
        let trip = match link.trip {
            Some(t) => t,
            None => continue,
        };
        if config.overlap_split_transit {
            let rows = supply.trip_stop_times(trip);
            let mut prev: Option<&crate::supply::StopTime> = None;
            for row in rows {
                if row.sequence < link.a_seq || row.sequence > link.b_seq {
                    continue;
                }
                if let Some(p) = prev {
                    let value = match config.overlap_variable {
                        OverlapVariable::Count => 1.0,
                        OverlapVariable::Time => (row.arrival_min - p.departure_min).max(0.0),
                        OverlapVariable::Distance => {
                            let d = row.shape_dist - p.shape_dist;
                            if d > 0.0 {
                                d
                            } else {
                                (row.arrival_min - p.departure_min).max(0.0)
                            }
                        }
                    };
                    segments.push(((trip, p.sequence, row.sequence), value));
                }
                prev = Some(row);
            }
        } else {
            let value = match config.overlap_variable {
                OverlapVariable::Count => 1.0,
                OverlapVariable::Time => (link.pf_link_time_min - link.pf_wait_time_min).max(0.0),
                OverlapVariable::Distance => {
                    if link.dist > 0.0 {
                        link.dist
                    } else {
                        (link.pf_link_time_min - link.pf_wait_time_min).max(0.0)
                    }
                }
            };
            segments.push(((trip, link.a_seq, link.b_seq), value));
        }
    }
    segments
}

/// Logit over `-theta * cost + ln PS`, max-shifted for stability. Also
/// stores the logsum on every path.
fn apply_logit(pathset: &mut PathSet, dispersion: f64) {
    let utilities: Vec<f64> = pathset
        .paths
        .iter()
        .map(|p| -dispersion * p.sim_cost + p.ln_path_size)
        .collect();
    let max_u = utilities.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp_sum: f64 = utilities.iter().map(|u| (u - max_u).exp()).sum();
    let logsum = max_u + exp_sum.ln();
    for (path, u) in pathset.paths.iter_mut().zip(&utilities) {
        path.probability = (u - max_u).exp() / exp_sum;
        path.logsum = logsum;
    }
}

/// Stable per-request RNG seed. Worker identity never enters the
/// derivation, so 1-process and N-process runs draw identically.
pub fn choice_seed(base_seed: u64, iteration: u32, sim_iter: u32, request_id: usize) -> u64 {
    let mut h = base_seed ^ 0x9e37_79b9_7f4a_7c15;
    for v in [u64::from(iteration), u64::from(sim_iter), request_id as u64] {
        h ^= v.wrapping_add(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(h << 6)
            .wrapping_add(h >> 2);
        h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    }
    h
}

/// Draw a path per request according to the current probabilities.
///
/// When `choose_everyone` is false only requests without a currently
/// chosen path draw (never-chosen, rejected, or freshly bumped). Bumped
/// paths are never eligible. Returns the number of new choices made.
pub fn choose_paths(
    pathsets: &mut [PathSet],
    iteration: u32,
    sim_iter: u32,
    choose_everyone: bool,
    base_seed: u64,
) -> usize {
    let mut num_chosen = 0;
    for pathset in pathsets.iter_mut() {
        if !pathset.path_found() {
            continue;
        }
        let needs_choice = choose_everyone || pathset.chosen_path().is_none();
        if !needs_choice {
            continue;
        }
        // Re-choosing: demote the previous pick.
        if let Some(prev) = pathset.chosen_path_mut() {
            prev.chosen = ChosenStatus::Rejected;
        }

        let eligible: Vec<usize> = pathset
            .paths
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_bumped() && p.probability > 0.0)
            .map(|(i, _)| i)
            .collect();
        if eligible.is_empty() {
            continue;
        }

        let total: f64 = eligible.iter().map(|&i| pathset.paths[i].probability).sum();
        let mut rng =
            StdRng::seed_from_u64(choice_seed(base_seed, iteration, sim_iter, pathset.request_id));
        let draw: f64 = rng.gen::<f64>() * total;
        let mut acc = 0.0;
        let mut picked = *eligible.last().expect("eligible is non-empty");
        for &i in &eligible {
            acc += pathset.paths[i].probability;
            if draw < acc {
                picked = i;
                break;
            }
        }
        pathset.paths[picked].chosen = ChosenStatus::Chosen {
            iteration,
            sim_iter,
        };
        num_chosen += 1;
        debug!(
            "request {} chose path {} (p={:.4})",
            pathset.request_id, picked, pathset.paths[picked].probability
        );
    }
    num_chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathset::PathLink;
    use crate::test_helpers::{outbound_request, two_parallel_trips_supply};

    fn transit_path(trip: TripId, cost: f64) -> Path {
        let mut link = PathLink::new(LinkMode::Transit, 0, 1);
        link.trip = Some(trip);
        link.a_seq = 1;
        link.b_seq = 2;
        link.sim_link_time_min = 10.0;
        link.pf_link_time_min = 10.0;
        let mut path = Path::new(vec![link], cost, 0.5);
        path.sim_cost = cost;
        path
    }

    #[test]
    fn probabilities_sum_to_one() {
        let mut pathset = PathSet {
            request_id: 0,
            paths: vec![transit_path(0, 10.0), transit_path(1, 12.0)],
            no_path: None,
            pf_iteration: 1,
        };
        apply_logit(&mut pathset, 1.0);
        let sum: f64 = pathset.paths.iter().map(|p| p.probability).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        // Cheaper path dominates, ratio is exp(delta cost).
        let ratio = pathset.paths[0].probability / pathset.paths[1].probability;
        assert!((ratio - (2.0_f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn high_dispersion_collapses_to_argmin() {
        let mut pathset = PathSet {
            request_id: 0,
            paths: vec![transit_path(0, 10.0), transit_path(1, 10.5)],
            no_path: None,
            pf_iteration: 1,
        };
        apply_logit(&mut pathset, 1e6);
        assert!(pathset.paths[0].probability > 0.999_999);
    }

    #[test]
    fn path_size_in_unit_interval_and_penalizes_overlap() {
        let supply = two_parallel_trips_supply(None);
        let config = PathfindingConfig::default();
        // Two distinct trips: no overlap, PS = 1 so ln PS = 0.
        let mut distinct = PathSet {
            request_id: 0,
            paths: vec![transit_path(0, 10.0), transit_path(1, 10.0)],
            no_path: None,
            pf_iteration: 1,
        };
        apply_path_size(&mut distinct, &supply, &config);
        for p in &distinct.paths {
            assert!(p.ln_path_size.abs() < 1e-12);
        }

        // Identical trips: fully shared, PS = 1/2.
        let mut shared = PathSet {
            request_id: 0,
            paths: vec![transit_path(0, 10.0), transit_path(0, 10.0)],
            no_path: None,
            pf_iteration: 1,
        };
        apply_path_size(&mut shared, &supply, &config);
        for p in &shared.paths {
            let ps = p.ln_path_size.exp();
            assert!(ps > 0.0 && ps <= 1.0);
            assert!((ps - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn chooser_is_deterministic_per_seed() {
        let make = || PathSet {
            request_id: 7,
            paths: vec![transit_path(0, 10.0), transit_path(1, 10.2)],
            no_path: None,
            pf_iteration: 1,
        };
        let mut a = vec![make()];
        let mut b = vec![make()];
        apply_logit(&mut a[0], 1.0);
        apply_logit(&mut b[0], 1.0);
        assert_eq!(choose_paths(&mut a, 1, 0, true, 42), 1);
        assert_eq!(choose_paths(&mut b, 1, 0, true, 42), 1);
        let pick_a = a[0].paths.iter().position(|p| p.chosen.is_chosen());
        let pick_b = b[0].paths.iter().position(|p| p.chosen.is_chosen());
        assert_eq!(pick_a, pick_b);
    }

    #[test]
    fn bumped_paths_not_rechosen() {
        let mut pathset = PathSet {
            request_id: 0,
            paths: vec![transit_path(0, 10.0), transit_path(1, 10.2)],
            no_path: None,
            pf_iteration: 1,
        };
        apply_logit(&mut pathset, 1.0);
        pathset.paths[0].bump_iter = 0;
        let mut sets = vec![pathset];
        choose_paths(&mut sets, 1, 1, false, 0);
        let chosen = sets[0].chosen_path().expect("second path chosen");
        assert_eq!(chosen.links[0].trip, Some(1));
    }

    #[test]
    fn unknown_user_class_function_is_configuration_error() {
        let registry = WeightRegistry::new();
        assert!(matches!(
            registry.resolve("no_such_function"),
            Err(AssignError::Configuration(_))
        ));
        registry.resolve("generic_user_class").unwrap();
        // keep the request helper exercised
        let req = outbound_request(0, 0, 1, 490.0);
        let attrs = LinkAttrs {
            mode: LinkMode::Transit,
            trip: Some(0),
            link_time_min: 10.0,
            dist: 0.0,
        };
        let w = generic_user_class(&req, &attrs);
        assert_eq!(w.time_min, 1.0);
    }
}
