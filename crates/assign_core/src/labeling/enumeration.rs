//! Path extraction from label tables: the deterministic single-path walk
//! and the stochastic hyperpath sampler with dedup and post-filters.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::choice::link_generalized_cost;
use crate::demand::Request;
use crate::pathset::{LinkMode, Path, PathLink, PathSet};
use crate::supply::ConnectorEdge;

use super::engine::{fold_candidates, FoldKind, LabelTables};
use super::{
    empty_outcome, PathfindingOutcome, PerfCounters, SearchContext, SearchDir, MAX_PATH_LINKS,
};

/// A zone connector paired with a labeled trip state it can reach.
struct StartCandidate<'a> {
    edge: &'a ConnectorEdge,
    state_idx: usize,
    tot: f64,
    time_min: f64,
    trip: usize,
}

fn start_candidates<'a>(
    request: &Request,
    ctx: &'a SearchContext<'_>,
    tables: &LabelTables,
) -> Vec<StartCandidate<'a>> {
    let mut out = Vec::new();
    match tables.dir {
        SearchDir::Backward => {
            for edge in ctx.supply.access_edges(request.o_taz) {
                let bag = &tables.bags[edge.stop];
                for cand in fold_candidates(bag, 0.0, &FoldKind::Connector, ctx, &tables.weights)
                {
                    let state = &bag.states[cand.idx];
                    out.push(StartCandidate {
                        edge,
                        state_idx: cand.idx,
                        tot: cand.tot + tables.weights.access.time_min * edge.time_min,
                        time_min: state.deparr_time_min,
                        trip: state.trip.unwrap_or(usize::MAX),
                    });
                }
            }
        }
        SearchDir::Forward => {
            for edge in ctx.supply.egress_edges(request.d_taz) {
                let bag = &tables.bags[edge.stop];
                for cand in fold_candidates(bag, 0.0, &FoldKind::Connector, ctx, &tables.weights)
                {
                    let state = &bag.states[cand.idx];
                    out.push(StartCandidate {
                        edge,
                        state_idx: cand.idx,
                        tot: cand.tot + tables.weights.egress.time_min * edge.time_min,
                        time_min: state.deparr_time_min,
                        trip: state.trip.unwrap_or(usize::MAX),
                    });
                }
            }
        }
    }
    out
}

/// Select among weighted alternatives: the argmin with the direction's
/// tie-break under deterministic search, a logit draw otherwise.
fn pick_index(
    tots: &[f64],
    times: &[f64],
    trips: &[usize],
    deterministic: bool,
    theta: f64,
    dir: SearchDir,
    rng: &mut StdRng,
) -> usize {
    debug_assert!(!tots.is_empty());
    if deterministic {
        let mut best = 0;
        for i in 1..tots.len() {
            let better = if tots[i] < tots[best] - super::COST_EPS {
                true
            } else if tots[i] > tots[best] + super::COST_EPS {
                false
            } else if dir.prefers(times[i], times[best]) {
                true
            } else if dir.prefers(times[best], times[i]) {
                false
            } else {
                trips[i] < trips[best]
            };
            if better {
                best = i;
            }
        }
        return best;
    }
    if theta <= 0.0 {
        return rng.gen_range(0..tots.len());
    }
    let min = tots.iter().cloned().fold(f64::INFINITY, f64::min);
    let weights: Vec<f64> = tots.iter().map(|t| (-theta * (t - min)).exp()).collect();
    let total: f64 = weights.iter().sum();
    let draw = rng.gen::<f64>() * total;
    let mut acc = 0.0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if draw < acc {
            return i;
        }
    }
    weights.len() - 1
}

fn pick_fold_candidate(
    bag: &super::StopBag,
    cands: &[super::engine::FoldCandidate],
    deterministic: bool,
    theta: f64,
    dir: SearchDir,
    rng: &mut StdRng,
) -> usize {
    let tots: Vec<f64> = cands.iter().map(|c| c.tot).collect();
    let times: Vec<f64> = cands
        .iter()
        .map(|c| bag.states[c.idx].deparr_time_min)
        .collect();
    let trips: Vec<usize> = cands
        .iter()
        .map(|c| bag.states[c.idx].trip.unwrap_or(usize::MAX))
        .collect();
    let picked = pick_index(&tots, &times, &trips, deterministic, theta, dir, rng);
    cands[picked].idx
}

/// Walk an outbound (backward-labeled) table forward from the origin.
fn walk_backward_tables(
    ctx: &SearchContext<'_>,
    tables: &LabelTables,
    start: &StartCandidate<'_>,
    deterministic: bool,
    rng: &mut StdRng,
) -> Option<Vec<PathLink>> {
    let bags = &tables.bags;
    let weights = &tables.weights;
    let mut links: Vec<PathLink> = Vec::new();

    let mut cur = bags[start.edge.stop].states[start.state_idx].clone();
    let mut cur_stop = start.edge.stop;

    let mut access = PathLink::new(LinkMode::Access, cur_stop, cur_stop);
    access.pf_a_time_min = cur.deparr_time_min - start.edge.time_min;
    access.pf_b_time_min = cur.deparr_time_min;
    access.pf_link_time_min = start.edge.time_min;
    access.dist = start.edge.dist;
    links.push(access);
    let mut arrival = cur.deparr_time_min;

    loop {
        if links.len() > MAX_PATH_LINKS {
            return None;
        }
        let alight_stop = cur.adj_stop?;
        let trip = cur.trip?;

        let mut ride = PathLink::new(LinkMode::Transit, cur_stop, alight_stop);
        ride.trip = Some(trip);
        ride.a_seq = cur.seq;
        ride.b_seq = cur.adj_seq;
        ride.pf_a_time_min = arrival;
        ride.pf_wait_time_min = cur.deparr_time_min - arrival;
        ride.pf_b_time_min = cur.arrdep_time_min;
        ride.pf_link_time_min = ride.pf_b_time_min - ride.pf_a_time_min;
        ride.dist = cur.link_dist;
        links.push(ride);

        let arr = cur.arrdep_time_min;
        let bag = &bags[alight_stop];
        let cands = fold_candidates(bag, arr, &FoldKind::TripAlight { trip }, ctx, weights);
        if cands.is_empty() {
            return None;
        }
        let next_idx = pick_fold_candidate(bag, &cands, deterministic, tables.theta, tables.dir, rng);
        let next = bag.states[next_idx].clone();

        match next.mode {
            LinkMode::Egress => {
                let mut egress = PathLink::new(LinkMode::Egress, alight_stop, alight_stop);
                egress.pf_a_time_min = arr;
                egress.pf_b_time_min = arr + next.link_time_min;
                egress.pf_link_time_min = next.link_time_min;
                egress.dist = next.link_dist;
                links.push(egress);
                return Some(links);
            }
            LinkMode::Transfer => {
                let to_stop = next.adj_stop?;
                let mut xfer = PathLink::new(LinkMode::Transfer, alight_stop, to_stop);
                xfer.pf_a_time_min = arr;
                xfer.pf_b_time_min = arr + next.link_time_min;
                xfer.pf_link_time_min = next.link_time_min;
                xfer.dist = next.link_dist;
                links.push(xfer);

                let arr_v = arr + next.link_time_min;
                let bag_v = &bags[to_stop];
                let cands_v =
                    fold_candidates(bag_v, arr_v, &FoldKind::BoardAfterTransfer, ctx, weights);
                if cands_v.is_empty() {
                    return None;
                }
                let board_idx =
                    pick_fold_candidate(bag_v, &cands_v, deterministic, tables.theta, tables.dir, rng);
                cur = bag_v.states[board_idx].clone();
                cur_stop = to_stop;
                arrival = arr_v;
            }
            LinkMode::Transit => {
                cur = next;
                cur_stop = alight_stop;
                arrival = arr;
            }
            LinkMode::Access => return None,
        }
    }
}

/// Walk an inbound (forward-labeled) table backward from the destination,
/// then reverse into origin-to-destination order.
fn walk_forward_tables(
    ctx: &SearchContext<'_>,
    tables: &LabelTables,
    start: &StartCandidate<'_>,
    deterministic: bool,
    rng: &mut StdRng,
) -> Option<Vec<PathLink>> {
    let bags = &tables.bags;
    let weights = &tables.weights;
    let mut rev: Vec<PathLink> = Vec::new();

    let mut cur = bags[start.edge.stop].states[start.state_idx].clone();
    let mut cur_stop = start.edge.stop;

    let mut egress = PathLink::new(LinkMode::Egress, cur_stop, cur_stop);
    egress.pf_a_time_min = cur.deparr_time_min;
    egress.pf_b_time_min = cur.deparr_time_min + start.edge.time_min;
    egress.pf_link_time_min = start.edge.time_min;
    egress.dist = start.edge.dist;
    rev.push(egress);

    loop {
        if rev.len() > MAX_PATH_LINKS {
            return None;
        }
        let board_stop = cur.adj_stop?;
        let trip = cur.trip?;
        let dep = cur.arrdep_time_min;

        let bag = &bags[board_stop];
        let cands = fold_candidates(
            bag,
            dep,
            &FoldKind::TripBoard {
                trip,
                seq: cur.adj_seq,
                stop: board_stop,
            },
            ctx,
            weights,
        );
        if cands.is_empty() {
            return None;
        }
        let prev_idx = pick_fold_candidate(bag, &cands, deterministic, tables.theta, tables.dir, rng);
        let prev = bag.states[prev_idx].clone();

        let mut ride = PathLink::new(LinkMode::Transit, board_stop, cur_stop);
        ride.trip = Some(trip);
        ride.a_seq = cur.adj_seq;
        ride.b_seq = cur.seq;
        ride.pf_a_time_min = prev.deparr_time_min;
        ride.pf_wait_time_min = dep - prev.deparr_time_min;
        ride.pf_b_time_min = cur.deparr_time_min;
        ride.pf_link_time_min = ride.pf_b_time_min - ride.pf_a_time_min;
        ride.dist = cur.link_dist;
        rev.push(ride);

        match prev.mode {
            LinkMode::Access => {
                let mut access = PathLink::new(LinkMode::Access, board_stop, board_stop);
                access.pf_a_time_min = prev.arrdep_time_min;
                access.pf_b_time_min = prev.deparr_time_min;
                access.pf_link_time_min = prev.link_time_min;
                access.dist = prev.link_dist;
                rev.push(access);
                rev.reverse();
                return Some(rev);
            }
            LinkMode::Transfer => {
                let source = prev.adj_stop?;
                let mut xfer = PathLink::new(LinkMode::Transfer, source, board_stop);
                xfer.pf_a_time_min = prev.arrdep_time_min;
                xfer.pf_b_time_min = prev.deparr_time_min;
                xfer.pf_link_time_min = prev.link_time_min;
                xfer.dist = prev.link_dist;
                rev.push(xfer);

                let bag_s = &bags[source];
                let cands_s = fold_candidates(
                    bag_s,
                    prev.arrdep_time_min,
                    &FoldKind::TransferSource {
                        arrival_min: prev.arrdep_time_min,
                    },
                    ctx,
                    weights,
                );
                if cands_s.is_empty() {
                    return None;
                }
                let src_idx =
                    pick_fold_candidate(bag_s, &cands_s, deterministic, tables.theta, tables.dir, rng);
                cur = bag_s.states[src_idx].clone();
                cur_stop = source;
            }
            LinkMode::Transit => {
                cur = prev;
                cur_stop = board_stop;
            }
            LinkMode::Egress => return None,
        }
    }
}

/// Fill `pf_link_cost` along a concrete path and return the total
/// generalized cost.
fn finalize_costs(links: &mut [PathLink], ctx: &SearchContext<'_>, tables: &LabelTables) -> f64 {
    let weights = &tables.weights;
    let mut boarded = false;
    let mut total = 0.0;
    for link in links.iter_mut() {
        let row = match link.mode {
            LinkMode::Access => weights.access,
            LinkMode::Egress => weights.egress,
            LinkMode::Transfer => weights.transfer,
            LinkMode::Transit => weights.transit,
        };
        let fare = link
            .trip
            .map(|t| ctx.supply.trip(t).fare.unwrap_or(0.0))
            .unwrap_or(0.0);
        let ride = if link.mode.is_transit() {
            link.pf_link_time_min - link.pf_wait_time_min.max(0.0)
        } else {
            link.pf_link_time_min
        };
        link.pf_link_cost = link_generalized_cost(
            &row,
            link.mode,
            ride,
            link.pf_wait_time_min,
            fare,
            link.mode.is_transit() && boarded,
            ctx.config.min_transfer_penalty,
        );
        if link.mode.is_transit() {
            boarded = true;
        }
        total += link.pf_link_cost;
    }
    total
}

fn walk(
    ctx: &SearchContext<'_>,
    tables: &LabelTables,
    start: &StartCandidate<'_>,
    deterministic: bool,
    rng: &mut StdRng,
) -> Option<Vec<PathLink>> {
    match tables.dir {
        SearchDir::Backward => walk_backward_tables(ctx, tables, start, deterministic, rng),
        SearchDir::Forward => walk_forward_tables(ctx, tables, start, deterministic, rng),
    }
}

pub(crate) fn enumerate_deterministic(
    request: &Request,
    ctx: &SearchContext<'_>,
    tables: &LabelTables,
    iteration: u32,
) -> PathfindingOutcome {
    let starts = start_candidates(request, ctx, tables);
    if starts.is_empty() {
        return empty_outcome(request, iteration);
    }
    let tots: Vec<f64> = starts.iter().map(|s| s.tot).collect();
    let times: Vec<f64> = starts.iter().map(|s| s.time_min).collect();
    let trips: Vec<usize> = starts.iter().map(|s| s.trip).collect();
    let mut rng = StdRng::seed_from_u64(0);
    let best = pick_index(&tots, &times, &trips, true, tables.theta, tables.dir, &mut rng);

    match walk(ctx, tables, &starts[best], true, &mut rng) {
        Some(mut links) => {
            let cost = finalize_costs(&mut links, ctx, tables);
            let pathset = PathSet {
                request_id: request.request_id,
                paths: vec![Path::new(links, cost, 1.0)],
                no_path: None,
                pf_iteration: iteration,
            };
            PathfindingOutcome {
                pathset,
                perf: PerfCounters::default(),
            }
        }
        None => empty_outcome(request, iteration),
    }
}

type PathSignature = Vec<(i8, usize, usize, usize, u32, u32)>;

fn signature(links: &[PathLink]) -> PathSignature {
    links
        .iter()
        .map(|l| {
            let mode = match l.mode {
                LinkMode::Access => 0,
                LinkMode::Egress => 1,
                LinkMode::Transfer => 2,
                LinkMode::Transit => 3,
            };
            (
                mode,
                l.trip.map_or(usize::MAX, |t| t),
                l.a_stop,
                l.b_stop,
                l.a_seq,
                l.b_seq,
            )
        })
        .collect()
}

pub(crate) fn enumerate_stochastic(
    request: &Request,
    ctx: &SearchContext<'_>,
    tables: &LabelTables,
    iteration: u32,
) -> PathfindingOutcome {
    let starts = start_candidates(request, ctx, tables);
    if starts.is_empty() {
        return empty_outcome(request, iteration);
    }
    let start_tots: Vec<f64> = starts.iter().map(|s| s.tot).collect();
    let start_times: Vec<f64> = starts.iter().map(|s| s.time_min).collect();
    let start_trips: Vec<usize> = starts.iter().map(|s| s.trip).collect();

    let mut rng = StdRng::seed_from_u64(super::search_seed(
        ctx.base_seed,
        iteration,
        request.request_id,
    ));

    let mut paths: Vec<Path> = Vec::new();
    let mut counts: Vec<u64> = Vec::new();
    let mut seen: HashMap<PathSignature, usize> = HashMap::new();
    let mut successes: u64 = 0;

    for _ in 0..ctx.config.stochastic_pathset_size {
        let start_idx = pick_index(
            &start_tots,
            &start_times,
            &start_trips,
            false,
            tables.theta,
            tables.dir,
            &mut rng,
        );
        let links = match walk(ctx, tables, &starts[start_idx], false, &mut rng) {
            Some(l) => l,
            None => continue,
        };
        successes += 1;
        let sig = signature(&links);
        match seen.get(&sig) {
            Some(&idx) => counts[idx] += 1,
            None => {
                let mut links = links;
                let cost = finalize_costs(&mut links, ctx, tables);
                seen.insert(sig, paths.len());
                paths.push(Path::new(links, cost, 0.0));
                counts.push(1);
            }
        }
    }

    if paths.is_empty() {
        return empty_outcome(request, iteration);
    }
    for (path, &count) in paths.iter_mut().zip(&counts) {
        path.pf_probability = count as f64 / successes as f64;
    }

    // Post-filter on the logit probability of the pathfinder costs.
    let theta = tables.theta;
    let min_cost = paths
        .iter()
        .map(|p| p.pf_cost)
        .fold(f64::INFINITY, f64::min);
    let exp_sum: f64 = paths
        .iter()
        .map(|p| (-theta * (p.pf_cost - min_cost)).exp())
        .sum();
    let mut logit: Vec<f64> = paths
        .iter()
        .map(|p| (-theta * (p.pf_cost - min_cost)).exp() / exp_sum)
        .collect();

    let min_prob = ctx.config.min_path_probability;
    let keep: Vec<bool> = logit.iter().map(|&p| p >= min_prob).collect();
    if keep.iter().any(|&k| k) {
        let mut idx = 0;
        paths.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
        let mut idx = 0;
        logit.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
    }

    let max_paths = ctx.config.max_num_paths;
    if max_paths > 0 && paths.len() as i64 > max_paths {
        let mut order: Vec<usize> = (0..paths.len()).collect();
        order.sort_by(|&a, &b| logit[b].total_cmp(&logit[a]).then(a.cmp(&b)));
        order.truncate(max_paths as usize);
        order.sort_unstable();
        let mut kept: Vec<Path> = Vec::with_capacity(order.len());
        for i in order {
            kept.push(paths[i].clone());
        }
        paths = kept;
    }

    PathfindingOutcome {
        pathset: PathSet {
            request_id: request.request_id,
            paths,
            no_path: None,
            pf_iteration: iteration,
        },
        perf: PerfCounters::default(),
    }
}
