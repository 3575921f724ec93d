//! Shared labeling core for the TBSP and TBHP engines.
//!
//! The queue is keyed by label time: backward searches pop the latest time
//! first, forward searches the earliest. A stop is re-queued whenever its
//! bag improves, bounded by `stochastic_max_stop_process_count`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::choice::{LinkAttrs, LinkWeights};
use crate::demand::Request;
use crate::error::Result;
use crate::pathset::LinkMode;
use crate::supply::{StopId, TripId};

use super::{PerfCounters, SearchContext, SearchDir, StopBag, StopState, TIME_EPS};

/// Weight rows resolved once per request, one per link mode. The scorer
/// still evaluates the user-class function per link; labeling works at mode
/// granularity.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedWeights {
    pub access: LinkWeights,
    pub egress: LinkWeights,
    pub transfer: LinkWeights,
    pub transit: LinkWeights,
}

pub(crate) fn resolve_weights(
    request: &Request,
    ctx: &SearchContext<'_>,
) -> Result<ResolvedWeights> {
    let function = ctx.weights.resolve(&ctx.config.user_class_function)?;
    let row = |mode| {
        function(
            request,
            &LinkAttrs {
                mode,
                trip: None,
                link_time_min: 0.0,
                dist: 0.0,
            },
        )
    };
    Ok(ResolvedWeights {
        access: row(LinkMode::Access),
        egress: row(LinkMode::Egress),
        transfer: row(LinkMode::Transfer),
        transit: row(LinkMode::Transit),
    })
}

/// Label tables produced by one search: a state bag per stop plus the
/// request-resolved weights needed to walk them.
pub(crate) struct LabelTables {
    pub bags: Vec<StopBag>,
    pub dir: SearchDir,
    pub weights: ResolvedWeights,
    pub theta: f64,
    pub perf: PerfCounters,
}

/// Which adjacent-bag states an extension may use.
pub(crate) enum FoldKind {
    /// Backward: continuations after alighting `trip` at this stop.
    TripAlight { trip: TripId },
    /// Backward enumeration: boardable states after walking a transfer.
    BoardAfterTransfer,
    /// Forward: states that can precede boarding `trip` at this stop.
    TripBoard {
        trip: TripId,
        seq: u32,
        stop: StopId,
    },
    /// Forward enumeration: trip states whose alighting can start a
    /// transfer walk ending at `arrival_min`.
    TransferSource { arrival_min: f64 },
    /// Zone connector completion: trip states only, no wait, no window.
    Connector,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FoldCandidate {
    pub idx: usize,
    pub tot: f64,
}

/// Feasible adjacent states with their extension totals: state cost plus
/// the anchored wait plus the transfer penalty where the continuation
/// implies a re-boarding.
pub(crate) fn fold_candidates(
    bag: &StopBag,
    anchor_time: f64,
    kind: &FoldKind,
    ctx: &SearchContext<'_>,
    weights: &ResolvedWeights,
) -> Vec<FoldCandidate> {
    let window = ctx.config.time_window_min;
    let penalty = weights
        .transit
        .transfer_penalty
        .max(ctx.config.min_transfer_penalty);
    let mut out = Vec::new();
    for (idx, state) in bag.states.iter().enumerate() {
        let (feasible, wait_min, charge_penalty) = match kind {
            FoldKind::TripAlight { trip } => {
                let allowed = match state.mode {
                    LinkMode::Transit => state.trip != Some(*trip),
                    LinkMode::Transfer | LinkMode::Egress => true,
                    LinkMode::Access => false,
                };
                let slack = state.deparr_time_min - anchor_time;
                (
                    allowed && slack >= -TIME_EPS && slack <= window + TIME_EPS,
                    slack.max(0.0),
                    matches!(state.mode, LinkMode::Transit | LinkMode::Transfer),
                )
            }
            FoldKind::BoardAfterTransfer => {
                let slack = state.deparr_time_min - anchor_time;
                (
                    state.mode == LinkMode::Transit
                        && slack >= -TIME_EPS
                        && slack <= window + TIME_EPS,
                    slack.max(0.0),
                    false,
                )
            }
            FoldKind::TripBoard { trip, seq, stop } => {
                let allowed = match state.mode {
                    LinkMode::Transit => state.trip != Some(*trip),
                    LinkMode::Access | LinkMode::Transfer => true,
                    LinkMode::Egress => false,
                };
                let slack = anchor_time - state.deparr_time_min;
                let mut ok = allowed && slack >= -TIME_EPS && slack <= window + TIME_EPS;
                // A boarding that previously bumped passengers only admits
                // those who reach the stop early enough.
                if ok {
                    if let Some(earliest) = ctx.bump_wait.earliest(*trip, *seq, *stop) {
                        ok = state.deparr_time_min
                            <= earliest - ctx.bump_buffer_min + TIME_EPS;
                    }
                }
                (
                    ok,
                    slack.max(0.0),
                    matches!(state.mode, LinkMode::Transit | LinkMode::Transfer),
                )
            }
            FoldKind::TransferSource { arrival_min } => {
                let slack = *arrival_min - state.deparr_time_min;
                (
                    state.mode == LinkMode::Transit
                        && slack >= -TIME_EPS
                        && slack <= window + TIME_EPS,
                    0.0,
                    false,
                )
            }
            FoldKind::Connector => (state.mode == LinkMode::Transit, 0.0, false),
        };
        if !feasible {
            continue;
        }
        let tot = state.cost
            + weights.transit.wait_min * wait_min
            + if charge_penalty { penalty } else { 0.0 };
        out.push(FoldCandidate { idx, tot });
    }
    out
}

/// Combined value of a candidate set: the minimum under TBSP, the logit
/// expected minimum `-(1/theta) ln sum exp(-theta tot)` under TBHP.
pub(crate) fn fold_value(cands: &[FoldCandidate], hyperpath: bool, theta: f64) -> Option<f64> {
    if cands.is_empty() {
        return None;
    }
    let min = cands.iter().map(|c| c.tot).fold(f64::INFINITY, f64::min);
    if !hyperpath || theta <= 0.0 {
        return Some(min);
    }
    let sum: f64 = cands.iter().map(|c| (-theta * (c.tot - min)).exp()).sum();
    Some(min - sum.ln() / theta)
}

struct QueueEntry {
    order: f64,
    stop: StopId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.order.to_bits() == other.order.to_bits() && self.stop == other.stop
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .total_cmp(&other.order)
            .then_with(|| other.stop.cmp(&self.stop))
    }
}

impl QueueEntry {
    fn new(time_min: f64, stop: StopId, dir: SearchDir) -> Self {
        // Max-heap: backward pops the latest label time, forward the
        // earliest.
        let order = match dir {
            SearchDir::Backward => time_min,
            SearchDir::Forward => -time_min,
        };
        Self { order, stop }
    }
}

/// Run the labeling to quiescence and return the per-stop state bags.
pub(crate) fn label_stops(
    request: &Request,
    ctx: &SearchContext<'_>,
    hyperpath: bool,
) -> Result<LabelTables> {
    let weights = resolve_weights(request, ctx)?;
    let dir = SearchDir::from(request.direction);
    let theta = ctx.config.stochastic_dispersion;
    let ceiling = if !hyperpath {
        0.0
    } else if theta > 0.0 {
        // States costlier than this contribute under 1e-10 of the logsum.
        23.0 / theta
    } else {
        f64::INFINITY
    };

    let mut bags: Vec<StopBag> = vec![StopBag::default(); ctx.supply.num_stops()];
    let mut queue: BinaryHeap<QueueEntry> = BinaryHeap::new();
    let mut perf = PerfCounters::default();

    match dir {
        SearchDir::Backward => {
            for e in ctx.supply.egress_edges(request.d_taz) {
                let link_cost = weights.egress.time_min * e.time_min;
                let state = StopState {
                    mode: LinkMode::Egress,
                    trip: None,
                    adj_stop: None,
                    seq: 0,
                    adj_seq: 0,
                    deparr_time_min: request.preferred_time_min - e.time_min,
                    arrdep_time_min: request.preferred_time_min,
                    link_time_min: e.time_min,
                    link_cost,
                    link_dist: e.dist,
                    cost: link_cost,
                };
                let time = state.deparr_time_min;
                if bags[e.stop].insert(state, hyperpath, ceiling, dir) {
                    queue.push(QueueEntry::new(time, e.stop, dir));
                }
            }
        }
        SearchDir::Forward => {
            for e in ctx.supply.access_edges(request.o_taz) {
                let link_cost = weights.access.time_min * e.time_min;
                let state = StopState {
                    mode: LinkMode::Access,
                    trip: None,
                    adj_stop: None,
                    seq: 0,
                    adj_seq: 0,
                    deparr_time_min: request.preferred_time_min + e.time_min,
                    arrdep_time_min: request.preferred_time_min,
                    link_time_min: e.time_min,
                    link_cost,
                    link_dist: e.dist,
                    cost: link_cost,
                };
                let time = state.deparr_time_min;
                if bags[e.stop].insert(state, hyperpath, ceiling, dir) {
                    queue.push(QueueEntry::new(time, e.stop, dir));
                }
            }
        }
    }

    let max_process = ctx.config.stochastic_max_stop_process_count;
    while let Some(entry) = queue.pop() {
        let stop = entry.stop;
        if bags[stop].is_empty() {
            continue;
        }
        if max_process >= 0 && i64::from(bags[stop].process_count) >= max_process {
            continue;
        }
        bags[stop].process_count += 1;
        perf.label_iterations += 1;
        perf.max_stop_process_count = perf.max_stop_process_count.max(bags[stop].process_count);

        let updates = match dir {
            SearchDir::Backward => extend_backward(stop, &bags, ctx, &weights, hyperpath, theta),
            SearchDir::Forward => extend_forward(stop, &bags, ctx, &weights, hyperpath, theta),
        };
        for (target, state) in updates {
            let time = state.deparr_time_min;
            if bags[target].insert(state, hyperpath, ceiling, dir) {
                queue.push(QueueEntry::new(time, target, dir));
            }
        }
    }

    perf.num_labeled_stops = bags.iter().filter(|b| !b.is_empty()).count();
    Ok(LabelTables {
        bags,
        dir,
        weights,
        theta,
        perf,
    })
}

/// Backward extensions out of `stop`: transfers walking into it, and trips
/// alighting at it relaxed back along their stop sequences.
fn extend_backward(
    stop: StopId,
    bags: &[StopBag],
    ctx: &SearchContext<'_>,
    weights: &ResolvedWeights,
    hyperpath: bool,
    theta: f64,
) -> Vec<(StopId, StopState)> {
    let bag = &bags[stop];
    let mut out = Vec::new();

    // Transfers: walk from an upstream stop, then board here.
    for state in bag.states.iter().filter(|s| s.mode == LinkMode::Transit) {
        for edge in ctx.supply.transfers_to(stop) {
            let link_cost = weights.transfer.time_min * edge.time_min;
            out.push((
                edge.from_stop,
                StopState {
                    mode: LinkMode::Transfer,
                    trip: None,
                    adj_stop: Some(stop),
                    seq: 0,
                    adj_seq: 0,
                    deparr_time_min: state.deparr_time_min - edge.time_min,
                    arrdep_time_min: state.deparr_time_min,
                    link_time_min: edge.time_min,
                    link_cost,
                    link_dist: edge.dist,
                    cost: state.cost + link_cost,
                },
            ));
        }
    }

    // Trips alighting here within the window of some state.
    let mut min_dep = f64::INFINITY;
    let mut max_dep = f64::NEG_INFINITY;
    for s in &bag.states {
        min_dep = min_dep.min(s.deparr_time_min);
        max_dep = max_dep.max(s.deparr_time_min);
    }
    let window = ctx.config.time_window_min;
    for alight in ctx.supply.alightings_at(stop) {
        let arr = alight.arrival_min;
        if arr > max_dep + TIME_EPS {
            break;
        }
        if arr < min_dep - window - TIME_EPS {
            continue;
        }
        let trip = alight.trip;
        let cands = fold_candidates(bag, arr, &FoldKind::TripAlight { trip }, ctx, weights);
        let value = match fold_value(&cands, hyperpath, theta) {
            Some(v) => v,
            None => continue,
        };
        let fare = ctx.supply.trip(trip).fare.unwrap_or(0.0);
        for board in ctx.supply.trip_stop_times(trip) {
            if board.sequence >= alight.sequence {
                break;
            }
            let dep = board.departure_min;
            // Boardings that previously bumped passengers only admit those
            // arriving early enough.
            if let Some(earliest) = ctx.bump_wait.earliest(trip, board.sequence, board.stop) {
                if dep > earliest - ctx.bump_buffer_min + TIME_EPS {
                    continue;
                }
            }
            let ivt = arr - dep;
            if ivt < -TIME_EPS {
                continue;
            }
            let link_cost =
                weights.transit.time_min * ivt.max(0.0) + weights.transit.fare * fare;
            out.push((
                board.stop,
                StopState {
                    mode: LinkMode::Transit,
                    trip: Some(trip),
                    adj_stop: Some(stop),
                    seq: board.sequence,
                    adj_seq: alight.sequence,
                    deparr_time_min: dep,
                    arrdep_time_min: arr,
                    link_time_min: ivt.max(0.0),
                    link_cost,
                    link_dist: (alight.shape_dist - board.shape_dist).max(0.0),
                    cost: link_cost + value,
                },
            ));
        }
    }
    out
}

/// Forward extensions out of `stop`: transfers walking away from it, and
/// trips boarding at it relaxed forward along their stop sequences.
fn extend_forward(
    stop: StopId,
    bags: &[StopBag],
    ctx: &SearchContext<'_>,
    weights: &ResolvedWeights,
    hyperpath: bool,
    theta: f64,
) -> Vec<(StopId, StopState)> {
    let bag = &bags[stop];
    let mut out = Vec::new();

    for state in bag.states.iter().filter(|s| s.mode == LinkMode::Transit) {
        for edge in ctx.supply.transfers_from(stop) {
            let link_cost = weights.transfer.time_min * edge.time_min;
            out.push((
                edge.to_stop,
                StopState {
                    mode: LinkMode::Transfer,
                    trip: None,
                    adj_stop: Some(stop),
                    seq: 0,
                    adj_seq: 0,
                    deparr_time_min: state.deparr_time_min + edge.time_min,
                    arrdep_time_min: state.deparr_time_min,
                    link_time_min: edge.time_min,
                    link_cost,
                    link_dist: edge.dist,
                    cost: state.cost + link_cost,
                },
            ));
        }
    }

    let mut min_arr = f64::INFINITY;
    let mut max_arr = f64::NEG_INFINITY;
    for s in &bag.states {
        min_arr = min_arr.min(s.deparr_time_min);
        max_arr = max_arr.max(s.deparr_time_min);
    }
    let window = ctx.config.time_window_min;
    for board in ctx.supply.boardings_at(stop) {
        let dep = board.departure_min;
        if dep < min_arr - TIME_EPS {
            continue;
        }
        if dep > max_arr + window + TIME_EPS {
            break;
        }
        let trip = board.trip;
        let cands = fold_candidates(
            bag,
            dep,
            &FoldKind::TripBoard {
                trip,
                seq: board.sequence,
                stop,
            },
            ctx,
            weights,
        );
        let value = match fold_value(&cands, hyperpath, theta) {
            Some(v) => v,
            None => continue,
        };
        let fare = ctx.supply.trip(trip).fare.unwrap_or(0.0);
        for alight in ctx.supply.trip_stop_times(trip) {
            if alight.sequence <= board.sequence {
                continue;
            }
            let ivt = alight.arrival_min - dep;
            if ivt < -TIME_EPS {
                continue;
            }
            let link_cost =
                weights.transit.time_min * ivt.max(0.0) + weights.transit.fare * fare;
            out.push((
                alight.stop,
                StopState {
                    mode: LinkMode::Transit,
                    trip: Some(trip),
                    adj_stop: Some(stop),
                    seq: alight.sequence,
                    adj_seq: board.sequence,
                    deparr_time_min: alight.arrival_min,
                    arrdep_time_min: dep,
                    link_time_min: ivt.max(0.0),
                    link_cost,
                    link_dist: (alight.shape_dist - board.shape_dist).max(0.0),
                    cost: link_cost + value,
                },
            ));
        }
    }
    out
}
