//! Trip-based label engines and path enumeration.
//!
//! Outbound requests label **backward** from the destination (states carry
//! departure times and cost-to-destination), inbound requests label
//! **forward** from the origin (states carry arrival times and
//! cost-from-origin). Two engines share the labeling core:
//!
//! - [`DeterministicPathfinder`] (TBSP): one lowest-cost state per stop,
//!   single extracted path.
//! - [`StochasticPathfinder`] (TBHP): a bag of non-dominated states per
//!   stop combined through the logit logsum, with a sampled pathset.

mod engine;
mod enumeration;

use crate::capacity::BumpWait;
use crate::choice::WeightRegistry;
use crate::config::PathfindingConfig;
use crate::demand::{Direction, Request};
use crate::error::Result;
use crate::pathset::{LinkMode, NoPathReason, PathSet};
use crate::supply::{StopId, TransitSupply, TripId};

pub(crate) use engine::label_stops;

/// Cost comparisons treat differences below this as ties.
pub(crate) const COST_EPS: f64 = 1e-9;
/// Time comparisons treat differences below this as simultaneous.
pub(crate) const TIME_EPS: f64 = 1e-6;
/// Guard against pathological sampled walks.
pub(crate) const MAX_PATH_LINKS: usize = 100;

/// Which way the labels grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDir {
    /// Destination to origin, decreasing time (outbound requests).
    Backward,
    /// Origin to destination, increasing time (inbound requests).
    Forward,
}

impl From<Direction> for SearchDir {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Outbound => SearchDir::Backward,
            Direction::Inbound => SearchDir::Forward,
        }
    }
}

impl SearchDir {
    /// Under backward labeling later clock times are "earlier" in search
    /// order; under forward labeling it is the usual order.
    pub(crate) fn prefers(self, a_time: f64, b_time: f64) -> bool {
        match self {
            SearchDir::Backward => a_time > b_time + TIME_EPS,
            SearchDir::Forward => a_time < b_time - TIME_EPS,
        }
    }
}

/// One state label at a stop.
///
/// `deparr_time_min` is the anchor time at this stop (backward: departure
/// from the stop; forward: arrival at it); `arrdep_time_min` is the time at
/// the far end of the link. `cost` is the full remaining (backward) or
/// accumulated (forward) generalized cost through `adj_stop`, excluding the
/// arrival-dependent wait that the adjacent extension charges.
#[derive(Debug, Clone)]
pub struct StopState {
    pub mode: LinkMode,
    pub trip: Option<TripId>,
    pub adj_stop: Option<StopId>,
    /// This stop's sequence on `trip` (transit states only).
    pub seq: u32,
    pub adj_seq: u32,
    pub deparr_time_min: f64,
    pub arrdep_time_min: f64,
    pub link_time_min: f64,
    pub link_cost: f64,
    pub link_dist: f64,
    pub cost: f64,
}

impl StopState {
    fn key(&self) -> (u8, usize, u32, usize, u32, u64) {
        let mode = match self.mode {
            LinkMode::Access => 0,
            LinkMode::Egress => 1,
            LinkMode::Transfer => 2,
            LinkMode::Transit => 3,
        };
        (
            mode,
            self.trip.map_or(usize::MAX, |t| t),
            self.seq,
            self.adj_stop.map_or(usize::MAX, |s| s),
            self.adj_seq,
            self.deparr_time_min.to_bits(),
        )
    }
}

/// Per-stop label storage. Deterministic search keeps at most one state;
/// the hyperpath search keeps every state within the cost ceiling of the
/// best.
#[derive(Debug, Clone, Default)]
pub(crate) struct StopBag {
    pub states: Vec<StopState>,
    pub process_count: u32,
}

impl StopBag {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn min_cost(&self) -> f64 {
        self.states
            .iter()
            .map(|s| s.cost)
            .fold(f64::INFINITY, f64::min)
    }

    /// Insert under deterministic rules: keep the single best state by
    /// cost, then preferred-direction time, then smaller trip id.
    fn insert_deterministic(&mut self, state: StopState, dir: SearchDir) -> bool {
        match self.states.first() {
            None => {
                self.states.push(state);
                true
            }
            Some(cur) => {
                let replace = if state.cost < cur.cost - COST_EPS {
                    true
                } else if state.cost > cur.cost + COST_EPS {
                    false
                } else if dir.prefers(state.deparr_time_min, cur.deparr_time_min) {
                    true
                } else if dir.prefers(cur.deparr_time_min, state.deparr_time_min) {
                    false
                } else {
                    state.trip.map_or(usize::MAX, |t| t) < cur.trip.map_or(usize::MAX, |t| t)
                };
                if replace {
                    self.states[0] = state;
                }
                replace
            }
        }
    }

    /// Insert under hyperpath rules: dedup on the state key keeping the
    /// cheaper entry, then prune everything beyond `ceiling` of the
    /// cheapest state.
    fn insert_hyperpath(&mut self, state: StopState, ceiling: f64) -> bool {
        let key = state.key();
        if let Some(existing) = self.states.iter_mut().find(|s| s.key() == key) {
            if state.cost < existing.cost - COST_EPS {
                *existing = state;
            } else {
                return false;
            }
        } else {
            let min = self.min_cost();
            if state.cost > min + ceiling {
                return false;
            }
            self.states.push(state);
        }
        let min = self.min_cost();
        self.states.retain(|s| s.cost <= min + ceiling);
        true
    }

    pub fn insert(&mut self, state: StopState, hyperpath: bool, ceiling: f64, dir: SearchDir) -> bool {
        if hyperpath {
            self.insert_hyperpath(state, ceiling)
        } else {
            self.insert_deterministic(state, dir)
        }
    }
}

/// Search performance counters returned with every pathset.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfCounters {
    pub label_iterations: u64,
    pub num_labeled_stops: usize,
    pub max_stop_process_count: u32,
    pub labeling_ms: u64,
    pub enumerating_ms: u64,
}

#[derive(Debug)]
pub struct PathfindingOutcome {
    pub pathset: PathSet,
    pub perf: PerfCounters,
}

/// Everything a worker needs to search one request against an immutable
/// supply snapshot.
pub struct SearchContext<'a> {
    pub supply: &'a TransitSupply,
    pub bump_wait: &'a BumpWait,
    pub weights: &'a WeightRegistry,
    pub config: &'a PathfindingConfig,
    pub bump_buffer_min: f64,
    pub base_seed: u64,
}

/// Strategy seam for the path search; one request in, one pathset out.
/// `NoPath` is not an error: it comes back as an empty pathset.
pub trait Pathfinder: Send + Sync {
    fn find_pathset(
        &self,
        request: &Request,
        ctx: &SearchContext<'_>,
        iteration: u32,
    ) -> Result<PathfindingOutcome>;
}

/// TBSP: deterministic shortest-path labeling, single path out.
#[derive(Debug, Default)]
pub struct DeterministicPathfinder;

/// TBHP: stochastic hyperpath labeling, sampled pathset out.
#[derive(Debug, Default)]
pub struct StochasticPathfinder;

impl Pathfinder for DeterministicPathfinder {
    fn find_pathset(
        &self,
        request: &Request,
        ctx: &SearchContext<'_>,
        iteration: u32,
    ) -> Result<PathfindingOutcome> {
        find_with(request, ctx, iteration, false)
    }
}

impl Pathfinder for StochasticPathfinder {
    fn find_pathset(
        &self,
        request: &Request,
        ctx: &SearchContext<'_>,
        iteration: u32,
    ) -> Result<PathfindingOutcome> {
        find_with(request, ctx, iteration, true)
    }
}

fn find_with(
    request: &Request,
    ctx: &SearchContext<'_>,
    iteration: u32,
    hyperpath: bool,
) -> Result<PathfindingOutcome> {
    let label_start = std::time::Instant::now();
    let tables = label_stops(request, ctx, hyperpath)?;
    let labeling_ms = label_start.elapsed().as_millis() as u64;

    let enum_start = std::time::Instant::now();
    let mut outcome = if hyperpath {
        enumeration::enumerate_stochastic(request, ctx, &tables, iteration)
    } else {
        enumeration::enumerate_deterministic(request, ctx, &tables, iteration)
    };
    let enumerating_ms = enum_start.elapsed().as_millis() as u64;

    outcome.perf.label_iterations = tables.perf.label_iterations;
    outcome.perf.num_labeled_stops = tables.perf.num_labeled_stops;
    outcome.perf.max_stop_process_count = tables.perf.max_stop_process_count;
    outcome.perf.labeling_ms = labeling_ms;
    outcome.perf.enumerating_ms = enumerating_ms;
    Ok(outcome)
}

/// Engine selection for the configured pathfinding kind; `File` has no
/// engine and is handled by the driver.
pub fn make_pathfinder(kind: crate::config::PathfindingKind) -> Option<Box<dyn Pathfinder>> {
    match kind {
        crate::config::PathfindingKind::Deterministic => {
            Some(Box::new(DeterministicPathfinder))
        }
        crate::config::PathfindingKind::Stochastic => Some(Box::new(StochasticPathfinder)),
        crate::config::PathfindingKind::File => None,
    }
}

/// Seed for a request's sampling RNG: stable across worker assignments so
/// single- and multi-process runs draw identical pathsets.
pub(crate) fn search_seed(base_seed: u64, iteration: u32, request_id: usize) -> u64 {
    crate::choice::choice_seed(base_seed ^ 0xf0e1_d2c3_b4a5_9687, iteration, u32::MAX, request_id)
}

pub(crate) fn empty_outcome(request: &Request, iteration: u32) -> PathfindingOutcome {
    PathfindingOutcome {
        pathset: PathSet::empty(request.request_id, NoPathReason::NoPath, iteration),
        perf: PerfCounters::default(),
    }
}

#[cfg(test)]
mod tests;
