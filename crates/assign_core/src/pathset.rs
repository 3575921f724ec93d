//! Paths, path links and per-request pathsets.
//!
//! A path is an alternating sequence access, trip, (transfer, trip)*,
//! egress. Links carry two families of times: the `pf_*` fields are what the
//! pathfinder believed when the path was generated; the `sim_*` fields are
//! realized against the current vehicle schedule each simulation iteration.

use serde::{Deserialize, Serialize};

use crate::supply::{StopId, TripId};

/// Mode code for access links in result records.
pub const MODE_ACCESS: i32 = -100;
/// Mode code for egress links in result records.
pub const MODE_EGRESS: i32 = -101;
/// Mode code for stop-to-stop transfer links in result records.
pub const MODE_TRANSFER: i32 = -102;
/// Mode code for transit links whose route mode is unknown.
pub const MODE_GENERIC_TRANSIT: i32 = -103;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMode {
    Access,
    Egress,
    Transfer,
    Transit,
}

impl LinkMode {
    /// Result-record mode code. Transit links report their route mode when
    /// one is known, else [`MODE_GENERIC_TRANSIT`].
    pub fn code(self, route_mode: Option<i32>) -> i32 {
        match self {
            LinkMode::Access => MODE_ACCESS,
            LinkMode::Egress => MODE_EGRESS,
            LinkMode::Transfer => MODE_TRANSFER,
            LinkMode::Transit => route_mode.unwrap_or(MODE_GENERIC_TRANSIT),
        }
    }

    pub fn is_transit(self) -> bool {
        matches!(self, LinkMode::Transit)
    }
}

/// Chosen-status ordinal of a path.
///
/// Not-chosen-yet and rejected sort below every chosen tag; a chosen tag
/// records the outer iteration and the simulation sub-iteration of the draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ChosenStatus {
    NotChosenYet,
    Rejected,
    Chosen { iteration: u32, sim_iter: u32 },
}

impl ChosenStatus {
    /// Numeric form used in output records: -1, -2, or
    /// `iteration + sim_iter / 100`.
    pub fn ordinal(self) -> f64 {
        match self {
            ChosenStatus::NotChosenYet => -1.0,
            ChosenStatus::Rejected => -2.0,
            ChosenStatus::Chosen { iteration, sim_iter } => {
                f64::from(iteration) + f64::from(sim_iter) / 100.0
            }
        }
    }

    pub fn is_chosen(self) -> bool {
        matches!(self, ChosenStatus::Chosen { .. })
    }
}

/// One link of a path. Times are minutes after midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathLink {
    pub mode: LinkMode,
    /// Boarding / start stop. Access links start at the origin zone and use
    /// the boarding stop here; egress links use the alighting stop.
    pub a_stop: StopId,
    pub b_stop: StopId,
    pub trip: Option<TripId>,
    /// Stop sequence of the boarding stop, transit links only.
    pub a_seq: u32,
    pub b_seq: u32,
    /// Pathfinder arrival time at the start of the link.
    pub pf_a_time_min: f64,
    pub pf_b_time_min: f64,
    pub pf_link_time_min: f64,
    /// Wait between arriving at the boarding stop and the vehicle departing;
    /// zero for non-transit links.
    pub pf_wait_time_min: f64,
    pub pf_link_cost: f64,
    pub dist: f64,

    // Realized fields, refreshed by the simulation each iteration.
    pub board_time_min: Option<f64>,
    pub alight_time_min: Option<f64>,
    pub alight_delay_min: f64,
    pub sim_a_time_min: f64,
    pub sim_b_time_min: f64,
    pub sim_link_time_min: f64,
    pub sim_wait_time_min: f64,
    pub sim_cost: f64,
    pub missed_xfer: bool,
    /// Onboard minus capacity on the boarded vehicle at the boarding stop.
    pub overcap: f64,
    /// Share of this stop's boards that are over capacity.
    pub overcap_frac: f64,
    /// 1 when this boarding squeezed onto an at- or over-capacity vehicle.
    pub bumpstop_boarded: Option<bool>,
}

impl PathLink {
    pub fn new(mode: LinkMode, a_stop: StopId, b_stop: StopId) -> Self {
        Self {
            mode,
            a_stop,
            b_stop,
            trip: None,
            a_seq: 0,
            b_seq: 0,
            pf_a_time_min: 0.0,
            pf_b_time_min: 0.0,
            pf_link_time_min: 0.0,
            pf_wait_time_min: 0.0,
            pf_link_cost: 0.0,
            dist: 0.0,
            board_time_min: None,
            alight_time_min: None,
            alight_delay_min: 0.0,
            sim_a_time_min: 0.0,
            sim_b_time_min: 0.0,
            sim_link_time_min: 0.0,
            sim_wait_time_min: 0.0,
            sim_cost: 0.0,
            missed_xfer: false,
            overcap: 0.0,
            overcap_frac: 0.0,
            bumpstop_boarded: None,
        }
    }
}

/// One candidate itinerary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    pub links: Vec<PathLink>,
    /// Generalized cost as the pathfinder saw it.
    pub pf_cost: f64,
    /// Enumeration probability: empirical draw frequency under TBHP, 1.0
    /// under TBSP.
    pub pf_probability: f64,
    /// Generalized cost against realized times, recomputed every scoring
    /// pass.
    pub sim_cost: f64,
    /// ln of the path-size overlap term, in (-inf, 0].
    pub ln_path_size: f64,
    /// Logit probability from the most recent scoring pass.
    pub probability: f64,
    pub logsum: f64,
    pub chosen: ChosenStatus,
    pub missed_xfer: bool,
    /// Bump pass in which this path lost a boarding, -1 if never bumped.
    pub bump_iter: i32,
}

impl Path {
    pub fn new(links: Vec<PathLink>, pf_cost: f64, pf_probability: f64) -> Self {
        Self {
            links,
            pf_cost,
            pf_probability,
            sim_cost: 0.0,
            ln_path_size: 0.0,
            probability: 0.0,
            logsum: 0.0,
            chosen: ChosenStatus::NotChosenYet,
            missed_xfer: false,
            bump_iter: -1,
        }
    }

    pub fn is_bumped(&self) -> bool {
        self.bump_iter >= 0
    }

    pub fn transit_links(&self) -> impl Iterator<Item = &PathLink> {
        self.links.iter().filter(|l| l.mode.is_transit())
    }

    pub fn num_transfers(&self) -> usize {
        self.transit_links().count().saturating_sub(1)
    }
}

/// Why a request ended up with an empty pathset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoPathReason {
    /// The origin (outbound) or destination (inbound) side was never
    /// labeled.
    NoPath,
    /// The worker handling this request died mid-search.
    WorkerCrash,
}

/// The candidate paths found for one request. All paths share the request's
/// origin, destination, user class, preferred time and direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSet {
    pub request_id: usize,
    pub paths: Vec<Path>,
    pub no_path: Option<NoPathReason>,
    /// Outer iteration in which this pathset was generated.
    pub pf_iteration: u32,
}

impl PathSet {
    pub fn empty(request_id: usize, reason: NoPathReason, pf_iteration: u32) -> Self {
        Self {
            request_id,
            paths: Vec::new(),
            no_path: Some(reason),
            pf_iteration,
        }
    }

    pub fn path_found(&self) -> bool {
        !self.paths.is_empty()
    }

    pub fn chosen_path(&self) -> Option<&Path> {
        self.paths.iter().find(|p| p.chosen.is_chosen())
    }

    pub fn chosen_path_mut(&mut self) -> Option<&mut Path> {
        self.paths.iter_mut().find(|p| p.chosen.is_chosen())
    }

    /// A request arrived when its chosen path survived the simulation:
    /// never bumped, no missed transfer.
    pub fn arrived(&self) -> bool {
        self.chosen_path()
            .map(|p| !p.is_bumped() && !p.missed_xfer)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chosen_ordinal_scheme() {
        assert_eq!(ChosenStatus::NotChosenYet.ordinal(), -1.0);
        assert_eq!(ChosenStatus::Rejected.ordinal(), -2.0);
        let tag = ChosenStatus::Chosen {
            iteration: 2,
            sim_iter: 3,
        };
        assert!((tag.ordinal() - 2.03).abs() < 1e-12);
        assert!(tag.is_chosen());
    }

    #[test]
    fn mode_codes() {
        assert_eq!(LinkMode::Access.code(None), MODE_ACCESS);
        assert_eq!(LinkMode::Egress.code(None), MODE_EGRESS);
        assert_eq!(LinkMode::Transfer.code(None), MODE_TRANSFER);
        assert_eq!(LinkMode::Transit.code(None), MODE_GENERIC_TRANSIT);
        assert_eq!(LinkMode::Transit.code(Some(3)), 3);
    }

    #[test]
    fn transfers_counted_from_transit_legs() {
        let links = vec![
            PathLink::new(LinkMode::Access, 0, 0),
            PathLink::new(LinkMode::Transit, 0, 1),
            PathLink::new(LinkMode::Transfer, 1, 2),
            PathLink::new(LinkMode::Transit, 2, 3),
            PathLink::new(LinkMode::Egress, 3, 3),
        ];
        let path = Path::new(links, 10.0, 1.0);
        assert_eq!(path.num_transfers(), 1);
    }
}
