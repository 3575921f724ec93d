//! Passenger travel requests ("trip list entries").

use serde::{Deserialize, Serialize};

use crate::supply::TazId;

/// Whether the preferred time anchors the arrival (outbound) or the
/// departure (inbound) end of the trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Preferred time is the desired arrival at the destination; the label
    /// engine searches backward from the destination.
    Outbound,
    /// Preferred time is the desired departure from the origin; the label
    /// engine searches forward from the origin.
    Inbound,
}

/// One passenger travel request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub person_id: String,
    /// Dense id unique across the demand table; keys pathsets and results.
    pub request_id: usize,
    pub o_taz: TazId,
    pub d_taz: TazId,
    pub direction: Direction,
    /// Minutes after midnight.
    pub preferred_time_min: f64,
    pub user_class: String,
    pub purpose: String,
    pub access_mode: String,
    pub transit_mode: String,
    pub egress_mode: String,
    /// Value of time, dollars per hour.
    pub vot: f64,
}

impl Request {
    /// A request that starts and ends in the same zone goes nowhere and is
    /// skipped by the driver.
    pub fn goes_somewhere(&self) -> bool {
        self.o_taz != self.d_taz
    }
}
