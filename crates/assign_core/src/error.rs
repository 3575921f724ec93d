//! Error taxonomy for the assignment engine.
//!
//! Only configuration and supply problems are fatal. A request without a
//! feasible itinerary is *not* an error: the pathfinder returns an empty
//! pathset with a [`NoPathReason`](crate::pathset::NoPathReason), and the
//! request counts as a miss in the capacity gap.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssignError {
    /// Missing or invalid configuration value, unknown user-class function,
    /// unknown overlap variable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed schedule arrays: negative times, unknown stops, unsortable
    /// stop sequences.
    #[error("supply error: {0}")]
    Supply(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// User cancellation while workers were in flight.
    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, AssignError>;
