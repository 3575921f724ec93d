//! # Transit Assignment Core
//!
//! A trip-based transit passenger assignment engine.
//!
//! ## Overview
//!
//! Given a published schedule (trips, stop times, capacities) and a list of
//! passenger travel requests, this crate:
//!
//! - **Finds pathsets**: deterministic shortest-path (TBSP) or stochastic
//!   hyperpath (TBHP) labeling over the time-expanded trip graph
//! - **Simulates**: realizes board/alight/wait times against the vehicle
//!   schedule and flags missed transfers
//! - **Chooses routes**: generalized cost, path-size overlap correction and
//!   a logit draw per passenger
//! - **Enforces capacity**: bumps passengers off over-capacity boardings
//!   and feeds the bump-wait registry back into pathfinding
//! - **Iterates**: alternates pathfinding and simulation until the
//!   capacity gap settles
//!
//! ## Key Concepts
//!
//! - **Deterministic**: every RNG is seeded from (iteration, request), so
//!   single- and multi-worker runs produce identical assignments
//! - **Immutable supply**: workers share one read-only snapshot per pass;
//!   the driver refreshes dwell/travel times between passes
//! - **Non-fatal misses**: a request without a feasible itinerary is an
//!   empty pathset, not an error
//!
//! ## Example
//!
//! ```rust,no_run
//! use assign_core::config::{AssignmentConfig, PathfindingConfig, PathfindingKind};
//! use assign_core::driver::Assignment;
//! # fn demo(supply: assign_core::supply::TransitSupply,
//! #         requests: Vec<assign_core::demand::Request>) -> assign_core::error::Result<()> {
//! let config = AssignmentConfig::default()
//!     .with_iterations(2)
//!     .with_pathfinding(PathfindingKind::Stochastic)
//!     .with_capacity_constraint(true);
//! let assignment = Assignment::new(config, PathfindingConfig::default())?;
//! let results = assignment.run(supply, requests, None)?;
//! println!("capacity gap: {:.3}%", results.final_gap());
//! # Ok(())
//! # }
//! ```

pub mod capacity;
pub mod choice;
pub mod config;
pub mod demand;
pub mod driver;
pub mod error;
pub mod export;
pub mod labeling;
pub mod loading;
pub mod pathset;
pub mod simulation;
pub mod supply;
pub mod workers;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
