//! Run configuration for the assignment driver and the pathfinding engines.
//!
//! Everything is an explicit immutable value threaded into the components;
//! workers receive a clone at spawn. Defaults mirror a typical iterative
//! capacity-constrained run.

use serde::Serialize;

use crate::error::{AssignError, Result};

/// How pathsets are produced each outer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PathfindingKind {
    /// Trip-based shortest path (TBSP): one lowest-cost state per stop.
    Deterministic,
    /// Trip-based hyperpath (TBHP): per-stop state bags, sampled pathsets.
    Stochastic,
    /// Skip pathfinding; load pathset records written by a previous run.
    File,
}

/// Which quantity measures link overlap in the path-size correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverlapVariable {
    Count,
    Distance,
    Time,
}

/// Outer-loop configuration (iteration control, capacity treatment, debug
/// filters, worker count).
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentConfig {
    /// Number of outer assignment iterations.
    pub iterations: u32,
    /// Run the inner simulation loop. When false, paths are costed and
    /// chosen once but never loaded onto vehicles.
    pub simulation: bool,
    pub pathfinding: PathfindingKind,
    /// Worker count for pathfinding. Less than 1 means all available cores;
    /// 1 disables the pool and runs in-process.
    pub number_of_processes: i32,
    /// Extra minutes of slack a passenger needs on a previously-bumped
    /// boarding for it to stay feasible.
    pub bump_buffer_min: f64,
    /// Bump from the single earliest over-capacity stop per pass instead of
    /// one per trip. Slower, more accurate.
    pub bump_one_at_a_time: bool,
    pub capacity_constraint: bool,
    /// Smooth boards/alights/onboard/overcap across outer iterations with
    /// method-of-successive-averages.
    pub msa_results: bool,
    /// Inner simulation iterations per outer iteration.
    pub max_simulation_iters: u32,
    /// Only assign the traced person ids.
    pub debug_trace_only: bool,
    /// Truncate the demand table to this many requests. -1 runs all.
    pub debug_num_trips: i64,
    pub trace_person_ids: Vec<String>,
    pub skip_person_ids: Vec<String>,
    /// Prefix vehicle trip ids with their route id in outputs, for
    /// readability when trip ids are inscrutable.
    pub prepend_route_id_to_trip_id: bool,
    /// Base seed for all per-request RNG derivations.
    pub seed: u64,
    /// Write pathset records every simulation iteration instead of once per
    /// pathfinding iteration.
    pub output_pathset_per_sim_iter: bool,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            simulation: true,
            pathfinding: PathfindingKind::Stochastic,
            number_of_processes: 0,
            bump_buffer_min: 5.0,
            bump_one_at_a_time: false,
            capacity_constraint: false,
            msa_results: false,
            max_simulation_iters: 10,
            debug_trace_only: false,
            debug_num_trips: -1,
            trace_person_ids: Vec::new(),
            skip_person_ids: Vec::new(),
            prepend_route_id_to_trip_id: false,
            seed: 0,
            output_pathset_per_sim_iter: false,
        }
    }
}

impl AssignmentConfig {
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_pathfinding(mut self, kind: PathfindingKind) -> Self {
        self.pathfinding = kind;
        self
    }

    pub fn with_capacity_constraint(mut self, on: bool) -> Self {
        self.capacity_constraint = on;
        self
    }

    pub fn with_processes(mut self, n: i32) -> Self {
        self.number_of_processes = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(AssignError::Configuration(
                "iterations must be at least 1".into(),
            ));
        }
        if self.bump_buffer_min < 0.0 {
            return Err(AssignError::Configuration(format!(
                "bump_buffer [{}] must be nonnegative",
                self.bump_buffer_min
            )));
        }
        Ok(())
    }
}

/// Pathfinding configuration shared by both engines and the scorer.
#[derive(Debug, Clone, Serialize)]
pub struct PathfindingConfig {
    /// Width in minutes of the departure window considered when boarding.
    pub time_window_min: f64,
    /// Cap on pathset size after probability filtering. -1 is unbounded.
    pub max_num_paths: i64,
    /// Paths whose logit probability falls below this are discarded, once
    /// `max_num_paths` is hit.
    pub min_path_probability: f64,
    /// Logit dispersion (theta). Higher is more deterministic. Nonnegative.
    pub stochastic_dispersion: f64,
    /// Max label-queue extractions per stop under TBHP. -1 is unbounded.
    pub stochastic_max_stop_process_count: i64,
    /// How many (not necessarily unique) paths to draw when sampling a
    /// hyperpath pathset.
    pub stochastic_pathset_size: u32,
    /// Name of the registered user-class weight function.
    pub user_class_function: String,
    /// Floor on the per-boarding transfer penalty, in cost units.
    pub min_transfer_penalty: f64,
    /// Exponent on path-length ratios in the path-size denominator.
    pub overlap_scale_parameter: f64,
    /// Split transit legs into stop-to-stop segments before computing
    /// overlap, so partially shared legs count.
    pub overlap_split_transit: bool,
    pub overlap_variable: OverlapVariable,
}

impl Default for PathfindingConfig {
    fn default() -> Self {
        Self {
            time_window_min: 30.0,
            max_num_paths: -1,
            min_path_probability: 0.005,
            stochastic_dispersion: 1.0,
            stochastic_max_stop_process_count: -1,
            stochastic_pathset_size: 1000,
            user_class_function: "generic_user_class".to_string(),
            min_transfer_penalty: 1.0,
            overlap_scale_parameter: 1.0,
            overlap_split_transit: false,
            overlap_variable: OverlapVariable::Count,
        }
    }
}

impl PathfindingConfig {
    pub fn with_time_window(mut self, minutes: f64) -> Self {
        self.time_window_min = minutes;
        self
    }

    pub fn with_dispersion(mut self, theta: f64) -> Self {
        self.stochastic_dispersion = theta;
        self
    }

    pub fn with_pathset_size(mut self, size: u32) -> Self {
        self.stochastic_pathset_size = size;
        self
    }

    pub fn with_max_num_paths(mut self, max: i64) -> Self {
        self.max_num_paths = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.time_window_min < 0.0 {
            return Err(AssignError::Configuration(format!(
                "time_window [{}] must be nonnegative",
                self.time_window_min
            )));
        }
        if self.stochastic_dispersion < 0.0 {
            return Err(AssignError::Configuration(format!(
                "stochastic_dispersion [{}] must be nonnegative",
                self.stochastic_dispersion
            )));
        }
        if self.stochastic_pathset_size == 0 {
            return Err(AssignError::Configuration(
                "stochastic_pathset_size must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_path_probability) {
            return Err(AssignError::Configuration(format!(
                "min_path_probability [{}] must be within [0, 1]",
                self.min_path_probability
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configs_validate() {
        AssignmentConfig::default().validate().unwrap();
        PathfindingConfig::default().validate().unwrap();
    }

    #[test]
    fn negative_dispersion_rejected() {
        let cfg = PathfindingConfig {
            stochastic_dispersion: -0.5,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(AssignError::Configuration(_))
        ));
    }

    #[test]
    fn zero_iterations_rejected() {
        let cfg = AssignmentConfig::default().with_iterations(0);
        assert!(cfg.validate().is_err());
    }
}
