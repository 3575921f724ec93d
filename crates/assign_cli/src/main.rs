//! Command-line runner: loads the network and demand tables, runs the
//! assignment, writes per-iteration outputs.
//!
//! Exit codes: 0 on success, 2 on configuration or unhandled errors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use log::{error, info};
use serde::Deserialize;

use assign_core::config::{
    AssignmentConfig, OverlapVariable, PathfindingConfig, PathfindingKind,
};
use assign_core::demand::{Direction, Request};
use assign_core::driver::Assignment;
use assign_core::error::{AssignError, Result};
use assign_core::supply::{ConnectorEdge, StopTime, TransferEdge, TransitSupply, TripInfo};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PathfindingArg {
    Deterministic,
    Stochastic,
    File,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OverlapArg {
    Count,
    Distance,
    Time,
}

/// Trip-based transit passenger assignment.
#[derive(Debug, Parser)]
#[command(name = "transit-assign", version, about)]
struct Args {
    /// Directory holding trips.csv, stop_times.csv, transfers.csv,
    /// access.csv and egress.csv.
    #[arg(long, env = "ASSIGN_INPUT_NETWORK")]
    input_network: PathBuf,

    /// Directory holding trip_list.csv.
    #[arg(long, env = "ASSIGN_INPUT_DEMAND")]
    input_demand: PathBuf,

    /// Output directory; created if missing.
    #[arg(long, env = "ASSIGN_OUTPUT_DIR")]
    output_dir: PathBuf,

    /// Number of outer assignment iterations.
    #[arg(long, default_value_t = 1)]
    iterations: u32,

    /// Skip the inner simulation loop (one-shot choice only).
    #[arg(long)]
    no_simulation: bool,

    #[arg(long, value_enum, default_value_t = PathfindingArg::Stochastic)]
    pathfinding_type: PathfindingArg,

    /// Pathfinding worker count; below 1 uses all cores, 1 runs
    /// in-process.
    #[arg(long, default_value_t = 0)]
    number_of_processes: i32,

    /// Minutes of slack a passenger needs on a previously-bumped boarding.
    #[arg(long, default_value_t = 5.0)]
    bump_buffer: f64,

    /// Bump from one stop at a time instead of one per trip.
    #[arg(long)]
    bump_one_at_a_time: bool,

    #[arg(long)]
    capacity_constraint: bool,

    /// Smooth loads across outer iterations (method of successive
    /// averages).
    #[arg(long)]
    msa_results: bool,

    #[arg(long, default_value_t = 10)]
    max_simulation_iters: u32,

    /// Only assign the traced persons.
    #[arg(long)]
    debug_trace_only: bool,

    /// Truncate the demand table to this many requests; -1 runs all.
    #[arg(long, default_value_t = -1)]
    debug_num_trips: i64,

    #[arg(long = "trace-person-id")]
    trace_person_ids: Vec<String>,

    #[arg(long = "skip-person-id")]
    skip_person_ids: Vec<String>,

    /// Prefix trip ids with their route id in outputs.
    #[arg(long)]
    prepend_route_id_to_trip_id: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write pathset records every simulation iteration.
    #[arg(long)]
    output_pathset_per_sim_iter: bool,

    /// Boarding window in minutes.
    #[arg(long, default_value_t = 30.0)]
    time_window: f64,

    /// Pathset size cap after probability filtering; -1 is unbounded.
    #[arg(long, default_value_t = -1)]
    max_num_paths: i64,

    #[arg(long, default_value_t = 0.005)]
    min_path_probability: f64,

    /// Logit dispersion; higher is more deterministic.
    #[arg(long, default_value_t = 1.0)]
    stochastic_dispersion: f64,

    /// Max label-queue extractions per stop; -1 is unbounded.
    #[arg(long, default_value_t = -1)]
    stochastic_max_stop_process_count: i64,

    #[arg(long, default_value_t = 1000)]
    stochastic_pathset_size: u32,

    #[arg(long, default_value = "generic_user_class")]
    user_class_function: String,

    #[arg(long, default_value_t = 1.0)]
    min_transfer_penalty: f64,

    #[arg(long, default_value_t = 1.0)]
    overlap_scale_parameter: f64,

    #[arg(long)]
    overlap_split_transit: bool,

    #[arg(long, value_enum, default_value_t = OverlapArg::Count)]
    overlap_variable: OverlapArg,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(args) {
        Ok(gap) => {
            info!("assignment finished with capacity gap {gap:.5}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<f64> {
    let config = AssignmentConfig {
        iterations: args.iterations,
        simulation: !args.no_simulation,
        pathfinding: match args.pathfinding_type {
            PathfindingArg::Deterministic => PathfindingKind::Deterministic,
            PathfindingArg::Stochastic => PathfindingKind::Stochastic,
            PathfindingArg::File => PathfindingKind::File,
        },
        number_of_processes: args.number_of_processes,
        bump_buffer_min: args.bump_buffer,
        bump_one_at_a_time: args.bump_one_at_a_time,
        capacity_constraint: args.capacity_constraint,
        msa_results: args.msa_results,
        max_simulation_iters: args.max_simulation_iters,
        debug_trace_only: args.debug_trace_only,
        debug_num_trips: args.debug_num_trips,
        trace_person_ids: args.trace_person_ids.clone(),
        skip_person_ids: args.skip_person_ids.clone(),
        prepend_route_id_to_trip_id: args.prepend_route_id_to_trip_id,
        seed: args.seed,
        output_pathset_per_sim_iter: args.output_pathset_per_sim_iter,
    };
    let pathfinding = PathfindingConfig {
        time_window_min: args.time_window,
        max_num_paths: args.max_num_paths,
        min_path_probability: args.min_path_probability,
        stochastic_dispersion: args.stochastic_dispersion,
        stochastic_max_stop_process_count: args.stochastic_max_stop_process_count,
        stochastic_pathset_size: args.stochastic_pathset_size,
        user_class_function: args.user_class_function.clone(),
        min_transfer_penalty: args.min_transfer_penalty,
        overlap_scale_parameter: args.overlap_scale_parameter,
        overlap_split_transit: args.overlap_split_transit,
        overlap_variable: match args.overlap_variable {
            OverlapArg::Count => OverlapVariable::Count,
            OverlapArg::Distance => OverlapVariable::Distance,
            OverlapArg::Time => OverlapVariable::Time,
        },
    };

    let mut ids = IdTables::default();
    let supply = load_network(&args.input_network, &mut ids)?;
    let requests = load_demand(&args.input_demand, &mut ids)?;
    info!(
        "loaded {} trips over {} stops, {} requests",
        supply.num_trips(),
        supply.num_stops(),
        requests.len()
    );

    std::fs::create_dir_all(&args.output_dir)?;
    let assignment = Assignment::new(config, pathfinding)?;
    let results = assignment.run(supply, requests, Some(&args.output_dir))?;
    Ok(results.final_gap())
}

/// External string ids to dense integers.
#[derive(Debug, Default)]
struct Interner {
    by_name: HashMap<String, usize>,
    names: Vec<String>,
}

impl Interner {
    fn intern(&mut self, name: &str) -> usize {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.names.len();
        self.by_name.insert(name.to_string(), id);
        self.names.push(name.to_string());
        id
    }

    fn get(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    fn len(&self) -> usize {
        self.names.len()
    }
}

#[derive(Debug, Default)]
struct IdTables {
    stops: Interner,
    trips: Interner,
    tazs: Interner,
}

#[derive(Debug, Deserialize)]
struct TripRow {
    trip_id: String,
    route_id: String,
    service_id: String,
    direction_id: Option<u8>,
    mode: Option<i32>,
    capacity: Option<f64>,
    seated_capacity: Option<f64>,
    fare: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    stop_id: String,
    stop_sequence: u32,
    arrival_min: f64,
    departure_min: f64,
    shape_dist: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TransferRow {
    from_stop: String,
    to_stop: String,
    time_min: f64,
    dist: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ConnectorRow {
    taz: String,
    stop: String,
    time_min: f64,
    dist: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TripListRow {
    person_id: String,
    o_taz: String,
    d_taz: String,
    direction: String,
    preferred_time_min: f64,
    user_class: Option<String>,
    purpose: Option<String>,
    access_mode: Option<String>,
    transit_mode: Option<String>,
    egress_mode: Option<String>,
    vot: Option<f64>,
}

fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| AssignError::Supply(format!("cannot read {}: {e}", path.display())))?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record.map_err(|e| {
            AssignError::Supply(format!("bad record in {}: {e}", path.display()))
        })?);
    }
    Ok(rows)
}

fn load_network(dir: &Path, ids: &mut IdTables) -> Result<TransitSupply> {
    let trip_rows: Vec<TripRow> = read_rows(&dir.join("trips.csv"))?;
    let stop_time_rows: Vec<StopTimeRow> = read_rows(&dir.join("stop_times.csv"))?;

    let mut trips = Vec::with_capacity(trip_rows.len());
    for row in &trip_rows {
        let id = ids.trips.intern(&row.trip_id);
        if id != trips.len() {
            return Err(AssignError::Supply(format!(
                "duplicate trip id {} in trips.csv",
                row.trip_id
            )));
        }
        trips.push(TripInfo {
            external_id: row.trip_id.clone(),
            route_id: row.route_id.clone(),
            service_id: row.service_id.clone(),
            direction_id: row.direction_id,
            mode: row.mode,
            capacity: row.capacity,
            seated_capacity: row.seated_capacity,
            fare: row.fare,
        });
    }

    let mut stop_times = Vec::with_capacity(stop_time_rows.len());
    for row in &stop_time_rows {
        let trip = ids.trips.get(&row.trip_id).ok_or_else(|| {
            AssignError::Supply(format!("stop_times references unknown trip {}", row.trip_id))
        })?;
        stop_times.push(StopTime {
            trip,
            stop: ids.stops.intern(&row.stop_id),
            sequence: row.stop_sequence,
            arrival_min: row.arrival_min,
            departure_min: row.departure_min,
            overcap: 0.0,
            shape_dist: row.shape_dist.unwrap_or(0.0),
        });
    }

    let transfer_rows: Vec<TransferRow> = read_optional(&dir.join("transfers.csv"))?;
    let access_rows: Vec<ConnectorRow> = read_optional(&dir.join("access.csv"))?;
    let egress_rows: Vec<ConnectorRow> = read_optional(&dir.join("egress.csv"))?;

    let transfers: Vec<TransferEdge> = transfer_rows
        .iter()
        .map(|row| TransferEdge {
            from_stop: ids.stops.intern(&row.from_stop),
            to_stop: ids.stops.intern(&row.to_stop),
            time_min: row.time_min,
            dist: row.dist.unwrap_or(0.0),
        })
        .collect();
    let access: Vec<ConnectorEdge> = access_rows
        .iter()
        .map(|row| ConnectorEdge {
            taz: ids.tazs.intern(&row.taz),
            stop: ids.stops.intern(&row.stop),
            time_min: row.time_min,
            dist: row.dist.unwrap_or(0.0),
        })
        .collect();
    let egress: Vec<ConnectorEdge> = egress_rows
        .iter()
        .map(|row| ConnectorEdge {
            taz: ids.tazs.intern(&row.taz),
            stop: ids.stops.intern(&row.stop),
            time_min: row.time_min,
            dist: row.dist.unwrap_or(0.0),
        })
        .collect();

    // Zones can appear first in the demand table; size generously.
    let num_tazs = ids.tazs.len().max(1) + 1024;
    TransitSupply::new(stop_times, trips, ids.stops.len(), num_tazs)?
        .with_transfers(transfers)?
        .with_access(access)?
        .with_egress(egress)
}

fn read_optional<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if path.exists() {
        read_rows(path)
    } else {
        Ok(Vec::new())
    }
}

fn load_demand(dir: &Path, ids: &mut IdTables) -> Result<Vec<Request>> {
    let rows: Vec<TripListRow> = read_rows(&dir.join("trip_list.csv"))?;
    let mut requests = Vec::with_capacity(rows.len());
    for (request_id, row) in rows.iter().enumerate() {
        let direction = match row.direction.to_ascii_lowercase().as_str() {
            "outbound" => Direction::Outbound,
            "inbound" => Direction::Inbound,
            other => {
                return Err(AssignError::Configuration(format!(
                    "unknown direction [{other}] for person {}",
                    row.person_id
                )))
            }
        };
        requests.push(Request {
            person_id: row.person_id.clone(),
            request_id,
            o_taz: ids.tazs.intern(&row.o_taz),
            d_taz: ids.tazs.intern(&row.d_taz),
            direction,
            preferred_time_min: row.preferred_time_min,
            user_class: row.user_class.clone().unwrap_or_else(|| "all".to_string()),
            purpose: row.purpose.clone().unwrap_or_else(|| "other".to_string()),
            access_mode: row.access_mode.clone().unwrap_or_else(|| "walk".to_string()),
            transit_mode: row
                .transit_mode
                .clone()
                .unwrap_or_else(|| "transit".to_string()),
            egress_mode: row.egress_mode.clone().unwrap_or_else(|| "walk".to_string()),
            vot: row.vot.unwrap_or(10.0),
        });
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_network(dir: &Path) {
        std::fs::write(
            dir.join("trips.csv"),
            "trip_id,route_id,service_id,direction_id,mode,capacity,seated_capacity,fare\n\
             blue_1,blue,weekday,0,,1,,\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("stop_times.csv"),
            "trip_id,stop_id,stop_sequence,arrival_min,departure_min,shape_dist\n\
             blue_1,A,1,480,481,0\n\
             blue_1,B,2,490,490,2.5\n",
        )
        .unwrap();
        std::fs::write(dir.join("access.csv"), "taz,stop,time_min,dist\nZ1,A,2,0.1\n").unwrap();
        std::fs::write(dir.join("egress.csv"), "taz,stop,time_min,dist\nZ2,B,2,0.1\n").unwrap();
    }

    fn write_demand(dir: &Path) {
        std::fs::write(
            dir.join("trip_list.csv"),
            "person_id,o_taz,d_taz,direction,preferred_time_min,user_class,purpose,access_mode,transit_mode,egress_mode,vot\n\
             alice,Z1,Z2,outbound,495,all,work,walk,transit,walk,12\n\
             bob,Z1,Z2,outbound,495,all,work,walk,transit,walk,9\n",
        )
        .unwrap();
    }

    #[test]
    fn loads_and_assigns_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let net = tmp.path().join("net");
        let dem = tmp.path().join("dem");
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&net).unwrap();
        std::fs::create_dir_all(&dem).unwrap();

        write_network(&net);
        write_demand(&dem);

        let mut ids = IdTables::default();
        let supply = load_network(&net, &mut ids).unwrap();
        let requests = load_demand(&dem, &mut ids).unwrap();
        assert_eq!(supply.num_trips(), 1);
        assert_eq!(requests.len(), 2);

        let config = AssignmentConfig::default()
            .with_pathfinding(PathfindingKind::Deterministic)
            .with_capacity_constraint(true)
            .with_processes(1);
        let assignment = Assignment::new(config, PathfindingConfig::default()).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        let results = assignment.run(supply, requests, Some(&out)).unwrap();

        // Capacity 1, two passengers: one arrives, one bumped.
        assert!((results.final_gap() - 50.0).abs() < 1e-9);
        assert!(out.join("veh_trips.csv").exists());
        assert!(out.join("pathset_paths.csv").exists());
        assert!(out.join("chosenpaths_paths.csv").exists());
        assert!(out.join("ft_output_config.json").exists());
    }

    #[test]
    fn unknown_direction_is_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("trip_list.csv"),
            "person_id,o_taz,d_taz,direction,preferred_time_min\ncarol,Z1,Z2,sideways,480\n",
        )
        .unwrap();
        let mut ids = IdTables::default();
        let err = load_demand(tmp.path(), &mut ids).unwrap_err();
        assert!(matches!(err, AssignError::Configuration(_)));
    }
}
