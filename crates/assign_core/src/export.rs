//! Tabular outputs: vehicle loads, pathset records, chosen paths and
//! per-request search performance. Vehicle and chosen-path files append one
//! block per iteration; pathset records can be reloaded to re-run
//! assignment without pathfinding.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path as FsPath;

use csv::{ReaderBuilder, WriterBuilder};
use log::info;

use crate::error::{AssignError, Result};
use crate::labeling::PerfCounters;
use crate::loading::VehicleLoadProfile;
use crate::pathset::{
    ChosenStatus, LinkMode, Path, PathLink, PathSet, MODE_ACCESS, MODE_EGRESS, MODE_TRANSFER,
};
use crate::supply::TransitSupply;

pub const VEHICLE_LOAD_FILE: &str = "veh_trips.csv";
pub const PATHSET_PATHS_FILE: &str = "pathset_paths.csv";
pub const PATHSET_LINKS_FILE: &str = "pathset_links.csv";
pub const CHOSEN_PATHS_FILE: &str = "chosenpaths_paths.csv";
pub const CHOSEN_LINKS_FILE: &str = "chosenpaths_links.csv";
pub const PERFORMANCE_FILE: &str = "ft_performance.csv";
pub const CONFIG_OUTPUT_FILE: &str = "ft_output_config.json";

/// Minutes after midnight as `HH:MM:SS`.
fn format_time(minutes: f64) -> String {
    let total_sec = (minutes * 60.0).round().max(0.0) as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total_sec / 3600,
        (total_sec % 3600) / 60,
        total_sec % 60
    )
}

fn float(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        format!("{value:.4}")
    }
}

fn open_writer(path: &FsPath, append: bool) -> Result<(csv::Writer<std::fs::File>, bool)> {
    let exists = append && path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(exists)
        .write(true)
        .truncate(!exists)
        .open(path)?;
    let writer = WriterBuilder::new().has_headers(false).from_writer(file);
    Ok((writer, !exists))
}

/// Vehicle load output, one block per iteration. The `direction_id` and
/// `capacity` columns are omitted when the input feed lacks them.
pub fn write_vehicle_load(
    dir: &FsPath,
    iteration: u32,
    profile: &VehicleLoadProfile,
    supply: &TransitSupply,
    prepend_route_id: bool,
    append: bool,
) -> Result<()> {
    let has_direction = (0..supply.num_trips()).any(|t| supply.trip(t).direction_id.is_some());
    let has_capacity = supply.has_capacity_configured();

    let path = dir.join(VEHICLE_LOAD_FILE);
    let (mut writer, write_header) = open_writer(&path, append)?;
    if write_header {
        let mut header: Vec<&str> = vec!["iteration"];
        if has_direction {
            header.push("direction_id");
        }
        header.extend([
            "service_id",
            "route_id",
            "trip_id",
            "stop_sequence",
            "stop_id",
            "arrival_time",
            "arrival_time_min",
            "departure_time",
            "departure_time_min",
            "travel_time_sec",
            "dwell_time_sec",
        ]);
        if has_capacity {
            header.push("capacity");
        }
        header.extend([
            "boards",
            "alights",
            "onboard",
            "standees",
            "friction",
            "overcap",
            "msa_boards",
            "msa_alights",
            "msa_onboard",
            "msa_standees",
            "msa_friction",
            "msa_overcap",
        ]);
        writer.write_record(&header)?;
    }

    for row in profile.rows() {
        let trip = supply.trip(row.trip);
        let trip_id = if prepend_route_id {
            format!("{}_{}", trip.route_id, trip.external_id)
        } else {
            trip.external_id.clone()
        };
        let mut record: Vec<String> = vec![iteration.to_string()];
        if has_direction {
            record.push(
                trip.direction_id
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
            );
        }
        record.extend([
            trip.service_id.clone(),
            trip.route_id.clone(),
            trip_id,
            row.sequence.to_string(),
            row.stop.to_string(),
            format_time(row.arrival_min),
            float(row.arrival_min),
            format_time(row.departure_min),
            float(row.departure_min),
            float(row.travel_time_sec),
            float(row.dwell_time_sec),
        ]);
        if has_capacity {
            record.push(row.capacity.map(|c| float(c)).unwrap_or_default());
        }
        record.extend([
            row.boards.to_string(),
            row.alights.to_string(),
            row.onboard.to_string(),
            float(row.standees),
            float(row.friction),
            float(row.overcap),
            float(row.msa_boards),
            float(row.msa_alights),
            float(row.msa_onboard),
            float(row.msa_standees),
            float(row.msa_friction),
            float(row.msa_overcap),
        ]);
        writer.write_record(&record)?;
    }
    writer.flush()?;
    info!("wrote {} (iteration {})", path.display(), iteration);
    Ok(())
}

const PATHS_HEADER: [&str; 12] = [
    "iteration",
    "simulation_iteration",
    "request_id",
    "person_id",
    "path_num",
    "pf_cost",
    "pf_probability",
    "sim_cost",
    "ln_PS",
    "probability",
    "logsum",
    "chosen",
];

const LINKS_HEADER: [&str; 23] = [
    "iteration",
    "simulation_iteration",
    "request_id",
    "path_num",
    "link_num",
    "linkmode",
    "trip_id_num",
    "A_id_num",
    "B_id_num",
    "A_seq",
    "B_seq",
    "label",
    "pf_A_time_min",
    "pf_B_time_min",
    "pf_linktime_min",
    "pf_waittime_min",
    "pf_cost",
    "distance",
    "sim_A_time_min",
    "sim_B_time_min",
    "sim_waittime_min",
    "missed_xfer",
    "bumpstop_boarded",
];

fn write_path_row(
    writer: &mut csv::Writer<std::fs::File>,
    iteration: u32,
    sim_iter: u32,
    person_id: &str,
    pathset: &PathSet,
    path_num: usize,
    path: &Path,
) -> Result<()> {
    writer.write_record([
        iteration.to_string(),
        sim_iter.to_string(),
        pathset.request_id.to_string(),
        person_id.to_string(),
        path_num.to_string(),
        float(path.pf_cost),
        float(path.pf_probability),
        float(path.sim_cost),
        float(path.ln_path_size),
        float(path.probability),
        float(path.logsum),
        float(path.chosen.ordinal()),
    ])?;
    Ok(())
}

fn write_link_rows(
    writer: &mut csv::Writer<std::fs::File>,
    iteration: u32,
    sim_iter: u32,
    pathset: &PathSet,
    path_num: usize,
    path: &Path,
    supply: &TransitSupply,
) -> Result<()> {
    // The label column is the remaining generalized cost from each link to
    // the end of the path.
    let mut labels = vec![0.0; path.links.len()];
    let mut acc = 0.0;
    for (idx, link) in path.links.iter().enumerate().rev() {
        acc += link.pf_link_cost;
        labels[idx] = acc;
    }
    for (link_num, link) in path.links.iter().enumerate() {
        let mode_code = link.mode.code(link.trip.and_then(|t| supply.trip(t).mode));
        writer.write_record([
            iteration.to_string(),
            sim_iter.to_string(),
            pathset.request_id.to_string(),
            path_num.to_string(),
            link_num.to_string(),
            mode_code.to_string(),
            link.trip.map(|t| t.to_string()).unwrap_or_default(),
            link.a_stop.to_string(),
            link.b_stop.to_string(),
            link.a_seq.to_string(),
            link.b_seq.to_string(),
            float(labels[link_num]),
            float(link.pf_a_time_min),
            float(link.pf_b_time_min),
            float(link.pf_link_time_min),
            float(link.pf_wait_time_min),
            float(link.pf_link_cost),
            float(link.dist),
            float(link.sim_a_time_min),
            float(link.sim_b_time_min),
            float(link.sim_wait_time_min),
            if link.missed_xfer { "1" } else { "0" }.to_string(),
            link.bumpstop_boarded
                .map(|b| if b { "1" } else { "0" }.to_string())
                .unwrap_or_default(),
        ])?;
    }
    Ok(())
}

/// Write the full pathsets (paths and links files), appending when the
/// files already carry earlier iterations.
pub fn write_pathsets(
    dir: &FsPath,
    iteration: u32,
    sim_iter: u32,
    pathsets: &[PathSet],
    person_ids: &HashMap<usize, String>,
    supply: &TransitSupply,
    append: bool,
) -> Result<()> {
    let paths_path = dir.join(PATHSET_PATHS_FILE);
    let (mut paths_writer, header) = open_writer(&paths_path, append)?;
    if header {
        paths_writer.write_record(PATHS_HEADER)?;
    }
    let links_path = dir.join(PATHSET_LINKS_FILE);
    let (mut links_writer, header) = open_writer(&links_path, append)?;
    if header {
        links_writer.write_record(LINKS_HEADER)?;
    }

    for pathset in pathsets {
        let person = person_ids
            .get(&pathset.request_id)
            .map(String::as_str)
            .unwrap_or("");
        for (path_num, path) in pathset.paths.iter().enumerate() {
            write_path_row(
                &mut paths_writer,
                iteration,
                sim_iter,
                person,
                pathset,
                path_num,
                path,
            )?;
            write_link_rows(
                &mut links_writer,
                iteration,
                sim_iter,
                pathset,
                path_num,
                path,
                supply,
            )?;
        }
    }
    paths_writer.flush()?;
    links_writer.flush()?;
    Ok(())
}

/// Write only the chosen paths, appending per iteration.
pub fn write_chosen(
    dir: &FsPath,
    iteration: u32,
    sim_iter: u32,
    pathsets: &[PathSet],
    person_ids: &HashMap<usize, String>,
    supply: &TransitSupply,
    append: bool,
) -> Result<()> {
    let paths_path = dir.join(CHOSEN_PATHS_FILE);
    let (mut paths_writer, header) = open_writer(&paths_path, append)?;
    if header {
        paths_writer.write_record(PATHS_HEADER)?;
    }
    let links_path = dir.join(CHOSEN_LINKS_FILE);
    let (mut links_writer, header) = open_writer(&links_path, append)?;
    if header {
        links_writer.write_record(LINKS_HEADER)?;
    }
    for pathset in pathsets {
        let person = person_ids
            .get(&pathset.request_id)
            .map(String::as_str)
            .unwrap_or("");
        for (path_num, path) in pathset.paths.iter().enumerate() {
            if !path.chosen.is_chosen() {
                continue;
            }
            write_path_row(
                &mut paths_writer,
                iteration,
                sim_iter,
                person,
                pathset,
                path_num,
                path,
            )?;
            write_link_rows(
                &mut links_writer,
                iteration,
                sim_iter,
                pathset,
                path_num,
                path,
                supply,
            )?;
        }
    }
    paths_writer.flush()?;
    links_writer.flush()?;
    Ok(())
}

/// Per-request search counters, appended across iterations.
pub fn write_performance(
    dir: &FsPath,
    iteration: u32,
    records: &[(usize, String, PerfCounters)],
    append: bool,
) -> Result<()> {
    let path = dir.join(PERFORMANCE_FILE);
    let (mut writer, header) = open_writer(&path, append)?;
    if header {
        writer.write_record([
            "iteration",
            "request_id",
            "person_id",
            "label_iterations",
            "num_labeled_stops",
            "max_stop_process_count",
            "time_labeling_ms",
            "time_enumerating_ms",
        ])?;
    }
    for (request_id, person_id, perf) in records {
        writer.write_record([
            iteration.to_string(),
            request_id.to_string(),
            person_id.clone(),
            perf.label_iterations.to_string(),
            perf.num_labeled_stops.to_string(),
            perf.max_stop_process_count.to_string(),
            perf.labeling_ms.to_string(),
            perf.enumerating_ms.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Reload pathset records written by [`write_pathsets`], for
/// `pathfinding_type = file` runs. Realized fields reset; chosen status
/// resets to not-chosen.
pub fn read_pathsets(dir: &FsPath) -> Result<Vec<PathSet>> {
    let paths_path = dir.join(PATHSET_PATHS_FILE);
    let links_path = dir.join(PATHSET_LINKS_FILE);
    if !paths_path.exists() || !links_path.exists() {
        return Err(AssignError::Configuration(format!(
            "pathfinding_type is file but {} / {} are missing",
            paths_path.display(),
            links_path.display()
        )));
    }

    // request_id -> path_num -> (cost, probability)
    let mut path_meta: HashMap<usize, Vec<(usize, f64, f64)>> = HashMap::new();
    let mut reader = ReaderBuilder::new().from_path(&paths_path)?;
    let headers = reader.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let (req_col, num_col, cost_col, prob_col) = match (
        col("request_id"),
        col("path_num"),
        col("pf_cost"),
        col("pf_probability"),
    ) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => {
            return Err(AssignError::Configuration(format!(
                "{} is missing pathset columns",
                paths_path.display()
            )))
        }
    };
    for record in reader.records() {
        let record = record?;
        let request_id: usize = parse_field(&record, req_col)?;
        let path_num: usize = parse_field(&record, num_col)?;
        let cost: f64 = parse_field(&record, cost_col)?;
        let probability: f64 = parse_field(&record, prob_col)?;
        path_meta
            .entry(request_id)
            .or_default()
            .push((path_num, cost, probability));
    }

    let mut links: HashMap<(usize, usize), Vec<PathLink>> = HashMap::new();
    let mut reader = ReaderBuilder::new().from_path(&links_path)?;
    let headers = reader.headers()?.clone();
    let col = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| {
                AssignError::Configuration(format!(
                    "{} is missing column {name}",
                    links_path.display()
                ))
            })
    };
    let req_col = col("request_id")?;
    let num_col = col("path_num")?;
    let mode_col = col("linkmode")?;
    let trip_col = col("trip_id_num")?;
    let a_col = col("A_id_num")?;
    let b_col = col("B_id_num")?;
    let a_seq_col = col("A_seq")?;
    let b_seq_col = col("B_seq")?;
    let a_time_col = col("pf_A_time_min")?;
    let b_time_col = col("pf_B_time_min")?;
    let link_time_col = col("pf_linktime_min")?;
    let wait_col = col("pf_waittime_min")?;
    let cost_col = col("pf_cost")?;
    let dist_col = col("distance")?;

    for record in reader.records() {
        let record = record?;
        let request_id: usize = parse_field(&record, req_col)?;
        let path_num: usize = parse_field(&record, num_col)?;
        let mode_code: i32 = parse_field(&record, mode_col)?;
        let mode = match mode_code {
            MODE_ACCESS => LinkMode::Access,
            MODE_EGRESS => LinkMode::Egress,
            MODE_TRANSFER => LinkMode::Transfer,
            _ => LinkMode::Transit,
        };
        let mut link = PathLink::new(
            mode,
            parse_field(&record, a_col)?,
            parse_field(&record, b_col)?,
        );
        if mode.is_transit() {
            link.trip = Some(parse_field(&record, trip_col)?);
        }
        link.a_seq = parse_field(&record, a_seq_col)?;
        link.b_seq = parse_field(&record, b_seq_col)?;
        link.pf_a_time_min = parse_field(&record, a_time_col)?;
        link.pf_b_time_min = parse_field(&record, b_time_col)?;
        link.pf_link_time_min = parse_field(&record, link_time_col)?;
        link.pf_wait_time_min = parse_field(&record, wait_col)?;
        link.pf_link_cost = parse_field(&record, cost_col)?;
        link.dist = parse_field(&record, dist_col)?;
        links.entry((request_id, path_num)).or_default().push(link);
    }

    let mut request_ids: Vec<usize> = path_meta.keys().copied().collect();
    request_ids.sort_unstable();
    let mut pathsets = Vec::with_capacity(request_ids.len());
    for request_id in request_ids {
        let mut metas = path_meta.remove(&request_id).unwrap_or_default();
        metas.sort_by_key(|(num, _, _)| *num);
        let mut paths = Vec::with_capacity(metas.len());
        for (path_num, cost, probability) in metas {
            let path_links = links.remove(&(request_id, path_num)).unwrap_or_default();
            if path_links.is_empty() {
                continue;
            }
            let mut path = Path::new(path_links, cost, probability);
            path.chosen = ChosenStatus::NotChosenYet;
            paths.push(path);
        }
        if paths.is_empty() {
            continue;
        }
        pathsets.push(PathSet {
            request_id,
            paths,
            no_path: None,
            pf_iteration: 1,
        });
    }
    info!("read {} pathsets from {}", pathsets.len(), dir.display());
    Ok(pathsets)
}

fn parse_field<T: std::str::FromStr>(record: &csv::StringRecord, idx: usize) -> Result<T> {
    record
        .get(idx)
        .ok_or_else(|| AssignError::Configuration("short record in pathset file".into()))?
        .trim()
        .parse::<T>()
        .map_err(|_| {
            AssignError::Configuration(format!(
                "unparseable value [{}] in pathset file",
                record.get(idx).unwrap_or("")
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loading::VehicleLoadProfile;
    use crate::test_helpers::{chosen_transit_pathset, two_stop_supply};

    #[test]
    fn vehicle_load_appends_per_iteration() {
        let tmp = tempfile::tempdir().unwrap();
        let supply = two_stop_supply(Some(20.0));
        let profile = VehicleLoadProfile::from_supply(&supply);
        write_vehicle_load(tmp.path(), 0, &profile, &supply, false, false).unwrap();
        write_vehicle_load(tmp.path(), 1, &profile, &supply, false, true).unwrap();

        let contents = std::fs::read_to_string(tmp.path().join(VEHICLE_LOAD_FILE)).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        // header + two iterations of two rows each
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("iteration,"));
        assert!(lines[0].contains("capacity"));
        assert!(lines[1].starts_with("0,"));
        assert!(lines[3].starts_with("1,"));
    }

    #[test]
    fn capacity_column_omitted_without_capacities() {
        let tmp = tempfile::tempdir().unwrap();
        let supply = two_stop_supply(None);
        let profile = VehicleLoadProfile::from_supply(&supply);
        write_vehicle_load(tmp.path(), 0, &profile, &supply, false, false).unwrap();
        let contents = std::fs::read_to_string(tmp.path().join(VEHICLE_LOAD_FILE)).unwrap();
        assert!(!contents.lines().next().unwrap().contains("capacity"));
    }

    #[test]
    fn pathsets_round_trip_through_files() {
        let tmp = tempfile::tempdir().unwrap();
        let pathsets = vec![chosen_transit_pathset(0, 0, 1, 2)];
        let person_ids = HashMap::from([(0usize, "p0".to_string())]);
        let supply = two_stop_supply(None);
        write_pathsets(tmp.path(), 1, 0, &pathsets, &person_ids, &supply, false).unwrap();

        let reloaded = read_pathsets(tmp.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
        let path = &reloaded[0].paths[0];
        assert_eq!(path.links.len(), 3);
        assert_eq!(path.links[1].trip, Some(0));
        assert_eq!(path.links[1].a_seq, 1);
        assert_eq!(path.links[1].b_seq, 2);
        assert!((path.links[1].pf_a_time_min - 480.0).abs() < 1e-3);
        assert_eq!(path.chosen, ChosenStatus::NotChosenYet);
        assert!((path.pf_cost - 20.0).abs() < 1e-3);
    }
}
