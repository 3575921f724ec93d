//! Parallel per-request pathfinding over a shared immutable supply
//! snapshot.
//!
//! Workers pull requests off a shared counter and report through a result
//! queue; the caller's thread drains the queue, keeps results by request,
//! and survives worker crashes. Requests in flight on a crashed worker come
//! back as empty pathsets marked [`NoPathReason::WorkerCrash`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

use crate::demand::Request;
use crate::error::{AssignError, Result};
use crate::labeling::{PathfindingOutcome, Pathfinder, PerfCounters, SearchContext};
use crate::pathset::{NoPathReason, PathSet};

/// Worker lifecycle messages on the result queue.
pub enum WorkerStatus {
    Starting {
        request_id: usize,
    },
    Completed {
        index: usize,
        outcome: Box<PathfindingOutcome>,
    },
    Done,
    Exception {
        message: String,
    },
}

pub struct WorkerMessage {
    pub worker_id: usize,
    pub status: WorkerStatus,
}

/// How many workers to actually run: configuration wins, cores fill in for
/// values under 1, and the pool shrinks so every worker has at least three
/// requests to chew on.
pub fn resolve_worker_count(number_of_processes: i32, num_requests: usize) -> usize {
    let mut workers = if number_of_processes < 1 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        number_of_processes as usize
    };
    if workers > 1 && num_requests < workers.saturating_mul(3) {
        workers = (num_requests / 3).max(1);
    }
    workers
}

fn progress_bar(total: usize, show: bool) -> Option<ProgressBar> {
    if !show || total == 0 {
        return None;
    }
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );
    Some(bar)
}

/// Find pathsets for every request, in parallel when it pays off.
///
/// The returned vector is aligned with `requests`. Worker crashes are
/// non-fatal; only pool construction or a configuration error out of a
/// serial search aborts.
pub fn find_pathsets(
    pathfinder: &dyn Pathfinder,
    requests: &[Request],
    ctx: &SearchContext<'_>,
    iteration: u32,
    number_of_processes: i32,
    show_progress: bool,
) -> Result<Vec<PathfindingOutcome>> {
    let workers = resolve_worker_count(number_of_processes, requests.len());
    let bar = progress_bar(requests.len(), show_progress);

    if workers <= 1 {
        debug!("single-process pathfinding for {} requests", requests.len());
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(pathfinder.find_pathset(request, ctx, iteration)?);
            if let Some(ref b) = bar {
                b.inc(1);
            }
        }
        if let Some(ref b) = bar {
            b.finish_and_clear();
        }
        return Ok(outcomes);
    }

    info!(
        "pathfinding for {} requests across {} workers",
        requests.len(),
        workers
    );
    // One extra thread: the result collector blocks inside the scope and
    // must not starve a worker.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers + 1)
        .build()
        .map_err(|e| AssignError::Configuration(format!("failed to build worker pool: {e}")))?;

    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<WorkerMessage>();
    let mut outcomes: Vec<Option<PathfindingOutcome>> = Vec::with_capacity(requests.len());
    outcomes.resize_with(requests.len(), || None);

    pool.scope(|scope| {
        // Move the receiver into this closure; a borrow would not be Send.
        let rx = rx;
        for worker_id in 0..workers {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move |_| {
                debug!("worker {worker_id} starting");
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    if index >= requests.len() {
                        break;
                    }
                    let request = &requests[index];
                    let _ = tx.send(WorkerMessage {
                        worker_id,
                        status: WorkerStatus::Starting {
                            request_id: request.request_id,
                        },
                    });
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        pathfinder.find_pathset(request, ctx, iteration)
                    }));
                    let status = match result {
                        Ok(Ok(outcome)) => WorkerStatus::Completed {
                            index,
                            outcome: Box::new(outcome),
                        },
                        Ok(Err(e)) => WorkerStatus::Exception {
                            message: e.to_string(),
                        },
                        Err(_) => WorkerStatus::Exception {
                            message: "worker panicked".to_string(),
                        },
                    };
                    let fatal = matches!(status, WorkerStatus::Exception { .. });
                    let _ = tx.send(WorkerMessage { worker_id, status });
                    if fatal {
                        return;
                    }
                }
                let _ = tx.send(WorkerMessage {
                    worker_id,
                    status: WorkerStatus::Done,
                });
            });
        }
        drop(tx);

        let mut in_flight: Vec<Option<usize>> = vec![None; workers];
        let mut live_workers = workers;
        while live_workers > 0 {
            match rx.recv_timeout(Duration::from_secs(30)) {
                Ok(msg) => match msg.status {
                    WorkerStatus::Starting { request_id } => {
                        in_flight[msg.worker_id] = Some(request_id);
                    }
                    WorkerStatus::Completed { index, outcome } => {
                        outcomes[index] = Some(*outcome);
                        in_flight[msg.worker_id] = None;
                        if let Some(ref b) = bar {
                            b.inc(1);
                        }
                    }
                    WorkerStatus::Done => {
                        debug!("worker {} done", msg.worker_id);
                        live_workers -= 1;
                    }
                    WorkerStatus::Exception { message } => {
                        match in_flight[msg.worker_id] {
                            Some(request_id) => warn!(
                                "worker {} crashed while working on request {}: {}",
                                msg.worker_id, request_id, message
                            ),
                            None => warn!("worker {} crashed: {}", msg.worker_id, message),
                        }
                        live_workers -= 1;
                    }
                },
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    debug!("still waiting on {live_workers} workers");
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    if let Some(ref b) = bar {
        b.finish_and_clear();
    }

    Ok(outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| {
            outcome.unwrap_or_else(|| {
                let request = &requests[index];
                warn!(
                    "request {} failed in a crashed worker; recording an empty pathset",
                    request.request_id
                );
                PathfindingOutcome {
                    pathset: PathSet::empty(
                        request.request_id,
                        NoPathReason::WorkerCrash,
                        iteration,
                    ),
                    perf: PerfCounters::default(),
                }
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::BumpWait;
    use crate::choice::WeightRegistry;
    use crate::config::PathfindingConfig;
    use crate::labeling::DeterministicPathfinder;
    use crate::test_helpers::{outbound_request, two_stop_supply};

    #[test]
    fn worker_count_needs_three_requests_each() {
        assert_eq!(resolve_worker_count(4, 100), 4);
        assert_eq!(resolve_worker_count(4, 11), 3);
        assert_eq!(resolve_worker_count(4, 2), 1);
        assert_eq!(resolve_worker_count(1, 100), 1);
    }

    #[test]
    fn parallel_matches_serial() {
        let supply = two_stop_supply(None);
        let bump_wait = BumpWait::new();
        let registry = WeightRegistry::new();
        let config = PathfindingConfig::default();
        let ctx = SearchContext {
            supply: &supply,
            bump_wait: &bump_wait,
            weights: &registry,
            config: &config,
            bump_buffer_min: 5.0,
            base_seed: 7,
        };
        let requests: Vec<_> = (0..12).map(|i| outbound_request(i, 0, 1, 495.0)).collect();

        let serial =
            find_pathsets(&DeterministicPathfinder, &requests, &ctx, 1, 1, false).unwrap();
        let parallel =
            find_pathsets(&DeterministicPathfinder, &requests, &ctx, 1, 4, false).unwrap();
        assert_eq!(serial.len(), parallel.len());
        for (a, b) in serial.iter().zip(&parallel) {
            assert_eq!(a.pathset.request_id, b.pathset.request_id);
            assert_eq!(a.pathset.paths.len(), b.pathset.paths.len());
            for (pa, pb) in a.pathset.paths.iter().zip(&b.pathset.paths) {
                assert_eq!(pa.pf_cost, pb.pf_cost);
            }
        }
    }
}
