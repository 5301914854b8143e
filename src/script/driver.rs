//! Scripted drivers: the benchmark worker that re-enters the compiled
//! async function until its deadline, and the one-shot CLI runner.

use crate::script::FetchLoop;
use crate::script::program::Program;
use crate::stats::WorkerStats;
use crate::url::Url;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One worker thread in async-function mode. Each invocation of the
/// script's function counts as one logical request; status classes are
/// not recovered per fetch, so a clean iteration counts as 2xx and a
/// failed one as an error.
pub fn run_bench_worker(
    id: usize,
    program: Arc<Program>,
    base: Option<Url>,
    duration: Duration,
) -> WorkerStats {
    let mut stats = WorkerStats::new();
    let mut fetch_loop = match FetchLoop::new(base) {
        Ok(l) => l,
        Err(e) => {
            warn!(worker = id, error = %e, "failed to create fetch loop");
            return stats;
        }
    };

    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        let start = Instant::now();
        let root = fetch_loop.call(Arc::clone(&program));
        let outcome = fetch_loop.run(root);

        let elapsed_us = start.elapsed().as_secs_f64() * 1e6;
        stats.requests += 1;
        stats.latency.add(elapsed_us);
        stats.timeout_errors += outcome.timeouts;
        if outcome.ok {
            stats.status_2xx += 1;
        } else {
            stats.errors += 1;
        }
    }
    debug!(worker = id, requests = stats.requests, "script worker finished");
    stats
}

/// CLI mode: run the module's top-level program once, draining every
/// pending job and fetch. Returns whether the script succeeded.
pub fn run_cli(program: Arc<Program>, base: Option<Url>) -> std::io::Result<bool> {
    let mut fetch_loop = FetchLoop::new(base)?;
    let root = fetch_loop.call(program);
    Ok(fetch_loop.run(root).ok)
}
