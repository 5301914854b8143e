//! Benchmark orchestration: resolve the target once, share the
//! serialized requests and TLS config read-only, fan out worker
//! threads, then join and merge their stats under the barrier.

pub mod worker;

use crate::client::TlsConfig;
use crate::config::{BenchConfig, Mode};
use crate::error::Error;
use crate::request::RawRequest;
use crate::script::driver;
use crate::script::program::Program;
use crate::stats::{self, WorkerStats};
use crate::url::Url;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub use worker::{Shared, Worker};

pub struct Summary {
    pub stats: WorkerStats,
    pub elapsed: Duration,
}

fn resolve(url: &Url) -> Result<SocketAddr, Error> {
    (url.host.as_str(), url.port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::Dns {
            host: url.host.clone(),
            port: url.port,
        })
}

fn print_banner(cfg: &BenchConfig, target: Option<&Url>, mode: Mode, request_count: usize) {
    print!(
        "Running benchmark: {} connection(s), {} thread(s)",
        cfg.connections, cfg.threads
    );
    if !cfg.duration.is_zero() {
        print!(", {:.0}s duration", cfg.duration.as_secs_f64());
    }
    println!();
    if let Some(url) = target {
        println!("Target: {url}");
    }
    match mode {
        Mode::BenchAsync => println!("Mode: async function (script path)"),
        Mode::BenchArray => println!("Mode: array round-robin ({request_count} endpoints)"),
        other => println!("Mode: {} (request path)", other.label()),
    }
    println!();
}

/// Split `total` across `parts` workers, remainder to the first ones.
fn distribute(total: usize, parts: usize) -> Vec<usize> {
    let base = total / parts;
    let extra = total % parts;
    (0..parts)
        .map(|i| base + usize::from(i < extra))
        .collect()
}

/// Run the request-path benchmark over pre-serialized requests.
pub fn run_requests(
    requests: Vec<RawRequest>,
    cfg: &BenchConfig,
    mode: Mode,
) -> Result<Summary, Error> {
    if requests.is_empty() {
        return Err(Error::EmptyWorkload);
    }

    // DNS is resolved once, against the target override when present.
    let dns_url = match cfg.target.as_deref() {
        Some(target) => Url::parse(target).unwrap_or_else(|_| requests[0].url.clone()),
        None => requests[0].url.clone(),
    };
    let addr = resolve(&dns_url)?;

    let tls = if requests[0].url.is_tls() {
        Some(TlsConfig::new().map_err(|e| Error::TlsInit(e.to_string()))?)
    } else {
        None
    };

    print_banner(cfg, Some(&requests[0].url), mode, requests.len());
    info!(connections = cfg.connections, threads = cfg.threads, "starting request-path run");

    let hostname = requests[0].url.host.clone();
    let shares = distribute(cfg.connections, cfg.threads);
    let start = Instant::now();

    let worker_stats: Vec<WorkerStats> = std::thread::scope(|scope| {
        let handles: Vec<_> = shares
            .iter()
            .enumerate()
            .map(|(id, &conn_count)| {
                let requests = &requests;
                let tls = tls.as_ref();
                let hostname = hostname.as_str();
                scope.spawn(move || {
                    let shared = Shared {
                        requests,
                        addr,
                        tls,
                        hostname,
                        duration: cfg.duration,
                    };
                    let mut worker = Worker::new(id, conn_count);
                    worker.run(&shared);
                    worker.stats
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let elapsed = start.elapsed();
    let mut total = WorkerStats::new();
    for s in &worker_stats {
        total.merge(s);
    }
    stats::print_report(&total, elapsed);

    Ok(Summary {
        stats: total,
        elapsed,
    })
}

/// Run the scripted benchmark: every worker owns a fetch loop and
/// re-enters the compiled async function until the deadline.
pub fn run_script(
    program: Arc<Program>,
    cfg: &BenchConfig,
) -> Result<Summary, Error> {
    let base = match cfg.target.as_deref() {
        Some(target) => Some(Url::parse(target)?),
        None => None,
    };

    // Fail TLS init up front when the target is https, like the
    // request path does.
    if base.as_ref().is_some_and(|u| u.is_tls()) {
        TlsConfig::new().map_err(|e| Error::TlsInit(e.to_string()))?;
    }

    print_banner(cfg, base.as_ref(), Mode::BenchAsync, 1);
    info!(threads = cfg.threads, "starting script-path run");

    let start = Instant::now();
    let worker_stats: Vec<WorkerStats> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..cfg.threads)
            .map(|id| {
                let program = Arc::clone(&program);
                let base = base.clone();
                scope.spawn(move || driver::run_bench_worker(id, program, base, cfg.duration))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let elapsed = start.elapsed();
    let mut total = WorkerStats::new();
    for s in &worker_stats {
        total.merge(s);
    }
    stats::print_report(&total, elapsed);

    Ok(Summary {
        stats: total,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_spreads_remainder() {
        assert_eq!(distribute(10, 3), vec![4, 3, 3]);
        assert_eq!(distribute(4, 2), vec![2, 2]);
        assert_eq!(distribute(1, 1), vec![1]);
    }
}
