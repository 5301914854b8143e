//! Request-path worker: drives a shard of keep-alive connections on
//! one reactor until the duration timer fires.
//!
//! Connection slots live in a slab; the slab key is the reactor token,
//! so reconnecting a slot never invalidates in-flight events for other
//! slots. On error the slot is reconnected in place, keeping the
//! worker's assigned connection count stable.

use crate::client::{ConnState, Connection, FailureKind, TlsConfig};
use crate::reactor::{Event, Interest, Poller, Timers};
use crate::request::RawRequest;
use crate::stats::WorkerStats;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Read-only inputs shared by all workers of a run.
pub struct Shared<'a> {
    pub requests: &'a [RawRequest],
    pub addr: SocketAddr,
    pub tls: Option<&'a TlsConfig>,
    /// SNI / reconnect hostname (the first request's host).
    pub hostname: &'a str,
    pub duration: Duration,
}

impl Shared<'_> {
    fn tls_pair(&self) -> Option<(&TlsConfig, &str)> {
        self.tls.map(|config| (config, self.hostname))
    }
}

enum WorkerTimer {
    Stop,
}

pub struct Worker {
    pub id: usize,
    pub conn_count: usize,
    pub stats: WorkerStats,
    stop: AtomicBool,
}

impl Worker {
    pub fn new(id: usize, conn_count: usize) -> Worker {
        Worker {
            id,
            conn_count,
            stats: WorkerStats::new(),
            stop: AtomicBool::new(false),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn run(&mut self, shared: &Shared<'_>) {
        let mut poller = match Poller::new() {
            Ok(p) => p,
            Err(e) => {
                warn!(worker = self.id, error = %e, "failed to create reactor");
                return;
            }
        };
        let mut timers: Timers<WorkerTimer> = Timers::new();
        let epoch = Instant::now();
        timers.add(shared.duration.as_millis() as u64, WorkerTimer::Stop);

        let mut conns: Slab<Connection> = Slab::with_capacity(self.conn_count);
        let mut active = 0usize;

        for i in 0..self.conn_count {
            match Connection::connect(shared.addr, shared.tls_pair()) {
                Ok(mut conn) => {
                    let req_idx = i % shared.requests.len();
                    conn.req_index = req_idx;
                    conn.set_output(Arc::clone(&shared.requests[req_idx].data));
                    let entry = conns.vacant_entry();
                    let token = entry.key();
                    if poller.add(conn.raw_fd(), token, Interest::ReadWrite).is_err() {
                        self.stats.connect_errors += 1;
                        self.stats.errors += 1;
                        continue;
                    }
                    entry.insert(conn);
                    active += 1;
                }
                Err(e) => {
                    debug!(worker = self.id, error = %e, "connect failed");
                    self.stats.connect_errors += 1;
                    self.stats.errors += 1;
                }
            }
        }

        let mut events: Vec<Event> = Vec::with_capacity(256);
        while !self.stopped() && active > 0 {
            let now = epoch.elapsed().as_millis() as u64;
            let timeout = match timers.next_deadline() {
                None => 100,
                Some(deadline) => deadline.saturating_sub(now).min(100) as i32,
            };

            if poller.poll(&mut events, timeout).is_err() {
                break;
            }

            for i in 0..events.len() {
                let ev = events[i];
                let Some(conn) = conns.get_mut(ev.token) else {
                    continue;
                };
                if ev.error {
                    conn.fail();
                } else {
                    if ev.writable {
                        conn.drive_write();
                    }
                    if ev.readable {
                        conn.drive_read();
                    }
                }
                self.process(ev.token, &mut conns, &poller, shared);
            }

            let now = epoch.elapsed().as_millis() as u64;
            for timer in timers.expire(now) {
                match timer {
                    WorkerTimer::Stop => self.stop.store(true, Ordering::Relaxed),
                }
            }
        }
    }

    /// Post-I/O bookkeeping for one slot: record a completion, recover
    /// an error by reconnecting in place, or re-assert the interest
    /// mask for a connection still in flight.
    fn process(
        &mut self,
        token: usize,
        conns: &mut Slab<Connection>,
        poller: &Poller,
        shared: &Shared<'_>,
    ) {
        let conn = &mut conns[token];
        match conn.state() {
            ConnState::Done => {
                self.stats.requests += 1;
                self.stats.bytes_read += conn.parser().body_len() as u64;
                self.stats.latency.add(conn.elapsed_us());
                self.stats.record_status(conn.parser().status_code());

                if self.stopped() {
                    return;
                }

                let next = (conn.req_index + 1) % shared.requests.len();
                conn.req_index = next;

                if conn.keepalive() {
                    conn.reuse();
                    conn.set_output(Arc::clone(&shared.requests[next].data));
                    let _ = poller.modify(conn.raw_fd(), token, Interest::ReadWrite);
                } else {
                    let _ = poller.delete(conn.raw_fd());
                    conn.reconnect(shared.addr, shared.tls_pair());
                    if conn.state() == ConnState::Error {
                        self.stats.connect_errors += 1;
                        self.stats.errors += 1;
                        return;
                    }
                    conn.set_output(Arc::clone(&shared.requests[next].data));
                    let _ = poller.add(conn.raw_fd(), token, Interest::ReadWrite);
                }
            }
            ConnState::Error => {
                self.stats.errors += 1;
                match conn.failure() {
                    Some(FailureKind::Read) => self.stats.read_errors += 1,
                    Some(FailureKind::Write) => self.stats.write_errors += 1,
                    _ => self.stats.connect_errors += 1,
                }

                if self.stopped() {
                    return;
                }

                debug!(worker = self.id, slot = token, "reconnecting after error");
                let _ = poller.delete(conn.raw_fd());
                conn.reconnect(shared.addr, shared.tls_pair());
                if conn.state() == ConnState::Error {
                    // Synchronous reconnect failure: leave the slot closed.
                    self.stats.connect_errors += 1;
                    self.stats.errors += 1;
                    return;
                }
                let idx = conn.req_index;
                conn.set_output(Arc::clone(&shared.requests[idx].data));
                let _ = poller.add(conn.raw_fd(), token, Interest::ReadWrite);
            }
            _ => {
                let _ = poller.modify(conn.raw_fd(), token, conn.interest());
            }
        }
    }
}
