//! Per-worker counters and the aggregate result report.
//!
//! Each worker owns a `WorkerStats`; the main thread merges them after
//! all workers have joined. No locking: the merge happens under the
//! join barrier.

mod hist;

pub use hist::Histogram;

use std::time::Duration;

#[derive(Default, Clone)]
pub struct WorkerStats {
    pub requests: u64,
    pub bytes_read: u64,
    pub errors: u64,
    pub connect_errors: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub timeout_errors: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub latency: Histogram,
}

impl WorkerStats {
    pub fn new() -> WorkerStats {
        WorkerStats::default()
    }

    pub fn record_status(&mut self, code: u16) {
        match code {
            200..=299 => self.status_2xx += 1,
            300..=399 => self.status_3xx += 1,
            400..=499 => self.status_4xx += 1,
            500.. => self.status_5xx += 1,
            _ => {}
        }
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.requests += other.requests;
        self.bytes_read += other.bytes_read;
        self.errors += other.errors;
        self.connect_errors += other.connect_errors;
        self.read_errors += other.read_errors;
        self.write_errors += other.write_errors;
        self.timeout_errors += other.timeout_errors;
        self.status_2xx += other.status_2xx;
        self.status_3xx += other.status_3xx;
        self.status_4xx += other.status_4xx;
        self.status_5xx += other.status_5xx;
        self.latency.merge(&other.latency);
    }
}

/// "1.5 KB", "3.2 MB", ...
pub fn format_bytes(bytes: u64) -> String {
    const GB: f64 = 1_073_741_824.0;
    const MB: f64 = 1_048_576.0;
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.1} GB", b / GB)
    } else if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

/// Microseconds rendered at a human scale: "843.00us", "12.50ms", "1.20s".
pub fn format_duration_us(us: f64) -> String {
    if us >= 1_000_000.0 {
        format!("{:.2}s", us / 1_000_000.0)
    } else if us >= 1000.0 {
        format!("{:.2}ms", us / 1000.0)
    } else {
        format!("{us:.2}us")
    }
}

/// Print the aggregate result table.
pub fn print_report(stats: &WorkerStats, elapsed: Duration) {
    let duration_sec = elapsed.as_secs_f64();
    let qps = if duration_sec > 0.0 {
        stats.requests as f64 / duration_sec
    } else {
        0.0
    };
    let h = &stats.latency;

    println!();
    println!("  requests:  {}", stats.requests);
    println!("  duration:  {duration_sec:.2}s");
    println!("  bytes:     {}", format_bytes(stats.bytes_read));
    println!("  errors:    {}", stats.errors);
    println!("  qps:       {qps:.1}");
    println!();
    println!("  latency    min       avg       max       stdev");
    println!(
        "             {:<10}{:<10}{:<10}{:<10}",
        format_duration_us(h.min()),
        format_duration_us(h.mean()),
        format_duration_us(h.max()),
        format_duration_us(h.stdev()),
    );
    println!();
    println!("  percentile p50       p90       p99       p999");
    println!(
        "             {:<10}{:<10}{:<10}{:<10}",
        format_duration_us(h.percentile(50.0)),
        format_duration_us(h.percentile(90.0)),
        format_duration_us(h.percentile(99.0)),
        format_duration_us(h.percentile(99.9)),
    );
    println!();
    println!("  status     2xx       3xx       4xx       5xx");
    println!(
        "             {:<10}{:<10}{:<10}{:<10}",
        stats.status_2xx, stats.status_3xx, stats.status_4xx, stats.status_5xx,
    );
    println!();
    println!("  errors     connect   read      write     timeout");
    println!(
        "             {:<10}{:<10}{:<10}{:<10}",
        stats.connect_errors, stats.read_errors, stats.write_errors, stats.timeout_errors,
    );
    println!();
}
