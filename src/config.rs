//! Benchmark configuration assembled from the script's `bench` export.

use std::time::Duration;

/// Workload mode detected from the script's default export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No default export: run the script once as a plain module.
    Cli,
    /// Default export is a URL string.
    BenchString,
    /// Default export is a request descriptor object.
    BenchObject,
    /// Default export is an array (round-robined per connection).
    BenchArray,
    /// Default export is an async function (scripted driver).
    BenchAsync,
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Cli => "cli",
            Mode::BenchString => "string",
            Mode::BenchObject => "object",
            Mode::BenchArray => "array",
            Mode::BenchAsync => "async function",
        }
    }
}

/// Parsed once from the `bench` export, immutable during the run.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub connections: usize,
    pub threads: usize,
    pub duration: Duration,
    /// Absolute base URL for path-only entries and DNS.
    pub target: Option<String>,
    /// Overrides the `Host:` header value.
    pub host: Option<String>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            connections: 1,
            threads: 1,
            duration: Duration::ZERO,
            target: None,
            host: None,
        }
    }
}

impl BenchConfig {
    /// Apply the defaults and clamps of the benchmark entry point:
    /// at least one connection and thread, no more threads than
    /// connections, 10 s duration when none was given.
    pub fn normalized(mut self) -> Self {
        if self.connections == 0 {
            self.connections = 1;
        }
        if self.threads == 0 {
            self.threads = 1;
        }
        if self.threads > self.connections {
            self.threads = self.connections;
        }
        if self.duration.is_zero() {
            self.duration = Duration::from_secs(10);
        }
        self
    }
}

/// Parse a duration spec: leading decimal number, then an optional unit
/// suffix. `s`/`S` or nothing means seconds, `ms`/`MS` milliseconds,
/// `m`/`M` minutes, `h`/`H` hours. Unparsable input yields zero (the
/// caller substitutes the default).
pub fn parse_duration(s: &str) -> Duration {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let Ok(value) = s[..split].parse::<f64>() else {
        return Duration::ZERO;
    };
    if value <= 0.0 {
        return Duration::ZERO;
    }

    let secs = match &s[split..] {
        "" | "s" | "S" => value,
        u if u.eq_ignore_ascii_case("ms") => value / 1000.0,
        u if u.eq_ignore_ascii_case("m") => value * 60.0,
        u if u.eq_ignore_ascii_case("h") => value * 3600.0,
        _ => value,
    };
    Duration::from_secs_f64(secs)
}
