//! volley: a scriptable HTTP/1.1 load generator.
//!
//! A script module's default export describes the workload (a URL
//! string, a request descriptor, an array of them round-robined per
//! connection, or an async function issuing `fetch()` calls) and an
//! optional `bench` export configures connections, threads, duration,
//! target base URL and `Host:` override. Workers drive keep-alive
//! connections on per-thread epoll reactors and merge latency and
//! status statistics at the end of the run.

pub mod bench;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod reactor;
pub mod request;
pub mod script;
pub mod stats;
pub mod url;

pub use error::Error;
