//! Pending fetch assembly: from a `fetch(url, init)` call to a
//! connected, registered request in flight.
//!
//! A pending fetch owns its connection (with parser), the promise it
//! will settle, and its timeout timer handle. It lives in the fetch
//! loop's slab; removal from the slab *is* destruction, which makes
//! destruction idempotent: a later event or timer for the same token
//! finds nothing.

use crate::client::{Connection, TlsConfig};
use crate::reactor::TimerHandle;
use crate::request::{self, RequestSpec};
use crate::script::ScriptError;
use crate::script::value::PromiseId;
use crate::url::Url;
use std::net::{SocketAddr, ToSocketAddrs};

/// Per-fetch deadline.
pub const FETCH_TIMEOUT_MS: u64 = 30 * 1000;

pub struct PendingFetch {
    pub conn: Connection,
    pub promise: PromiseId,
    pub timer: TimerHandle,
}

/// Evaluated `fetch` arguments.
#[derive(Default)]
pub struct FetchArgs {
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

fn resolve_addr(url: &Url) -> Result<SocketAddr, ScriptError> {
    (url.host.as_str(), url.port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| {
            ScriptError::Runtime(format!("DNS resolution failed: {}:{}", url.host, url.port))
        })
}

/// Resolve the fetch target: path-only URLs join against the bench
/// target base, anything else must be an absolute http/https URL.
pub fn resolve_url(raw: &str, base: Option<&Url>) -> Result<Url, ScriptError> {
    if raw.starts_with('/') {
        return match base {
            Some(base) => Ok(base.with_path(raw)),
            None => Err(ScriptError::Runtime(format!(
                "relative fetch url '{raw}' without a bench target"
            ))),
        };
    }
    Url::parse(raw).map_err(|_| ScriptError::Runtime("Invalid URL".to_string()))
}

/// Build and launch the connection for one fetch: parse, serialize,
/// resolve, connect non-blocking, install the output. The TLS client
/// config is created lazily once per loop and reused.
pub fn open(
    raw_url: &str,
    args: FetchArgs,
    base: Option<&Url>,
    tls_cache: &mut Option<TlsConfig>,
) -> Result<Connection, ScriptError> {
    let url = resolve_url(raw_url, base)?;
    let addr = resolve_addr(&url)?;

    let spec = RequestSpec {
        url: url.clone(),
        method: args.method.unwrap_or_else(|| "GET".to_string()),
        headers: args.headers,
        body: args.body.map(String::into_bytes).unwrap_or_default(),
    };
    let raw = request::serialize(&spec, None);

    let tls_pair = if url.is_tls() {
        if tls_cache.is_none() {
            *tls_cache = Some(
                TlsConfig::new()
                    .map_err(|e| ScriptError::Runtime(format!("TLS init failed: {e}")))?,
            );
        }
        tls_cache.as_ref().map(|config| (config, url.host.as_str()))
    } else {
        None
    };

    let mut conn = Connection::connect(addr, tls_pair)
        .map_err(|e| ScriptError::Runtime(format!("Connection failed: {e}")))?;
    conn.set_output(raw.data);
    Ok(conn)
}
