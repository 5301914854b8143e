//! Request templates and their wire form.
//!
//! A template is created once by the workload extractor, frozen, and
//! shared read-only by every connection; the serialized bytes live in
//! an `Arc<[u8]>` so workers never copy or lock.

use crate::url::Url;
use std::sync::Arc;

/// One workload entry, all fields owned.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub url: Url,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RequestSpec {
    pub fn get(url: Url) -> RequestSpec {
        RequestSpec {
            url,
            method: "GET".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// A pre-serialized request plus the URL it targets.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub data: Arc<[u8]>,
    pub url: Url,
}

/// Serialize to wire form: request line, `Host:` (port only when
/// non-default and no override), user headers, `Connection:
/// keep-alive`, `Content-Length` iff the body is non-empty, blank
/// line, body.
pub fn serialize(spec: &RequestSpec, host_override: Option<&str>) -> RawRequest {
    let url = &spec.url;
    let path = if url.path.is_empty() { "/" } else { &url.path };

    let mut out = Vec::with_capacity(128 + spec.body.len());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", spec.method, path).as_bytes());

    match host_override {
        Some(host) => out.extend_from_slice(format!("Host: {host}\r\n").as_bytes()),
        None if !url.is_default_port() => {
            out.extend_from_slice(format!("Host: {}:{}\r\n", url.host, url.port).as_bytes())
        }
        None => out.extend_from_slice(format!("Host: {}\r\n", url.host).as_bytes()),
    }

    for (name, value) in &spec.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    out.extend_from_slice(b"Connection: keep-alive\r\n");
    if !spec.body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", spec.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&spec.body);

    RawRequest {
        data: Arc::from(out.into_boxed_slice()),
        url: spec.url.clone(),
    }
}
