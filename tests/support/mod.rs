//! Threaded HTTP test server for the end-to-end scenarios.
//!
//! Routes:
//!   GET  /health        -> 200, body "OK"
//!   GET  /chunked       -> chunked body "Hello, chunked world!"
//!   GET  /status/<code> -> <code>, body "Status: <code>"
//!   POST /echo          -> echoes the request body
//!   anything else       -> 200, body = the path
//!
//! Connections are keep-alive; each accepted connection gets an id and
//! every request is logged as (connection id, path) so tests can check
//! per-connection round-robin ordering.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

pub struct TestServer {
    addr: SocketAddr,
    log: Arc<Mutex<Vec<(u64, String)>>>,
}

impl TestServer {
    pub fn spawn() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().unwrap();
        let log: Arc<Mutex<Vec<(u64, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let conn_ids = Arc::new(AtomicU64::new(0));

        let accept_log = Arc::clone(&log);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let id = conn_ids.fetch_add(1, Ordering::Relaxed);
                let log = Arc::clone(&accept_log);
                thread::spawn(move || serve_connection(stream, id, log));
            }
        });

        TestServer { addr, log }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Snapshot of (connection id, path) pairs in arrival order.
    pub fn request_log(&self) -> Vec<(u64, String)> {
        self.log.lock().unwrap().clone()
    }
}

struct ParsedRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream, carry: &mut Vec<u8>) -> Option<ParsedRequest> {
    let mut buf = [0u8; 16 * 1024];
    loop {
        // Parse in an inner scope so the header borrows of `carry`
        // end before it is refilled.
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(&carry[..]) {
                Ok(httparse::Status::Complete(header_len)) => {
                    let method = req.method.unwrap_or("GET").to_string();
                    let path = req.path.unwrap_or("/").to_string();
                    let content_length = req
                        .headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                        .and_then(|h| std::str::from_utf8(h.value).ok())
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    Some((header_len, method, path, content_length))
                }
                Ok(httparse::Status::Partial) => None,
                Err(_) => return None,
            }
        };

        match parsed {
            Some((header_len, method, path, content_length)) => {
                while carry.len() < header_len + content_length {
                    let n = stream.read(&mut buf).ok()?;
                    if n == 0 {
                        return None;
                    }
                    carry.extend_from_slice(&buf[..n]);
                }
                let body = carry[header_len..header_len + content_length].to_vec();
                carry.drain(..header_len + content_length);
                return Some(ParsedRequest { method, path, body });
            }
            None => {
                let n = stream.read(&mut buf).ok()?;
                if n == 0 {
                    return None;
                }
                carry.extend_from_slice(&buf[..n]);
            }
        }
    }
}

fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

fn send_response(stream: &mut TcpStream, code: u16, content_type: &str, body: &[u8]) -> bool {
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        code,
        reason(code),
        content_type,
        body.len()
    );
    stream.write_all(header.as_bytes()).is_ok() && stream.write_all(body).is_ok()
}

fn send_chunked(stream: &mut TcpStream) -> bool {
    let header = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n";
    if stream.write_all(header.as_bytes()).is_err() {
        return false;
    }
    for chunk in ["Hello, ", "chunked ", "world!"] {
        let piece = format!("{:x}\r\n{}\r\n", chunk.len(), chunk);
        if stream.write_all(piece.as_bytes()).is_err() {
            return false;
        }
    }
    stream.write_all(b"0\r\n\r\n").is_ok()
}

fn serve_connection(mut stream: TcpStream, conn_id: u64, log: Arc<Mutex<Vec<(u64, String)>>>) {
    let _ = stream.set_nodelay(true);
    let mut carry: Vec<u8> = Vec::new();

    while let Some(req) = read_request(&mut stream, &mut carry) {
        log.lock().unwrap().push((conn_id, req.path.clone()));

        let alive = if req.path == "/health" {
            send_response(&mut stream, 200, "text/plain", b"OK")
        } else if req.path == "/chunked" {
            send_chunked(&mut stream)
        } else if let Some(code) = req.path.strip_prefix("/status/") {
            let code: u16 = code.parse().unwrap_or(200);
            let body = format!("Status: {code}");
            send_response(&mut stream, code, "text/plain", body.as_bytes())
        } else if req.path == "/echo" && req.method == "POST" {
            send_response(&mut stream, 200, "application/json", &req.body)
        } else {
            send_response(&mut stream, 200, "text/plain", req.path.as_bytes())
        };

        if !alive {
            break;
        }
    }
}
