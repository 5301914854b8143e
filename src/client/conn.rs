//! Non-blocking HTTP connection state machine.
//!
//! Lifecycle per request cycle:
//! `Connecting → TlsHandshake? → Writing → Reading → Done | Error`.
//! After `Done`, keep-alive `reuse()` rewinds to `Writing` on the same
//! socket; otherwise `reconnect()` replaces the socket in place so the
//! worker's slot count stays stable.
//!
//! All I/O paths drain until `WouldBlock`: registration is
//! edge-triggered and a handler that returns early loses its wakeup.

use crate::client::tls::{HandshakeStatus, TlsConfig, TlsSession};
use crate::http::{FeedStatus, Phase, ResponseParser};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

const READ_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    TlsHandshake,
    Writing,
    Reading,
    Done,
    Error,
}

/// Which phase a failed cycle died in. Connect covers TCP connect and
/// the TLS handshake; parse failures count as read failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connect,
    Read,
    Write,
}

pub struct Connection {
    sock: TcpStream,
    tls: Option<TlsSession>,
    state: ConnState,
    output: Arc<[u8]>,
    sent: usize,
    parser: ResponseParser,
    start: Instant,
    failure: Option<FailureKind>,
    /// Round-robin position in the request list (array mode).
    pub req_index: usize,
}

fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    let domain = Domain::for_address(addr);
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    sock.set_tcp_nodelay(true)?;
    match sock.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

impl Connection {
    /// Open a non-blocking socket toward `addr` and start connecting.
    /// With a TLS config present a session is prepared with SNI set to
    /// `hostname`. A synchronous failure leaves no socket behind.
    pub fn connect(
        addr: SocketAddr,
        tls: Option<(&TlsConfig, &str)>,
    ) -> io::Result<Connection> {
        let sock = connect_nonblocking(addr)?;
        let tls = match tls {
            Some((config, hostname)) => Some(TlsSession::new(config, hostname)?),
            None => None,
        };
        Ok(Connection {
            sock,
            tls,
            state: ConnState::Connecting,
            output: Arc::from(&b""[..]),
            sent: 0,
            parser: ResponseParser::new(),
            start: Instant::now(),
            failure: None,
            req_index: 0,
        })
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn parser(&self) -> &ResponseParser {
        &self.parser
    }

    /// Which phase the last failure happened in, once `state` is
    /// `Error`.
    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    fn fail_with(&mut self, kind: FailureKind) {
        self.state = ConnState::Error;
        self.failure = Some(kind);
    }

    /// Microseconds since this request cycle started.
    pub fn elapsed_us(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1e6
    }

    /// Install the serialized request and rewind the cursor.
    pub fn set_output(&mut self, data: Arc<[u8]>) {
        self.output = data;
        self.sent = 0;
    }

    /// Interest mask the reactor should watch after the last
    /// transition: write states want both edges, reading wants only
    /// readability.
    pub fn interest(&self) -> crate::reactor::Interest {
        match self.state {
            ConnState::Connecting | ConnState::TlsHandshake | ConnState::Writing => {
                crate::reactor::Interest::ReadWrite
            }
            _ => crate::reactor::Interest::ReadOnly,
        }
    }

    /// Writable-edge driver, state-dependent.
    pub fn drive_write(&mut self) {
        match self.state {
            ConnState::Connecting => {
                match self.sock.take_error() {
                    Ok(None) => {}
                    Ok(Some(_)) | Err(_) => {
                        self.fail_with(FailureKind::Connect);
                        return;
                    }
                }
                if self.tls.is_some() {
                    self.state = ConnState::TlsHandshake;
                    self.advance_handshake();
                } else {
                    self.state = ConnState::Writing;
                    self.write_some();
                }
            }
            ConnState::TlsHandshake => self.advance_handshake(),
            ConnState::Writing => self.write_some(),
            _ => {}
        }
    }

    /// Readable-edge driver. During the handshake a readable edge still
    /// advances the handshake; in `Reading` it drains and parses.
    pub fn drive_read(&mut self) {
        match self.state {
            ConnState::TlsHandshake => self.advance_handshake(),
            ConnState::Reading => self.read_some(),
            _ => {}
        }
    }

    /// Reactor error flag: terminal for this cycle, classified by the
    /// phase it interrupted.
    pub fn fail(&mut self) {
        let kind = match self.state {
            ConnState::Reading => FailureKind::Read,
            ConnState::Writing => FailureKind::Write,
            _ => FailureKind::Connect,
        };
        self.fail_with(kind);
    }

    fn advance_handshake(&mut self) {
        let Some(tls) = self.tls.as_mut() else {
            self.fail_with(FailureKind::Connect);
            return;
        };
        match tls.handshake(&mut self.sock) {
            Ok(HandshakeStatus::Done) => {
                self.state = ConnState::Writing;
                self.write_some();
            }
            Ok(HandshakeStatus::WouldBlock) => {}
            Err(_) => self.fail_with(FailureKind::Connect),
        }
    }

    fn write_some(&mut self) {
        let output = Arc::clone(&self.output);
        while self.sent < output.len() {
            let chunk = &output[self.sent..];
            let res = match self.tls.as_mut() {
                Some(tls) => tls.write(&mut self.sock, chunk),
                None => self.sock.write(chunk),
            };
            match res {
                Ok(0) => {
                    self.fail_with(FailureKind::Write);
                    return;
                }
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.fail_with(FailureKind::Write);
                    return;
                }
            }
        }
        self.state = ConnState::Reading;
    }

    fn read_some(&mut self) {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let res = match self.tls.as_mut() {
                Some(tls) => tls.read(&mut self.sock, &mut buf),
                None => self.sock.read(&mut buf),
            };
            match res {
                Ok(0) => {
                    // Peer closed before the parser finished. A body
                    // framed by connection close counts as complete; an
                    // empty-handed close does not.
                    if self.parser.phase() == Phase::BodyIdentity || self.parser.body_len() > 0 {
                        self.state = ConnState::Done;
                    } else {
                        self.fail_with(FailureKind::Read);
                    }
                    return;
                }
                Ok(n) => match self.parser.feed(&buf[..n]) {
                    Ok(FeedStatus::Done) => {
                        self.state = ConnState::Done;
                        return;
                    }
                    Ok(FeedStatus::NeedMore) => {}
                    Err(_) => {
                        self.fail_with(FailureKind::Read);
                        return;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.fail_with(FailureKind::Read);
                    return;
                }
            }
        }
    }

    /// Keep-alive unless the response said `Connection: close`.
    pub fn keepalive(&self) -> bool {
        !self
            .parser
            .header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }

    /// Keep the socket, reset parser and cursor, start the next cycle.
    pub fn reuse(&mut self) {
        self.parser.reset();
        self.sent = 0;
        self.state = ConnState::Writing;
        self.failure = None;
        self.start = Instant::now();
    }

    /// Tear down the socket (and TLS session) and reconnect in place.
    /// A synchronous connect failure leaves the slot in `Error` with no
    /// leaked descriptor.
    pub fn reconnect(&mut self, addr: SocketAddr, tls: Option<(&TlsConfig, &str)>) {
        if let Some(session) = self.tls.as_mut() {
            session.shutdown(&mut self.sock);
        }
        self.tls = None;
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
        self.parser.reset();
        self.sent = 0;
        self.failure = None;
        self.start = Instant::now();

        match connect_nonblocking(addr) {
            Ok(sock) => self.sock = sock,
            Err(_) => {
                self.fail_with(FailureKind::Connect);
                return;
            }
        }
        if let Some((config, hostname)) = tls {
            match TlsSession::new(config, hostname) {
                Ok(session) => self.tls = Some(session),
                Err(_) => {
                    self.fail_with(FailureKind::Connect);
                    return;
                }
            }
        }
        self.state = ConnState::Connecting;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(session) = self.tls.as_mut() {
            session.shutdown(&mut self.sock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn drive_until(conn: &mut Connection, target: ConnState, max_spins: usize) {
        for _ in 0..max_spins {
            if conn.state() == target
                || conn.state() == ConnState::Error
                || conn.state() == ConnState::Done
            {
                break;
            }
            conn.drive_write();
            conn.drive_read();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn plain_request_cycle_and_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            // Two request/response exchanges on one socket.
            for _ in 0..2 {
                let mut seen = Vec::new();
                loop {
                    let n = s.read(&mut buf).unwrap();
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK")
                    .unwrap();
            }
        });

        let request: Arc<[u8]> =
            Arc::from(&b"GET / HTTP/1.1\r\nHost: t\r\nConnection: keep-alive\r\n\r\n"[..]);
        let mut conn = Connection::connect(addr, None).unwrap();
        conn.set_output(Arc::clone(&request));

        drive_until(&mut conn, ConnState::Done, 5000);
        assert_eq!(conn.state(), ConnState::Done);
        assert_eq!(conn.parser().status_code(), 200);
        assert_eq!(conn.parser().body(), b"OK");
        assert!(conn.keepalive());

        // Keep-alive reuse: same descriptor, cursor rewound, parser fresh.
        let fd_before = conn.raw_fd();
        conn.reuse();
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.raw_fd(), fd_before);
        assert_eq!(conn.parser().status_code(), 0);
        conn.set_output(request);

        drive_until(&mut conn, ConnState::Done, 5000);
        assert_eq!(conn.state(), ConnState::Done);
        assert_eq!(conn.parser().body(), b"OK");

        server.join().unwrap();
    }

    #[test]
    fn close_framed_body_counts_as_done() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = s.read(&mut buf).unwrap();
            // Identity body, no Content-Length: framed by close.
            s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\npart")
                .unwrap();
            // Close mid-body: bytes were received, so this is Done.
        });

        let mut conn = Connection::connect(addr, None).unwrap();
        conn.set_output(Arc::from(&b"GET / HTTP/1.1\r\nHost: t\r\n\r\n"[..]));
        drive_until(&mut conn, ConnState::Done, 5000);
        server.join().unwrap();
        // Drain the EOF after the server side is gone.
        drive_until(&mut conn, ConnState::Done, 5000);
        assert_eq!(conn.state(), ConnState::Done);
        assert_eq!(conn.parser().body(), b"part");
    }

    #[test]
    fn empty_handed_close_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = s.read(&mut buf).unwrap();
            // Close without sending anything.
        });

        let mut conn = Connection::connect(addr, None).unwrap();
        conn.set_output(Arc::from(&b"GET / HTTP/1.1\r\nHost: t\r\n\r\n"[..]));
        for _ in 0..5000 {
            if conn.state() == ConnState::Error || conn.state() == ConnState::Done {
                break;
            }
            conn.drive_write();
            conn.drive_read();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        server.join().unwrap();
        for _ in 0..5000 {
            if conn.state() == ConnState::Error || conn.state() == ConnState::Done {
                break;
            }
            conn.drive_read();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(conn.state(), ConnState::Error);
    }

    #[test]
    fn malformed_response_is_a_read_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = s.read(&mut buf).unwrap();
            s.write_all(b"BOGUS/0.9 banana\r\n\r\n").unwrap();
        });

        let mut conn = Connection::connect(addr, None).unwrap();
        conn.set_output(Arc::from(&b"GET / HTTP/1.1\r\nHost: t\r\n\r\n"[..]));
        drive_until(&mut conn, ConnState::Error, 5000);
        server.join().unwrap();
        drive_until(&mut conn, ConnState::Error, 5000);
        assert_eq!(conn.state(), ConnState::Error);
        assert_eq!(conn.failure(), Some(FailureKind::Read));
    }

    #[test]
    fn interest_follows_state() {
        use crate::reactor::Interest;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Connection::connect(addr, None).unwrap();
        assert_eq!(conn.state(), ConnState::Connecting);
        assert_eq!(conn.interest(), Interest::ReadWrite);
        drop(listener);
    }
}
