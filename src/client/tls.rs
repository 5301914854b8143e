//! Non-blocking TLS client sessions over rustls.
//!
//! The session is driven the way the connection machine drives plain
//! sockets: every call either makes progress or reports `WouldBlock`,
//! and the caller retries when the reactor signals readiness. rustls'
//! `wants_read`/`wants_write` map onto the WANT_READ/WANT_WRITE
//! handshake protocol the state machine expects.

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

/// Benchmark-grade verifier: runs the standard webpki verification
/// against the bundled roots, then discards the verdict. Load targets
/// routinely present self-signed or mismatched certificates and the
/// tool must connect to them anyway.
#[derive(Debug)]
struct LenientVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for LenientVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let _ = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let _ = self.inner.verify_tls12_signature(message, cert, dss);
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let _ = self.inner.verify_tls13_signature(message, cert, dss);
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Shared, immutable client configuration. Built once in the main
/// thread and shared read-only by every worker.
#[derive(Clone)]
pub struct TlsConfig {
    inner: Arc<ClientConfig>,
}

impl TlsConfig {
    pub fn new() -> Result<TlsConfig, rustls::Error> {
        let roots = Arc::new(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ));
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| rustls::Error::General(e.to_string()))?;

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(LenientVerifier { inner }))
            .with_no_client_auth();

        Ok(TlsConfig {
            inner: Arc::new(config),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Done,
    WouldBlock,
}

/// One TLS session bound to one socket's lifetime. SNI is set from the
/// target hostname at creation.
pub struct TlsSession {
    conn: ClientConnection,
}

impl TlsSession {
    pub fn new(config: &TlsConfig, hostname: &str) -> io::Result<TlsSession> {
        let name: ServerName<'static> = hostname
            .to_string()
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid server name"))?;
        let conn = ClientConnection::new(config.inner.clone(), name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(TlsSession { conn })
    }

    fn flush_pending(&mut self, sock: &mut TcpStream) -> io::Result<bool> {
        // Returns false when the socket refused further writes.
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn fill(&mut self, sock: &mut TcpStream) -> io::Result<FillStatus> {
        match self.conn.read_tls(sock) {
            Ok(0) => Ok(FillStatus::Eof),
            Ok(_) => {
                self.conn
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                Ok(FillStatus::Progress)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(FillStatus::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(FillStatus::Progress),
            Err(e) => Err(e),
        }
    }

    /// Advance the handshake. `WouldBlock` means the reactor should
    /// call again on the next readiness edge.
    pub fn handshake(&mut self, sock: &mut TcpStream) -> io::Result<HandshakeStatus> {
        loop {
            if !self.flush_pending(sock)? {
                return Ok(HandshakeStatus::WouldBlock);
            }
            if !self.conn.is_handshaking() {
                return Ok(HandshakeStatus::Done);
            }
            match self.fill(sock)? {
                FillStatus::Progress => {}
                FillStatus::WouldBlock => return Ok(HandshakeStatus::WouldBlock),
                FillStatus::Eof => {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
            }
        }
    }

    /// Read decrypted bytes. `Ok(0)` is a clean close (close_notify);
    /// an abrupt TCP close surfaces as `UnexpectedEof`.
    pub fn read(&mut self, sock: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => match self.fill(sock)? {
                    FillStatus::Progress => {}
                    FillStatus::WouldBlock => return Err(io::ErrorKind::WouldBlock.into()),
                    FillStatus::Eof => {
                        // Distinguish clean close_notify from truncation.
                        return match self.conn.reader().read(buf) {
                            Ok(n) => Ok(n),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                Err(io::ErrorKind::UnexpectedEof.into())
                            }
                            Err(e) => Err(e),
                        };
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Write plaintext. Encrypted records are flushed eagerly; when the
    /// socket refuses everything the call reports `WouldBlock` without
    /// consuming input.
    pub fn write(&mut self, sock: &mut TcpStream, buf: &[u8]) -> io::Result<usize> {
        if !self.flush_pending(sock)? {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = self.conn.writer().write(buf)?;
        if n == 0 && !buf.is_empty() {
            // Record buffer full; retry on the next writable edge.
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.flush_pending(sock)?;
        Ok(n)
    }

    /// Best-effort close_notify; failures are ignored.
    pub fn shutdown(&mut self, sock: &mut TcpStream) {
        self.conn.send_close_notify();
        let _ = self.conn.write_tls(sock);
    }
}

enum FillStatus {
    Progress,
    WouldBlock,
    Eof,
}
