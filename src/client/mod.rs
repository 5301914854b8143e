//! Outbound HTTP connection machinery: the non-blocking connection
//! state machine and its TLS wrapper.

pub mod conn;
pub mod tls;

pub use conn::{ConnState, Connection, FailureKind};
pub use tls::{TlsConfig, TlsSession};
