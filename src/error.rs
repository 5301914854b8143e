//! Fatal error kinds surfaced to the CLI layer.
//!
//! Transport-level failures (connect/read/write/parse) are recovered by
//! reconnecting a connection slot and never appear here; they are counted
//! in the worker stats instead.

use crate::script::ScriptError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read '{path}': {source}")]
    ReadScript {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    #[error("DNS resolution failed for {host}:{port}")]
    Dns { host: String, port: u16 },

    #[error("TLS init failed: {0}")]
    TlsInit(String),

    #[error("no valid requests found")]
    EmptyWorkload,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
