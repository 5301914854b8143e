//! Script host: module front-end, the compiled step program, and the
//! per-worker fetch loop that services scripted requests.
//!
//! The core driver only sees three seams (an opaque callable via
//! `FetchLoop::call` on a compiled program, promise handles, and the
//! loop's job queue), so any embeddable engine producing the same
//! shapes would slot in.

pub mod driver;
pub mod engine;
pub mod fetch;
pub mod module;
pub mod program;
pub mod value;

pub use engine::FetchLoop;
pub use module::{BenchOverrides, DefaultExport, RequestDesc, ScriptModule};
pub use program::Program;
pub use value::Value;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script parse error: {0}")]
    Parse(String),

    #[error("unsupported script construct: {0}")]
    Unsupported(String),

    #[error("script runtime error: {0}")]
    Runtime(String),

    #[error("request descriptor missing 'url'")]
    MissingUrl,
}
