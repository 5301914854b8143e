//! HTTP/1.1 wire handling: the streaming response parser.

mod response;

pub use response::{FeedStatus, Header, ParseError, Phase, ResponseParser, MAX_HEADERS};
