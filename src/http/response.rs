//! Streaming HTTP/1.1 response parser.
//!
//! Pure byte-in / event-out: callers append whatever the socket produced
//! and get back `NeedMore`, `Done`, or an error. No I/O, no framing
//! assumptions beyond HTTP/1.1: identity bodies, chunked bodies, and
//! header-only responses (connection-close framing is decided by the
//! connection layer, which watches for EOF).
//!
//! Limits follow the wire reality of a load generator, not strictness:
//! at most 64 headers are kept (extras dropped), names over 127 and
//! values over 4095 bytes are truncated, the reason phrase is capped at
//! 63 bytes. None of these are errors.

use thiserror::Error;

pub const MAX_HEADERS: usize = 64;
const MAX_HEADER_NAME: usize = 127;
const MAX_HEADER_VALUE: usize = 4095;
const MAX_STATUS_TEXT: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    StatusLine,
    HeaderLine,
    BodyIdentity,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    NeedMore,
    Done,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed status line")]
    InvalidStatusLine,
}

#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

pub struct ResponseParser {
    phase: Phase,
    status_code: u16,
    status_text: String,
    headers: Vec<Header>,
    body: Vec<u8>,
    content_length: usize,
    chunked: bool,
    chunk_remaining: usize,
    buf: Vec<u8>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Leading-digit decimal parse, `strtol`-style: stops at the first
/// non-digit, zero when there are none.
fn parse_decimal(s: &str) -> u64 {
    let digits: &str = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => &s[..idx],
        None => s,
    };
    digits.parse().unwrap_or(0)
}

/// Leading hex parse, `strtoul(.., 16)`-style. Chunk extensions after
/// the size are tolerated because parsing stops at the first non-hex
/// byte.
fn parse_hex(s: &str) -> u64 {
    let digits: &str = match s.find(|c: char| !c.is_ascii_hexdigit()) {
        Some(idx) => &s[..idx],
        None => s,
    };
    u64::from_str_radix(digits, 16).unwrap_or(0)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn truncated(bytes: &[u8], cap: usize) -> String {
    let bytes = if bytes.len() > cap { &bytes[..cap] } else { bytes };
    String::from_utf8_lossy(bytes).into_owned()
}

impl ResponseParser {
    pub fn new() -> ResponseParser {
        ResponseParser {
            phase: Phase::StatusLine,
            status_code: 0,
            status_text: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
            content_length: 0,
            chunked: false,
            chunk_remaining: 0,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Back to the initial state, keeping allocations. Must be called
    /// between keep-alive responses.
    pub fn reset(&mut self) {
        self.phase = Phase::StatusLine;
        self.status_code = 0;
        self.status_text.clear();
        self.headers.clear();
        self.body.clear();
        self.content_length = 0;
        self.chunked = false;
        self.chunk_remaining = 0;
        self.buf.clear();
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Case-insensitive lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Body size advertised by `Content-Length`, zero when absent.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Feed response bytes. Returns `Done` when a complete response has
    /// been parsed (and for any bytes fed after that, which are
    /// buffered untouched until `reset`).
    pub fn feed(&mut self, data: &[u8]) -> Result<FeedStatus, ParseError> {
        self.buf.extend_from_slice(data);

        loop {
            let progressed = match self.phase {
                Phase::StatusLine => self.parse_status_line()?,
                Phase::HeaderLine => self.parse_header_line(),
                Phase::BodyIdentity => self.parse_body_identity(),
                Phase::ChunkSize => self.parse_chunk_size(),
                Phase::ChunkData => self.parse_chunk_data(),
                Phase::ChunkTrailer => self.parse_chunk_trailer(),
                Phase::Done => return Ok(FeedStatus::Done),
                Phase::Failed => return Err(ParseError::InvalidStatusLine),
            };
            if !progressed {
                return Ok(FeedStatus::NeedMore);
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    fn parse_status_line(&mut self) -> Result<bool, ParseError> {
        let Some(pos) = find_crlf(&self.buf) else {
            return Ok(false);
        };
        let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();

        // "HTTP/1.1 200 OK"
        let Some(rest) = line.strip_prefix("HTTP/1.") else {
            self.phase = Phase::Failed;
            return Err(ParseError::InvalidStatusLine);
        };
        let Some(sp) = rest.find(' ') else {
            self.phase = Phase::Failed;
            return Err(ParseError::InvalidStatusLine);
        };
        let after = &rest[sp + 1..];
        self.status_code = parse_decimal(after) as u16;
        if let Some(sp2) = after.find(' ') {
            self.status_text = truncated(after[sp2 + 1..].as_bytes(), MAX_STATUS_TEXT);
        }

        self.consume(pos + 2);
        self.phase = Phase::HeaderLine;
        Ok(true)
    }

    fn parse_header_line(&mut self) -> bool {
        let Some(pos) = find_crlf(&self.buf) else {
            return false;
        };

        if pos == 0 {
            // Empty line: end of headers, pick the body mode.
            self.consume(2);
            if self
                .header("Transfer-Encoding")
                .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
            {
                self.chunked = true;
                self.phase = Phase::ChunkSize;
            } else if let Some(cl) = self.header("Content-Length") {
                self.content_length = parse_decimal(cl) as usize;
                self.phase = if self.content_length == 0 {
                    Phase::Done
                } else {
                    Phase::BodyIdentity
                };
            } else {
                // Neither length nor chunked: body (if any) is framed by
                // connection close, which the connection layer reports.
                self.phase = Phase::Done;
            }
            return true;
        }

        let line = self.buf[..pos].to_vec();
        self.consume(pos + 2);

        // Lines without a colon are skipped silently.
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return true;
        };
        if self.headers.len() < MAX_HEADERS {
            let name = truncated(&line[..colon], MAX_HEADER_NAME);
            let mut value_start = colon + 1;
            while value_start < line.len() && line[value_start] == b' ' {
                value_start += 1;
            }
            let value = truncated(&line[value_start..], MAX_HEADER_VALUE);
            self.headers.push(Header { name, value });
        }
        true
    }

    fn parse_body_identity(&mut self) -> bool {
        let remaining = self.content_length - self.body.len();
        let avail = self.buf.len().min(remaining);
        if avail > 0 {
            self.body.extend_from_slice(&self.buf[..avail]);
            self.consume(avail);
        }
        if self.body.len() >= self.content_length {
            self.phase = Phase::Done;
            return true;
        }
        false
    }

    fn parse_chunk_size(&mut self) -> bool {
        let Some(pos) = find_crlf(&self.buf) else {
            return false;
        };
        let size = parse_hex(&String::from_utf8_lossy(&self.buf[..pos]));
        self.consume(pos + 2);

        if size == 0 {
            self.phase = Phase::ChunkTrailer;
        } else {
            self.chunk_remaining = size as usize;
            self.phase = Phase::ChunkData;
        }
        true
    }

    fn parse_chunk_data(&mut self) -> bool {
        let avail = self.buf.len().min(self.chunk_remaining);
        if avail > 0 {
            self.body.extend_from_slice(&self.buf[..avail]);
            self.consume(avail);
            self.chunk_remaining -= avail;
        }
        if self.chunk_remaining == 0 {
            // The CRLF that terminates the chunk data.
            if self.buf.len() >= 2 {
                self.consume(2);
                self.phase = Phase::ChunkSize;
                return true;
            }
        }
        false
    }

    fn parse_chunk_trailer(&mut self) -> bool {
        let Some(pos) = find_crlf(&self.buf) else {
            return false;
        };
        self.consume(pos + 2);
        if pos == 0 {
            self.phase = Phase::Done;
        }
        // Non-empty trailer lines are discarded.
        true
    }
}
