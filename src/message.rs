//! Typed MSRP protocol objects, as produced by the wire parser and consumed by the serializer.
//!
//! The byte-level syntax lives elsewhere; this crate only reasons about the parsed form.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use url::Url;

use crate::ids::{MessageId, SessionId, TransactionId};

/// An MSRP URI of the form `msrp://host:port/session;tcp`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct MsrpUri {
    url: Url,
}

#[derive(Debug, thiserror::Error)]
pub enum UriError {
    #[error("invalid MSRP URI: {0}")]
    Parse(#[from] url::ParseError),

    #[error("unsupported URI scheme '{0}'")]
    Scheme(String),

    #[error("MSRP URI '{0}' has no host")]
    MissingHost(String),

    #[error("MSRP URI '{0}' has no session id")]
    MissingSession(String),
}

impl MsrpUri {
    pub fn new(host: &str, port: u16, session_id: &SessionId) -> Result<Self, UriError> {
        format!("msrp://{host}:{port}/{session_id};tcp").parse()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    /// The session identifier, without the leading slash and transport parameter.
    pub fn session_id(&self) -> &str {
        let path = self.url.path().trim_start_matches('/');
        path.split(';').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl FromStr for MsrpUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s)?;
        if url.scheme() != "msrp" && url.scheme() != "msrps" {
            return Err(UriError::Scheme(url.scheme().to_string()));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(UriError::MissingHost(s.to_string()));
        }
        let uri = Self { url };
        if uri.session_id().is_empty() {
            return Err(UriError::MissingSession(s.to_string()));
        }
        Ok(uri)
    }
}

impl fmt::Display for MsrpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// The `Byte-Range` header: 1-based start of the enclosing chunk, its end, and the total size.
///
/// `None` renders as `*` (unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>, total: Option<u64>) -> Self {
        Self { start, end, total }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.start)?;
        match self.end {
            Some(end) => write!(f, "{end}/")?,
            None => f.write_str("*/")?,
        }
        match self.total {
            Some(total) => write!(f, "{total}"),
            None => f.write_str("*"),
        }
    }
}

/// The end-line flag of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// `+`: more data of this message follows.
    More,
    /// `$`: the message is complete.
    Done,
    /// `#`: the sender gave up on the message.
    Aborted,
}

impl Continuation {
    pub fn flag(self) -> char {
        match self {
            Continuation::More => '+',
            Continuation::Done => '$',
            Continuation::Aborted => '#',
        }
    }

    pub fn ends_message(self) -> bool {
        !matches!(self, Continuation::More)
    }
}

/// Where a piece sits within its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// Starts a chunk that continues in later pieces.
    Head,
    /// Neither starts nor ends its chunk.
    BodyOnly,
    /// Ends the current chunk.
    Tail,
    /// Starts and ends its chunk, and ends the message.
    Complete,
}

impl ChunkType {
    pub fn ends_chunk(self) -> bool {
        matches!(self, ChunkType::Tail | ChunkType::Complete)
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const STOP_SENDING: StatusCode = StatusCode(413);
    pub const UNSUPPORTED_MEDIA: StatusCode = StatusCode(415);
    pub const SESSION_DOES_NOT_EXIST: StatusCode = StatusCode(481);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One piece of a SEND request. A chunk may arrive as several pieces sharing a transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub transaction_id: TransactionId,
    pub message_id: MessageId,
    pub to_path: MsrpUri,
    pub from_path: MsrpUri,
    pub byte_range: ByteRange,
    pub continuation: Continuation,
    pub chunk_type: ChunkType,
    pub content_type: Option<String>,
    /// Leading bytes of `body` that belong to the CPIM header block, not the payload.
    pub header_len: usize,
    pub success_report: bool,
    pub failure_report: bool,
    pub body: Bytes,
}

impl ChunkPiece {
    pub fn ends_chunk(&self) -> bool {
        self.chunk_type.ends_chunk()
    }

    /// Empty SENDs are used to bind a connection and as keep-alives.
    pub fn is_empty_send(&self) -> bool {
        self.body.is_empty()
            && self.header_len == 0
            && self.byte_range.total == Some(0)
            && self.chunk_type == ChunkType::Complete
    }

    /// Response to this piece's transaction, addressed back to its sender.
    pub fn response(&self, status: StatusCode) -> Response {
        Response {
            transaction_id: self.transaction_id.clone(),
            status,
            to_path: self.from_path.clone(),
            from_path: self.to_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub transaction_id: TransactionId,
    pub status: StatusCode,
    pub to_path: MsrpUri,
    pub from_path: MsrpUri,
}

/// A REPORT request describing delivery of (part of) a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub transaction_id: TransactionId,
    pub message_id: MessageId,
    pub to_path: MsrpUri,
    pub from_path: MsrpUri,
    pub byte_range: ByteRange,
    pub status: StatusCode,
}

/// A parsed request or response travelling over the duplex channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Send(ChunkPiece),
    Response(Response),
    Report(Report),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_parts() {
        let uri: MsrpUri = "msrp://alice.example.com:2855/abc123;tcp".parse().unwrap();
        assert_eq!(uri.host(), "alice.example.com");
        assert_eq!(uri.port(), Some(2855));
        assert_eq!(uri.session_id(), "abc123");
    }

    #[test]
    fn test_uri_from_parts() {
        let uri = MsrpUri::new("10.0.0.1", 7000, &SessionId::from("s1")).unwrap();
        assert_eq!(uri.to_string(), "msrp://10.0.0.1:7000/s1;tcp");
    }

    #[test]
    fn test_uri_rejects_other_schemes() {
        let result = "sip:alice@example.com".parse::<MsrpUri>();
        assert!(matches!(result, Err(UriError::Scheme(_))));

        let result = "msrp://host:1/;tcp".parse::<MsrpUri>();
        assert!(matches!(result, Err(UriError::MissingSession(_))));
    }

    #[test]
    fn test_byte_range_display() {
        assert_eq!(ByteRange::new(1, None, Some(25)).to_string(), "1-*/25");
        assert_eq!(ByteRange::new(11, Some(20), None).to_string(), "11-20/*");
    }

    #[test]
    fn test_chunk_type_ends_chunk() {
        assert!(ChunkType::Tail.ends_chunk());
        assert!(ChunkType::Complete.ends_chunk());
        assert!(!ChunkType::Head.ends_chunk());
        assert!(!ChunkType::BodyOnly.ends_chunk());
    }

    #[test]
    fn test_status_classes() {
        assert!(StatusCode::OK.is_success());
        assert!(!StatusCode::STOP_SENDING.is_success());
        assert_eq!(Continuation::Aborted.flag(), '#');
    }
}
