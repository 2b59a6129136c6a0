//! Request line parsing.
//!
//! A Gemini request is a single CRLF-terminated line holding a URL reference. The
//! [`LineParser`] consumes raw connection bytes and yields that line at most once; the
//! [`RequestBuilder`] then finalizes it into an immutable [`Request`].

use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::server::connection::ConnectionInfo;

/// Maximum size of a request line, delimiter included.
pub const MAX_LINE_LENGTH: usize = 1024;

const CRLF: &[u8] = b"\r\n";

/// Base the raw request line is resolved against to derive a path.
const SYNTHETIC_BASE: &str = "http://foo/";

/// Represents the ways reading a request line can fail.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The line did not terminate within [`MAX_LINE_LENGTH`] bytes.
    #[error("Request line too long (limit is {MAX_LINE_LENGTH} bytes)")]
    LineTooLong,

    /// The line is not valid UTF-8.
    #[error("Request line is not valid UTF-8")]
    InvalidEncoding,

    /// The line is not a URL reference.
    #[error("Invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The peer closed the connection before sending a complete line.
    #[error("Connection closed before the request line was complete")]
    UnexpectedEof,

    /// The transport failed while the line was being read.
    #[error("Transport error while reading request: {0}")]
    Io(#[from] std::io::Error),

    /// No complete line arrived before the deadline.
    #[error("No request line received within {0:?}")]
    Timeout(Duration),
}

/// The raw content of a request line, delimiter stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine(String);

impl RequestLine {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Streaming, single-shot parser for one request line.
///
/// Bytes are accumulated until CRLF is seen. Once a result (line or error) has been
/// produced, or the parser was aborted, further input is ignored. Bytes that arrived
/// after the delimiter are kept aside and never interpreted.
#[derive(Debug, Default)]
pub struct LineParser {
    buffer: Vec<u8>,
    remainder: Vec<u8>,
    finished: bool,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of connection bytes.
    ///
    /// Returns `Ok(Some(line))` exactly once when the line is complete, `Ok(None)` while more
    /// input is needed (and forever after a result was produced), or the parse failure.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<RequestLine>, ParseError> {
        if self.finished {
            return Ok(None);
        }

        // The delimiter may straddle two chunks.
        let scan_from = self.buffer.len().saturating_sub(1);
        self.buffer.extend_from_slice(chunk);

        match find_crlf(&self.buffer[scan_from..]).map(|pos| pos + scan_from) {
            Some(end) if end + CRLF.len() <= MAX_LINE_LENGTH => {
                self.finished = true;
                self.remainder = self.buffer.split_off(end + CRLF.len());
                self.buffer.truncate(end);
                let line = std::mem::take(&mut self.buffer);
                String::from_utf8(line)
                    .map(|line| Some(RequestLine(line)))
                    .map_err(|_| ParseError::InvalidEncoding)
            }
            Some(_) => Err(self.fail(ParseError::LineTooLong)),
            None if self.buffer.len() >= MAX_LINE_LENGTH => Err(self.fail(ParseError::LineTooLong)),
            None => Ok(None),
        }
    }

    /// Stops the parser; no further result will be produced.
    pub fn abort(&mut self) {
        self.finished = true;
        self.buffer.clear();
    }

    /// Whether the parser has produced its result or was aborted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes received after the request line's delimiter.
    pub fn remainder(&self) -> &[u8] {
        &self.remainder
    }

    fn fail(&mut self, error: ParseError) -> ParseError {
        self.abort();
        error
    }
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(CRLF.len()).position(|window| window == CRLF)
}

/// Partially built request, assembled while the line is still being read.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    connection: ConnectionInfo,
    client_fingerprint: Option<String>,
}

impl RequestBuilder {
    pub fn new(connection: ConnectionInfo) -> Self {
        Self {
            connection,
            client_fingerprint: None,
        }
    }

    /// Attaches the fingerprint of the certificate the client presented.
    pub fn client_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.client_fingerprint = fingerprint;
        self
    }

    /// Finalizes the request from a complete line.
    ///
    /// The path is derived by resolving the line against a synthetic base, so both
    /// absolute URLs and bare references yield one.
    pub fn build(self, line: RequestLine) -> Result<Request, ParseError> {
        let base = Url::parse(SYNTHETIC_BASE)?;
        let resolved = base.join(line.as_str())?;
        let path = resolved.path().to_owned();

        Ok(Request {
            url: line.into_string(),
            resolved,
            path,
            client_fingerprint: self.client_fingerprint,
            connection: self.connection,
        })
    }
}

/// A parsed Gemini request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    url: String,
    resolved: Url,
    path: String,
    client_fingerprint: Option<String>,
    connection: ConnectionInfo,
}

impl Request {
    /// The request line exactly as the client sent it.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request line resolved against the synthetic base.
    pub fn resolved_url(&self) -> &Url {
        &self.resolved
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, which Gemini uses to carry user input.
    pub fn query(&self) -> Option<&str> {
        self.resolved.query()
    }

    /// SHA-1 fingerprint of the client certificate, if one was presented.
    pub fn client_fingerprint(&self) -> Option<&str> {
        self.client_fingerprint.as_deref()
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Result<Option<RequestLine>, ParseError> {
        LineParser::new().feed(input)
    }

    fn build(line: &str) -> Result<Request, ParseError> {
        RequestBuilder::new(ConnectionInfo::new(None)).build(RequestLine(line.to_owned()))
    }

    #[test]
    fn yields_line_without_delimiter() {
        let line = parse_all(b"gemini://example.org/docs\r\n").unwrap().unwrap();
        assert_eq!(line.as_str(), "gemini://example.org/docs");
    }

    #[test]
    fn waits_for_delimiter_across_chunks() {
        let mut parser = LineParser::new();
        assert!(parser.feed(b"gemini://exam").unwrap().is_none());
        assert!(parser.feed(b"ple.org/\r").unwrap().is_none());
        let line = parser.feed(b"\n").unwrap().unwrap();
        assert_eq!(line.as_str(), "gemini://example.org/");
    }

    #[test]
    fn accepts_line_filling_the_whole_limit() {
        let mut input = vec![b'a'; MAX_LINE_LENGTH - CRLF.len()];
        input.extend_from_slice(CRLF);
        let line = parse_all(&input).unwrap().unwrap();
        assert_eq!(line.as_str().len(), MAX_LINE_LENGTH - CRLF.len());
    }

    #[test]
    fn rejects_unterminated_input_at_the_limit() {
        let mut parser = LineParser::new();
        let err = parser.feed(&[b'a'; MAX_LINE_LENGTH]).unwrap_err();
        assert!(matches!(err, ParseError::LineTooLong));
        assert!(parser.is_finished());
    }

    #[test]
    fn rejects_delimiter_past_the_limit() {
        let mut input = vec![b'a'; MAX_LINE_LENGTH - 1];
        input.extend_from_slice(CRLF);
        assert!(matches!(parse_all(&input), Err(ParseError::LineTooLong)));
    }

    #[test]
    fn rejects_limit_reached_over_several_chunks() {
        let mut parser = LineParser::new();
        for _ in 0..3 {
            assert!(parser.feed(&[b'a'; 300]).unwrap().is_none());
        }
        assert!(matches!(parser.feed(&[b'a'; 124]), Err(ParseError::LineTooLong)));
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert!(matches!(
            parse_all(b"gemini://\xff\xfe/\r\n"),
            Err(ParseError::InvalidEncoding)
        ));
    }

    #[test]
    fn lone_newline_is_not_a_delimiter() {
        let mut parser = LineParser::new();
        assert!(parser.feed(b"gemini://example.org/\n").unwrap().is_none());
    }

    #[test]
    fn becomes_inert_after_first_result() {
        let mut parser = LineParser::new();
        assert!(parser.feed(b"/first\r\n").unwrap().is_some());
        assert!(parser.feed(b"/second\r\n").unwrap().is_none());
        assert!(parser.is_finished());
    }

    #[test]
    fn keeps_bytes_after_delimiter_aside() {
        let mut parser = LineParser::new();
        let line = parser.feed(b"/index\r\ntrailing").unwrap().unwrap();
        assert_eq!(line.as_str(), "/index");
        assert_eq!(parser.remainder(), b"trailing");
    }

    #[test]
    fn aborted_parser_emits_nothing() {
        let mut parser = LineParser::new();
        parser.feed(b"gemini://exa").unwrap();
        parser.abort();
        assert!(parser.feed(b"mple.org/\r\n").unwrap().is_none());
    }

    #[test]
    fn builds_request_from_absolute_url() {
        let request = build("gemini://example.org/docs/intro.gmi?lang=en").unwrap();
        assert_eq!(request.url(), "gemini://example.org/docs/intro.gmi?lang=en");
        assert_eq!(request.path(), "/docs/intro.gmi");
        assert_eq!(request.query(), Some("lang=en"));
        assert_eq!(request.client_fingerprint(), None);
    }

    #[test]
    fn resolves_relative_reference_against_base() {
        let request = build("docs/../about").unwrap();
        assert_eq!(request.url(), "docs/../about");
        assert_eq!(request.path(), "/about");
    }

    #[test]
    fn empty_line_resolves_to_root() {
        assert_eq!(build("").unwrap().path(), "/");
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(matches!(build("http://[::1"), Err(ParseError::InvalidUrl(_))));
    }

    #[test]
    fn attaches_client_fingerprint_and_connection() {
        let connection = ConnectionInfo::new(None);
        let request = RequestBuilder::new(connection.clone())
            .client_fingerprint(Some("AB:CD".into()))
            .build(RequestLine("/".into()))
            .unwrap();
        assert_eq!(request.client_fingerprint(), Some("AB:CD"));
        assert_eq!(request.connection(), &connection);
    }
}
