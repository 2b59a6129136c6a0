//! Response serialization: one status line, then the body.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::server::connection::ConnectionId;
use crate::server::request::MAX_LINE_LENGTH;

/// Longest meta that still fits a status line: `"NN " + meta + "\r\n"`.
pub const MAX_META_LENGTH: usize = MAX_LINE_LENGTH - 5;

/// Represents errors that may occur while writing a response.
#[derive(Error, Debug)]
pub enum ResponseError {
    /// The status code is not a two-digit code in the 10-69 range.
    #[error("Invalid status code {0}")]
    InvalidStatus(u8),

    /// The meta field does not fit the status line.
    #[error("Meta is {0} bytes, exceeding the {MAX_META_LENGTH}-byte limit")]
    MetaTooLong(usize),

    /// The meta field would break the status line framing.
    #[error("Meta must not contain line breaks")]
    MetaContainsLineBreak,

    /// A status line was already written on this response.
    #[error("Status line has already been written")]
    StatusAlreadySent,

    /// Body bytes were written before the status line.
    #[error("Body written before the status line")]
    StatusNotSent,

    /// The response was closed or its connection destroyed.
    #[error("Response is closed")]
    Closed,

    /// The underlying connection failed.
    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A Gemini status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(u8);

impl Status {
    pub const INPUT: Status = Status(10);
    pub const SENSITIVE_INPUT: Status = Status(11);
    pub const SUCCESS: Status = Status(20);
    pub const REDIRECT_TEMPORARY: Status = Status(30);
    pub const REDIRECT_PERMANENT: Status = Status(31);
    pub const TEMPORARY_FAILURE: Status = Status(40);
    pub const SERVER_UNAVAILABLE: Status = Status(41);
    pub const CGI_ERROR: Status = Status(42);
    pub const PROXY_ERROR: Status = Status(43);
    pub const SLOW_DOWN: Status = Status(44);
    pub const PERMANENT_FAILURE: Status = Status(50);
    pub const NOT_FOUND: Status = Status(51);
    pub const GONE: Status = Status(52);
    pub const PROXY_REQUEST_REFUSED: Status = Status(53);
    pub const BAD_REQUEST: Status = Status(59);
    pub const CLIENT_CERTIFICATE_REQUIRED: Status = Status(60);
    pub const CERTIFICATE_NOT_AUTHORISED: Status = Status(61);
    pub const CERTIFICATE_NOT_VALID: Status = Status(62);

    /// Creates a status from a raw code, which must be two digits in the 10-69 range.
    pub fn new(code: u8) -> Result<Self, ResponseError> {
        if (10..=69).contains(&code) {
            Ok(Self(code))
        } else {
            Err(ResponseError::InvalidStatus(code))
        }
    }

    pub fn code(self) -> u8 {
        self.0
    }

    /// The first digit of the code (1 = input, 2 = success, ..., 6 = certificates).
    pub fn category(self) -> u8 {
        self.0 / 10
    }

    pub fn is_success(self) -> bool {
        self.category() == 2
    }
}

impl TryFrom<u8> for Status {
    type Error = ResponseError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Status::new(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Formats `"<code> <meta>\r\n"`, enforcing the line limit and framing.
pub fn format_status_line(status: Status, meta: &str) -> Result<Vec<u8>, ResponseError> {
    if meta.len() > MAX_META_LENGTH {
        return Err(ResponseError::MetaTooLong(meta.len()));
    }
    if meta.contains(|c| c == '\r' || c == '\n') {
        return Err(ResponseError::MetaContainsLineBreak);
    }
    Ok(format!("{status} {meta}\r\n").into_bytes())
}

struct ResponseState<S> {
    stream: Option<S>,
    status: Option<Status>,
}

/// The writable side of one request/response exchange.
///
/// Exactly one status line must precede any body bytes. Ordering violations and write
/// failures destroy the connection; bytes already sent are not retracted. Closing the
/// response closes the connection.
pub struct Response<S> {
    state: Arc<Mutex<ResponseState<S>>>,
    connection: ConnectionId,
}

impl<S> Response<S>
where
    S: AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, connection: ConnectionId) -> Self {
        Self {
            state: Arc::new(Mutex::new(ResponseState {
                stream: Some(stream),
                status: None,
            })),
            connection,
        }
    }

    /// Identifier of the connection this response writes to.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// The status written so far, if any.
    pub async fn status(&self) -> Option<Status> {
        self.state.lock().await.status
    }

    /// Whether the connection behind this response has been closed or destroyed.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.stream.is_none()
    }

    /// Writes the status line. Must be the first write and may happen only once.
    pub async fn write_status(&mut self, status: Status, meta: &str) -> Result<(), ResponseError> {
        let mut state = self.state.lock().await;
        if state.stream.is_none() {
            return Err(ResponseError::Closed);
        }
        if state.status.is_some() {
            state.destroy();
            return Err(ResponseError::StatusAlreadySent);
        }

        let line = format_status_line(status, meta)?;
        state.status = Some(status);
        state.write_all(&line).await?;
        debug!(connection = %self.connection, %status, meta, "Status line written");
        Ok(())
    }

    /// Relays body bytes. The status line must have been written first.
    pub async fn write(&mut self, body: &[u8]) -> Result<(), ResponseError> {
        let mut state = self.state.lock().await;
        if state.stream.is_none() {
            return Err(ResponseError::Closed);
        }
        if state.status.is_none() {
            state.destroy();
            return Err(ResponseError::StatusNotSent);
        }
        state.write_all(body).await
    }

    /// Closes the response and its connection. Closing twice is a no-op.
    pub async fn close(self) -> Result<(), ResponseError> {
        close_shared(&self.state, self.connection).await
    }

    /// Sends a complete successful response and closes it.
    pub async fn send(mut self, mime: &str, body: &[u8]) -> Result<(), ResponseError> {
        self.write_status(Status::SUCCESS, mime).await?;
        self.write(body).await?;
        self.close().await
    }

    /// Asks the client for input; `sensitive` requests masked entry.
    pub async fn prompt(self, prompt: &str, sensitive: bool) -> Result<(), ResponseError> {
        let status = if sensitive { Status::SENSITIVE_INPUT } else { Status::INPUT };
        self.finish_with(status, prompt).await
    }

    pub async fn redirect(self, target: &str, permanent: bool) -> Result<(), ResponseError> {
        let status = if permanent {
            Status::REDIRECT_PERMANENT
        } else {
            Status::REDIRECT_TEMPORARY
        };
        self.finish_with(status, target).await
    }

    pub async fn not_found(self) -> Result<(), ResponseError> {
        self.finish_with(Status::NOT_FOUND, "Not found").await
    }

    pub async fn gone(self) -> Result<(), ResponseError> {
        self.finish_with(Status::GONE, "Gone").await
    }

    pub async fn bad_request(self, reason: &str) -> Result<(), ResponseError> {
        self.finish_with(Status::BAD_REQUEST, reason).await
    }

    /// Asks the client to repeat the request with a (possibly transient) certificate.
    pub async fn request_client_certificate(self, reason: &str) -> Result<(), ResponseError> {
        self.finish_with(Status::CLIENT_CERTIFICATE_REQUIRED, reason).await
    }

    async fn finish_with(mut self, status: Status, meta: &str) -> Result<(), ResponseError> {
        self.write_status(status, meta).await?;
        self.close().await
    }

    /// A handle the session keeps to close the connection once the handler is done.
    pub(crate) fn closer(&self) -> ResponseCloser<S> {
        ResponseCloser {
            state: Arc::clone(&self.state),
            connection: self.connection,
        }
    }
}

impl<S> fmt::Debug for Response<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl<S> ResponseState<S>
where
    S: AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ResponseError> {
        let stream = self.stream.as_mut().ok_or(ResponseError::Closed)?;
        let result = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        }
        .await;

        if let Err(e) = result {
            error!("Response write failed: {}", e);
            self.destroy();
            return Err(e.into());
        }
        Ok(())
    }

    /// Drops the connection without a graceful shutdown.
    fn destroy(&mut self) {
        self.stream = None;
    }
}

/// Closes the connection behind a [`Response`] without owning it.
pub(crate) struct ResponseCloser<S> {
    state: Arc<Mutex<ResponseState<S>>>,
    connection: ConnectionId,
}

impl<S> ResponseCloser<S>
where
    S: AsyncWrite + Unpin + Send,
{
    pub(crate) async fn close(&self) -> Result<(), ResponseError> {
        close_shared(&self.state, self.connection).await
    }

    pub(crate) async fn destroy(&self) {
        self.state.lock().await.destroy();
    }
}

async fn close_shared<S>(
    state: &Mutex<ResponseState<S>>,
    connection: ConnectionId,
) -> Result<(), ResponseError>
where
    S: AsyncWrite + Unpin + Send,
{
    let mut state = state.lock().await;
    let Some(mut stream) = state.stream.take() else {
        return Ok(());
    };
    if state.status.is_none() {
        warn!(%connection, "Response closed without a status line");
    }
    stream.shutdown().await?;
    debug!(%connection, "Response closed");
    Ok(())
}
