//! Per-connection orchestration.
//!
//! # Session States
//! ```text
//! AwaitingAdmission → AwaitingRequestLine → Dispatched → Closed
//!         │                    │
//!         └────────────────────┴──────────────────────→ Closed
//! ```
//!
//! A session serves exactly one request. The request deadline covers the time from
//! admission until the request line is complete and is cancelled before the request is
//! built, so a timeout can never race a dispatched request.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::server::{
    connection::ConnectionInfo,
    gatekeeper::{Gatekeeper, TransportInfo},
    handler::Handler,
    request::{LineParser, ParseError, RequestBuilder, RequestLine, MAX_LINE_LENGTH},
    response::{Response, ResponseError},
    ServerEvent,
};
use crate::utils::error::GeminiError;

/// Time allowed between admission and a complete request line.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the gatekeeper's decision.
    AwaitingAdmission,
    /// Admitted; reading the request line under the deadline.
    AwaitingRequestLine,
    /// Request and response handed to the handler.
    Dispatched,
    /// Torn down. Terminal.
    Closed,
}

/// Drives one admitted connection through a single request/response cycle.
pub struct Session<S> {
    connection: ConnectionInfo,
    stream: Option<S>,
    parser: LineParser,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, connection: ConnectionInfo) -> Self {
        Self {
            connection,
            stream: Some(stream),
            parser: LineParser::new(),
            state: SessionState::AwaitingAdmission,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// Runs the session to completion. The session is `Closed` when this returns.
    ///
    /// # Errors
    /// Returns the admission, parse or response failure that ended the session early,
    /// or `HandlerPanicked` if the handler panicked.
    #[instrument(
        name = "session",
        skip_all,
        fields(connection = %self.connection.id, peer = ?self.connection.peer_addr)
    )]
    pub async fn run<H>(
        &mut self,
        transport: &TransportInfo,
        gatekeeper: &Gatekeeper,
        handler: &H,
        events: &broadcast::Sender<ServerEvent>,
    ) -> Result<(), GeminiError>
    where
        H: Handler<S>,
    {
        let admission = match gatekeeper.admit(transport) {
            Ok(admission) => admission,
            Err(e) => {
                warn!(certificate = %transport.certificate_status, "Connection rejected: {}", e);
                self.close();
                return Err(e.into());
            }
        };
        self.transition(SessionState::AwaitingRequestLine);

        let line = match timeout(REQUEST_TIMEOUT, self.read_request_line()).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                warn!("Failed to read request: {}", e);
                self.close();
                return Err(e.into());
            }
            Err(_) => {
                warn!("No request line within {:?}", REQUEST_TIMEOUT);
                self.close();
                return Err(ParseError::Timeout(REQUEST_TIMEOUT).into());
            }
        };

        let request = match RequestBuilder::new(self.connection.clone())
            .client_fingerprint(admission.client_fingerprint)
            .build(line)
        {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid request: {}", e);
                self.close();
                return Err(e.into());
            }
        };

        let Some(stream) = self.stream.take() else {
            self.close();
            return Err(ResponseError::Closed.into());
        };
        let response = Response::new(stream, self.connection.id);
        let closer = response.closer();
        self.transition(SessionState::Dispatched);
        info!(url = request.url(), path = request.path(), "Dispatching request");

        // Nobody listening is fine.
        let _ = events.send(ServerEvent::Request(request.clone()));

        // The call itself runs inside the guarded future so a panic while building the
        // handler's future is caught too.
        let handled = async move { handler.call(request, response).await };

        let result = match AssertUnwindSafe(handled).catch_unwind().await {
            Ok(Ok(())) => closer.close().await.map_err(GeminiError::from),
            Ok(Err(e)) => {
                error!("Handler failed: {}", e);
                closer.destroy().await;
                Err(e.into())
            }
            Err(_) => {
                error!("Handler panicked");
                closer.destroy().await;
                Err(GeminiError::HandlerPanicked)
            }
        };

        self.close();
        result
    }

    /// Tears the session down. Repeated calls are no-ops.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.parser.abort();
        self.stream = None;
        self.transition(SessionState::Closed);
    }

    async fn read_request_line(&mut self) -> Result<RequestLine, ParseError> {
        let Self { stream, parser, .. } = self;
        let stream = stream.as_mut().ok_or(ParseError::UnexpectedEof)?;
        let mut chunk = [0u8; MAX_LINE_LENGTH];

        loop {
            let read = match stream.read(&mut chunk).await {
                Ok(0) => {
                    parser.abort();
                    return Err(ParseError::UnexpectedEof);
                }
                Ok(read) => read,
                Err(e) => {
                    parser.abort();
                    return Err(e.into());
                }
            };

            if let Some(line) = parser.feed(&chunk[..read])? {
                if !parser.remainder().is_empty() {
                    debug!(bytes = parser.remainder().len(), "Ignoring bytes after request line");
                }
                return Ok(line);
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::gatekeeper::CertificateStatus;
    use crate::server::request::Request;
    use crate::server::response::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    type TestResponse = Response<DuplexStream>;

    struct Harness {
        session: Session<DuplexStream>,
        client: DuplexStream,
        events: broadcast::Sender<ServerEvent>,
        receiver: broadcast::Receiver<ServerEvent>,
    }

    fn harness() -> Harness {
        let (server, client) = duplex(4096);
        let (events, receiver) = broadcast::channel(8);
        Harness {
            session: Session::new(server, ConnectionInfo::new(None)),
            client,
            events,
            receiver,
        }
    }

    fn counting_handler(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(Request, TestResponse) -> futures_util::future::BoxFuture<'static, Result<(), ResponseError>>
           + Send
           + Sync
           + 'static {
        move |request: Request, mut response: TestResponse| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                response.write_status(Status::SUCCESS, "text/gemini").await?;
                response.write(format!("path={}", request.path()).as_bytes()).await?;
                response.close().await
            }
            .boxed()
        }
    }

    async fn read_all(client: &mut DuplexStream) -> Vec<u8> {
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        received
    }

    #[tokio::test]
    async fn dispatches_parsed_request_to_handler() {
        let mut h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.client.write_all(b"gemini://example.org/hello\r\n").await.unwrap();

        h.session
            .run(&TransportInfo::anonymous(), &Gatekeeper::default(), &counting_handler(calls.clone()), &h.events)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(read_all(&mut h.client).await, b"20 text/gemini\r\npath=/hello");
    }

    #[tokio::test]
    async fn raises_request_notification() {
        let mut h = harness();
        let connection_id = h.session.connection().id;
        h.client.write_all(b"gemini://example.org/notify\r\n").await.unwrap();

        let transport = TransportInfo {
            client_fingerprint: Some("AA:BB".into()),
            certificate_status: CertificateStatus::DepthZeroSelfSigned,
            ..TransportInfo::anonymous()
        };
        h.session
            .run(&transport, &Gatekeeper::default(), &counting_handler(Arc::default()), &h.events)
            .await
            .unwrap();

        match h.receiver.try_recv().unwrap() {
            ServerEvent::Request(request) => {
                assert_eq!(request.path(), "/notify");
                assert_eq!(request.client_fingerprint(), Some("AA:BB"));
                assert_eq!(request.connection().id, connection_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closes_connection_when_handler_does_not() {
        let mut h = harness();
        h.client.write_all(b"/\r\n").await.unwrap();
        let handler = |_request: Request, mut response: TestResponse| async move {
            response.write_status(Status::SUCCESS, "text/plain").await
        };

        h.session
            .run(&TransportInfo::anonymous(), &Gatekeeper::default(), &handler, &h.events)
            .await
            .unwrap();

        assert_eq!(read_all(&mut h.client).await, b"20 text/plain\r\n");
    }

    #[tokio::test]
    async fn rejected_connection_never_reaches_handler() {
        let mut h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.client.write_all(b"gemini://example.org/\r\n").await.unwrap();
        let transport = TransportInfo {
            protocol_id: None,
            ..TransportInfo::anonymous()
        };

        let err = h
            .session
            .run(&transport, &Gatekeeper::default(), &counting_handler(calls.clone()), &h.events)
            .await
            .unwrap_err();

        assert!(matches!(err, GeminiError::Admission(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(h.receiver.try_recv().is_err());
        assert!(read_all(&mut h.client).await.is_empty());
    }

    #[tokio::test]
    async fn untrusted_certificate_is_rejected() {
        let mut h = harness();
        let transport = TransportInfo {
            certificate_status: CertificateStatus::Invalid("certificate has expired".into()),
            ..TransportInfo::anonymous()
        };

        let err = h
            .session
            .run(&transport, &Gatekeeper::default(), &counting_handler(Arc::default()), &h.events)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("certificate has expired"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_closes_idle_connection() {
        let mut h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.client.write_all(b"gemini://exa").await.unwrap();

        let err = h
            .session
            .run(&TransportInfo::anonymous(), &Gatekeeper::default(), &counting_handler(calls.clone()), &h.events)
            .await
            .unwrap_err();

        assert!(matches!(err, GeminiError::Parse(ParseError::Timeout(d)) if d == REQUEST_TIMEOUT));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(read_all(&mut h.client).await.is_empty());
    }

    #[tokio::test]
    async fn oversized_line_fails_without_dispatch() {
        let mut h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.client.write_all(&[b'a'; MAX_LINE_LENGTH + 100]).await.unwrap();

        let err = h
            .session
            .run(&TransportInfo::anonymous(), &Gatekeeper::default(), &counting_handler(calls.clone()), &h.events)
            .await
            .unwrap_err();

        assert!(matches!(err, GeminiError::Parse(ParseError::LineTooLong)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn peer_hangup_before_line_completes() {
        let Harness { mut session, mut client, events, .. } = harness();
        client.write_all(b"gemini://example.org/").await.unwrap();
        drop(client);

        let err = session
            .run(&TransportInfo::anonymous(), &Gatekeeper::default(), &counting_handler(Arc::default()), &events)
            .await
            .unwrap_err();

        assert!(matches!(err, GeminiError::Parse(ParseError::UnexpectedEof)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    async fn panicking_handler(_request: Request, _response: TestResponse) -> Result<(), ResponseError> {
        panic!("handler failure")
    }

    #[tokio::test]
    async fn handler_panic_destroys_connection() {
        let mut h = harness();
        h.client.write_all(b"/\r\n").await.unwrap();

        let err = h
            .session
            .run(&TransportInfo::anonymous(), &Gatekeeper::default(), &panicking_handler, &h.events)
            .await
            .unwrap_err();

        assert!(matches!(err, GeminiError::HandlerPanicked));
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(read_all(&mut h.client).await.is_empty());
    }

    fn panics_before_returning(_request: Request, _response: TestResponse) -> std::future::Ready<Result<(), ResponseError>> {
        panic!("handler failure")
    }

    #[tokio::test]
    async fn handler_panic_before_future_is_caught() {
        let mut h = harness();
        h.client.write_all(b"/early\r\n").await.unwrap();

        let err = h
            .session
            .run(&TransportInfo::anonymous(), &Gatekeeper::default(), &panics_before_returning, &h.events)
            .await
            .unwrap_err();

        assert!(matches!(err, GeminiError::HandlerPanicked));
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(matches!(h.receiver.try_recv(), Ok(ServerEvent::Request(_))));
        assert!(read_all(&mut h.client).await.is_empty());
    }

    #[tokio::test]
    async fn transport_error_before_line_completes() {
        let stream = tokio_test::io::Builder::new()
            .read(b"gemini://example.org/")
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer"))
            .build();
        let mut session = Session::new(stream, ConnectionInfo::new(None));
        let (events, mut receiver) = broadcast::channel(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = {
            let calls = calls.clone();
            move |_request: Request, _response: Response<tokio_test::io::Mock>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), ResponseError>(()) }
            }
        };

        let err = session
            .run(&TransportInfo::anonymous(), &Gatekeeper::default(), &handler, &events)
            .await
            .unwrap_err();

        assert!(matches!(err, GeminiError::Parse(ParseError::Io(ref e)) if e.kind() == std::io::ErrorKind::ConnectionReset));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn handler_error_is_returned() {
        let mut h = harness();
        h.client.write_all(b"/\r\n").await.unwrap();
        let handler = |_request: Request, mut response: TestResponse| async move {
            response.write(b"no status").await
        };

        let err = h
            .session
            .run(&TransportInfo::anonymous(), &Gatekeeper::default(), &handler, &h.events)
            .await
            .unwrap_err();

        assert!(matches!(err, GeminiError::Response(ResponseError::StatusNotSent)));
        assert!(read_all(&mut h.client).await.is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let (server, _client) = duplex(64);
        let mut session = Session::new(server, ConnectionInfo::new(None));
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
