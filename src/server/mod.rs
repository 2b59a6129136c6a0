// src/server/mod.rs
pub mod connection;
pub mod gatekeeper;
pub mod handler;
pub mod health;
pub mod middleware;
pub mod request;
pub mod response;
pub mod session;
pub mod tls;

// Re-export public components
pub use connection::{ConnectionId, ConnectionInfo};
pub use gatekeeper::{Admission, AdmissionError, CertificateStatus, Gatekeeper, TransportInfo};
pub use handler::Handler;
pub use health::HealthMetrics;
pub use middleware::rate_limit::ConnectionRateLimiter;
pub use request::{LineParser, ParseError, Request, RequestLine};
pub use response::{Response, ResponseError, Status};
pub use session::{Session, SessionState, REQUEST_TIMEOUT};

// Import internal dependencies
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, timeout};
use tokio_rustls::server::TlsStream;
use prometheus::IntGauge;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::server::tls::{GeminiAcceptor, PeerValidator};
use crate::utils::error::GeminiError;

/// The transport every production session runs on.
pub type ServerStream = TlsStream<TcpStream>;

const EVENT_CAPACITY: usize = 256;
const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Notifications broadcast to [`Server::subscribe`] receivers.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A request was dispatched to the handler.
    ///
    /// Only the request is carried: the [`Response`] is owned by the handler, which is the
    /// sole writer. Observers correlate with the response through `Request::connection().id`,
    /// which also tags any later [`ServerEvent::Error`] for the same connection.
    Request(Request),
    /// A connection failed: handshake, admission, parsing or handling.
    Error {
        connection: Option<ConnectionId>,
        error: Arc<GeminiError>,
    },
}

struct ServerState<H> {
    config: ServerConfig,
    tls_acceptor: GeminiAcceptor,
    peer_validator: PeerValidator,
    handler: H,
    metrics: HealthMetrics,
    rate_limiter: Option<ConnectionRateLimiter>,
    connection_slots: Option<Arc<Semaphore>>,
    events: broadcast::Sender<ServerEvent>,
}

/// A Gemini server: accepts TLS connections and runs one [`Session`] per connection.
pub struct Server<H> {
    state: Arc<ServerState<H>>,
    gatekeeper: Gatekeeper,
}

impl<H> Clone for Server<H> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            gatekeeper: self.gatekeeper.clone(),
        }
    }
}

impl<H> Server<H>
where
    H: Handler<ServerStream>,
{
    /// Validates the configuration and prepares TLS, admission and metrics.
    ///
    /// # Errors
    /// Returns a `GeminiError::ConfigurationError` for invalid settings or unreadable
    /// certificate material, and `GeminiError::Metrics` if metric registration fails.
    pub fn new(config: ServerConfig, handler: H) -> Result<Self, GeminiError> {
        config.validate()?;
        let tls_acceptor = config.create_tls_acceptor()?;
        let peer_validator = config.peer_validator()?;
        let rate_limiter = config
            .connection_rate_limit
            .and_then(NonZeroU32::new)
            .map(ConnectionRateLimiter::new);
        let connection_slots = config.max_connections.map(|n| Arc::new(Semaphore::new(n)));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            state: Arc::new(ServerState {
                config,
                tls_acceptor,
                peer_validator,
                handler,
                metrics: HealthMetrics::new()?,
                rate_limiter,
                connection_slots,
                events,
            }),
            gatekeeper: Gatekeeper::default(),
        })
    }

    /// Replaces the default gatekeeper, typically to accept other protocol ids.
    pub fn with_gatekeeper(mut self, gatekeeper: Gatekeeper) -> Self {
        self.gatekeeper = gatekeeper;
        self
    }

    /// Receives request notifications and connection errors from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.state.events.subscribe()
    }

    pub fn metrics(&self) -> &HealthMetrics {
        &self.state.metrics
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Binds the configured address.
    ///
    /// # Errors
    /// Returns `GeminiError::Io` if the address cannot be bound.
    pub async fn bind(&self) -> Result<TcpListener, GeminiError> {
        let listener = TcpListener::bind(self.state.config.listen_address()).await?;
        Ok(listener)
    }

    /// Serves connections from `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GeminiError> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serves connections until `shutdown` resolves. Sessions already running are left
    /// to finish on their own.
    ///
    /// # Errors
    /// Returns an error only if the connection limit can no longer be enforced.
    pub async fn serve_with_shutdown<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), GeminiError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut prune = interval(RATE_LIMIT_PRUNE_INTERVAL);
        info!("Gemini server listening on {:?}", listener.local_addr().ok());

        loop {
            let permit = match &self.state.connection_slots {
                Some(slots) => tokio::select! {
                    permit = Arc::clone(slots).acquire_owned() => Some(permit.map_err(|_| {
                        GeminiError::ConfigurationError("connection limit closed".into())
                    })?),
                    _ = &mut shutdown => break,
                },
                None => None,
            };

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer_addr, permit).await;
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = prune.tick(), if self.state.rate_limiter.is_some() => {
                    if let Some(limiter) = &self.state.rate_limiter {
                        limiter.prune();
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        info!("Stopped accepting connections");
        Ok(())
    }

    async fn handle_connection(
        self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        _permit: Option<OwnedSemaphorePermit>,
    ) {
        let state = &self.state;
        let info = ConnectionInfo::new(Some(peer_addr));

        if let Some(limiter) = &state.rate_limiter {
            if !limiter.check(peer_addr.ip()) {
                warn!(%peer_addr, "Connection rate limit exceeded");
                state.metrics.rejected_connections_total.inc();
                return;
            }
        }

        let handshake_timeout = state.config.tls.handshake_timeout();
        let tls_stream = match timeout(handshake_timeout, state.tls_acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => {
                error!(%peer_addr, "TLS handshake failed: {}", e);
                state.metrics.handshake_failures_total.inc();
                self.emit_error(Some(info.id), GeminiError::Handshake(e));
                return;
            }
            Err(_) => {
                error!(%peer_addr, "TLS handshake timed out after {:?}", handshake_timeout);
                state.metrics.handshake_failures_total.inc();
                let e = io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out");
                self.emit_error(Some(info.id), GeminiError::Handshake(e));
                return;
            }
        };

        let transport = state.peer_validator.inspect(tls_stream.get_ref().1);
        let connection_id = info.id;
        let mut session = Session::new(tls_stream, info);

        let active = ActiveConnection::new(&state.metrics.connections);
        let result = session
            .run(&transport, &self.gatekeeper, &state.handler, &state.events)
            .await;
        drop(active);

        match result {
            Ok(()) => state.metrics.requests_total.inc(),
            Err(e) => {
                match &e {
                    GeminiError::Admission(_) => state.metrics.rejected_connections_total.inc(),
                    GeminiError::Response(_) | GeminiError::HandlerPanicked => {
                        state.metrics.requests_total.inc();
                        state.metrics.response_errors_total.inc();
                    }
                    _ => state.metrics.failed_requests_total.inc(),
                }
                self.emit_error(Some(connection_id), e);
            }
        }
    }

    fn emit_error(&self, connection: Option<ConnectionId>, error: GeminiError) {
        // Nobody listening is fine.
        let _ = self.state.events.send(ServerEvent::Error {
            connection,
            error: Arc::new(error),
        });
    }
}

/// Counts a session in the connections gauge for as long as it is alive, unwinding included.
struct ActiveConnection(IntGauge);

impl ActiveConnection {
    fn new(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.dec();
    }
}
