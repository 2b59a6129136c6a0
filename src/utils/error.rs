use thiserror::Error;

/// Represents the errors a Gemini server can run into, from startup to the end of a session.
#[derive(Error, Debug)]
pub enum GeminiError {
    /// Represents an error in the server configuration.
    ///
    /// This occurs when an invalid or inconsistent configuration is detected, or when the
    /// identity material cannot be loaded.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Indicates that the TLS handshake did not complete.
    ///
    /// Failed handshakes are never retried.
    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    /// The connection was refused by the gatekeeper after the handshake.
    #[error("Connection rejected: {0}")]
    Admission(#[from] crate::server::gatekeeper::AdmissionError),

    /// No valid request line could be read from the connection.
    #[error("Request error: {0}")]
    Parse(#[from] crate::server::request::ParseError),

    /// Writing the response failed or violated the status-then-body ordering.
    #[error("Response error: {0}")]
    Response(#[from] crate::server::response::ResponseError),

    /// Indicates a failure registering or encoding health metrics.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The request handler panicked; its connection was destroyed.
    #[error("Request handler panicked")]
    HandlerPanicked,

    /// Represents a general I/O error outside of a session (binding, accepting).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
