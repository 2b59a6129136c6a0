use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Unique identifier for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Read-only description of the connection a request arrived on.
///
/// Requests carry this as a back-reference for correlating the eventual response;
/// it never grants access to the underlying stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Identifier shared by the request, its response and any server events.
    pub id: ConnectionId,
    /// Address of the remote peer, when the transport has one.
    pub peer_addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub fn new(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_addr,
        }
    }
}
