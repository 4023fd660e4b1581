
use bytes::BytesMut;
use shared::error::Result;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use crate::ice::IceRole;

/// Side of the secure transport handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HandshakeRole {
    Client,
    Server,
}

impl fmt::Display for HandshakeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Client => "client",
            Self::Server => "server",
        };
        write!(f, "{s}")
    }
}

/// How the ICE role maps onto the handshake role. Both peers must use the
/// same convention.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeRoleConvention {
    /// The controlling agent initiates the handshake.
    #[default]
    ControllingIsClient,
    ControllingIsServer,
}

impl HandshakeRoleConvention {
    pub fn handshake_role(self, ice_role: IceRole) -> HandshakeRole {
        match (self, ice_role) {
            (Self::ControllingIsClient, IceRole::Controlling)
            | (Self::ControllingIsServer, IceRole::Controlled) => HandshakeRole::Client,
            (Self::ControllingIsClient, IceRole::Controlled)
            | (Self::ControllingIsServer, IceRole::Controlling) => HandshakeRole::Server,
        }
    }
}

/// Outcome of offering an inbound datagram to the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeRead {
    /// The engine took the datagram; any application bytes it carried are
    /// available from [`HandshakeEngine::poll_read`].
    Consumed,
    /// Not engine traffic, the caller classifies it itself.
    NotHandshake,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    Ready,
    Closed(Option<String>),
}

/// Opaque secure transport engine driven with raw datagrams.
///
/// Wire datagrams in, decrypted application bytes out, and the reverse for
/// writes. The engine never touches sockets; whatever it wants sent is
/// returned from [`poll_write`](HandshakeEngine::poll_write).
pub trait HandshakeEngine {
    fn role(&self) -> HandshakeRole;

    /// Kicks off the handshake; a client queues its first flight here.
    fn start(&mut self, now: Instant) -> Result<()>;

    fn handle_read(&mut self, datagram: &[u8], now: Instant) -> Result<HandshakeRead>;

    /// Decrypted application bytes.
    fn poll_read(&mut self) -> Option<BytesMut>;

    /// Queues application bytes for protection.
    fn handle_write(&mut self, payload: &[u8], now: Instant) -> Result<()>;

    /// Datagrams to put on the wire.
    fn poll_write(&mut self) -> Option<BytesMut>;

    fn poll_event(&mut self) -> Option<HandshakeEvent>;

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn is_ready(&self) -> bool;

    fn close(&mut self) -> Result<()>;
}

/// Builds the engine once a path has become writable.
pub trait HandshakeEngineFactory {
    fn create_engine(
        &self,
        role: HandshakeRole,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<Box<dyn HandshakeEngine>>;
}
