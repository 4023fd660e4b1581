use shared::TaggedBytesMut;
use shared::error::Result;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Identity of a socket, stable for its whole life and never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketState {
    Bound,
    Listening,
    Connected,
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SocketOption {
    SendBufferSize,
    RecvBufferSize,
    Dscp,
    NoDelay,
}

/// A datagram endpoint owned by exactly one Port or Connection.
///
/// Sending never blocks: a full send buffer is reported as
/// `Error::ErrWouldBlock` and followed later by [`SocketEvent::ReadyToSend`].
pub trait PacketSocket {
    fn id(&self) -> SocketId;
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn state(&self) -> SocketState;

    /// Restricts the socket to `remote`.
    fn connect(&mut self, remote: SocketAddr) -> Result<()>;

    /// Sends to the connected remote address.
    fn send(&mut self, data: &[u8], now: Instant) -> Result<usize>;

    fn send_to(&mut self, data: &[u8], remote: SocketAddr, now: Instant) -> Result<usize>;

    fn set_option(&mut self, option: SocketOption, value: i32) -> Result<()>;

    fn close(&mut self);
}

/// Creates sockets on a given local IP, picking a port in `[min_port, max_port]`,
/// or an ephemeral one when both are zero.
pub trait PacketSocketFactory {
    fn create_udp_socket(
        &self,
        local_ip: IpAddr,
        min_port: u16,
        max_port: u16,
    ) -> Result<Box<dyn PacketSocket>>;

    /// A socket that accepts one new connected socket per unknown peer,
    /// delivered as [`SocketEvent::NewConnection`].
    fn create_listen_socket(
        &self,
        local_ip: IpAddr,
        min_port: u16,
        max_port: u16,
    ) -> Result<Box<dyn PacketSocket>>;
}

/// Something that happened on a socket.
pub enum SocketEvent {
    Read(TaggedBytesMut),
    ReadyToSend,
    Closed(Option<String>),
    NewConnection(Box<dyn PacketSocket>),
}

impl fmt::Debug for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketEvent::Read(msg) => write!(
                f,
                "Read({} bytes from {})",
                msg.message.len(),
                msg.transport.peer_addr
            ),
            SocketEvent::ReadyToSend => write!(f, "ReadyToSend"),
            SocketEvent::Closed(reason) => write!(f, "Closed({reason:?})"),
            SocketEvent::NewConnection(socket) => write!(
                f,
                "NewConnection({} from {:?})",
                socket.id(),
                socket.remote_addr()
            ),
        }
    }
}

/// A socket event delivered into the network context.
#[derive(Debug)]
pub struct SocketMessage {
    pub now: Instant,
    pub socket_id: SocketId,
    pub event: SocketEvent,
}

/// Record of a datagram handed to a socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub socket_id: SocketId,
    pub size: usize,
    pub send_time: Instant,
}

/// A local network interface candidates are gathered on.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub id: u16,
    pub ips: Vec<IpAddr>,
}

impl Network {
    pub fn new(name: impl Into<String>, id: u16, ips: Vec<IpAddr>) -> Self {
        Self {
            name: name.into(),
            id,
            ips,
        }
    }

    /// The address candidates are bound to, IPv4 preferred.
    pub fn best_ip(&self) -> Option<IpAddr> {
        self.ips
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.ips.first())
            .copied()
    }
}
