
use log::{debug, info, trace, warn};
use shared::TaggedBytesMut;
use shared::error::{Error, ErrorKind, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use crate::candidate::*;
use crate::checker::{CheckMessage, ConnectivityChecker};
use crate::connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionTimeouts, username_matches,
};
use crate::ice::{IceParameters, IceRole, RoleConflict};
use crate::socket::*;

/// Identity of a port, used by its connections as a back reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u64);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Where a remote candidate was learned from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CandidateOrigin {
    ThisPort,
    OtherPort,
    Message,
}

/// State every connection of a port reads while handling its own events.
pub(crate) struct PortContext {
    pub(crate) port_id: PortId,
    pub(crate) name: String,
    pub(crate) network: Network,
    pub(crate) component: u16,
    pub(crate) min_port: u16,
    pub(crate) max_port: u16,
    pub(crate) local_ice: IceParameters,
    pub(crate) remote_ice: Option<IceParameters>,
    pub(crate) ice_role: IceRole,
    pub(crate) tiebreaker: u64,
    pub(crate) socket_factory: Rc<dyn PacketSocketFactory>,
    pub(crate) checker: Rc<dyn ConnectivityChecker>,
    pub(crate) socket_options: HashMap<SocketOption, i32>,
    pub(crate) timeouts: ConnectionTimeouts,
}

/// Collects the arguments to [`Port`] construction.
pub struct PortConfig {
    pub port_id: PortId,
    pub name: String,
    pub network: Network,
    pub component: u16,
    pub min_port: u16,
    pub max_port: u16,
    /// Open a listen socket that accepts a socket per remote peer.
    pub allow_listen: bool,
    pub local_ice: IceParameters,
    pub remote_ice: Option<IceParameters>,
    pub ice_role: IceRole,
    pub tiebreaker: u64,
    pub timeouts: ConnectionTimeouts,
    pub socket_factory: Rc<dyn PacketSocketFactory>,
    pub checker: Rc<dyn ConnectivityChecker>,
}

#[derive(Debug)]
pub enum PortEvent {
    CandidateGathered(Candidate),
    PortComplete,
    ConnectionCreated(ConnectionId),
    ConnectionStateChange(ConnectionId),
    ConnectionReadPacket(ConnectionId, TaggedBytesMut),
    ConnectionReadyToSend(ConnectionId),
    ConnectionSocketClosed(ConnectionId),
    ConnectionReconnecting(ConnectionId),
    ConnectionDestroyed(ConnectionId),
    RoleConflict(ConnectionId, RoleConflict),
}

/// Owns the local candidate, the sockets not yet paired and every
/// connection built on top of them.
pub struct Port {
    ctx: PortContext,
    listen_socket: Option<Box<dyn PacketSocket>>,
    candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    // accepted sockets waiting for a connection, keyed by remote address
    incoming: HashMap<SocketAddr, Box<dyn PacketSocket>>,
    connections: BTreeMap<ConnectionId, Connection>,
    next_connection_id: u64,
    error: Option<ErrorKind>,
    events: VecDeque<PortEvent>,
    sent_packets: VecDeque<SentPacket>,
    destroyed: bool,
}

impl Port {
    pub fn new(config: PortConfig) -> Result<Self> {
        config.local_ice.validate_local()?;

        let mut port = Self {
            ctx: PortContext {
                port_id: config.port_id,
                name: config.name,
                network: config.network,
                component: config.component,
                min_port: config.min_port,
                max_port: config.max_port,
                local_ice: config.local_ice,
                remote_ice: config.remote_ice,
                ice_role: config.ice_role,
                tiebreaker: config.tiebreaker,
                socket_factory: config.socket_factory,
                checker: config.checker,
                socket_options: HashMap::new(),
                timeouts: config.timeouts,
            },
            listen_socket: None,
            candidates: vec![],
            remote_candidates: vec![],
            incoming: HashMap::new(),
            connections: BTreeMap::new(),
            next_connection_id: 0,
            error: None,
            events: VecDeque::new(),
            sent_packets: VecDeque::new(),
            destroyed: false,
        };

        if config.allow_listen {
            if let Err(err) = port.open_listen_socket() {
                warn!(
                    "[{}]: failed to open listen socket: {}, continuing anyway",
                    port.ctx.name, err
                );
                port.error = Some(err.kind());
            }
        }

        Ok(port)
    }

    fn open_listen_socket(&mut self) -> Result<()> {
        let ip = self
            .ctx
            .network
            .best_ip()
            .ok_or(Error::ErrNoNetworkAddress)?;
        let socket =
            self.ctx
                .socket_factory
                .create_listen_socket(ip, self.ctx.min_port, self.ctx.max_port)?;
        debug!(
            "[{}]: listening on {} ({})",
            self.ctx.name,
            socket.local_addr(),
            socket.id()
        );
        self.listen_socket = Some(socket);
        Ok(())
    }

    pub fn id(&self) -> PortId {
        self.ctx.port_id
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn network(&self) -> &Network {
        &self.ctx.network
    }

    pub fn component(&self) -> u16 {
        self.ctx.component
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote_candidates
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_socket.as_ref().map(|socket| socket.local_addr())
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Connections in creation order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_for(&self, remote: SocketAddr) -> Option<&Connection> {
        self.connections
            .values()
            .find(|conn| conn.remote_candidate().address() == remote)
    }

    pub fn ice_role(&self) -> IceRole {
        self.ctx.ice_role
    }

    pub fn set_ice_role(&mut self, role: IceRole) {
        self.ctx.ice_role = role;
    }

    pub fn tiebreaker(&self) -> u64 {
        self.ctx.tiebreaker
    }

    pub fn set_tiebreaker(&mut self, tiebreaker: u64) {
        self.ctx.tiebreaker = tiebreaker;
    }

    pub fn local_ice_parameters(&self) -> &IceParameters {
        &self.ctx.local_ice
    }

    /// New local credentials apply to checks from now on; candidates
    /// already gathered keep the old ufrag.
    pub fn set_local_ice_parameters(&mut self, params: IceParameters, now: Instant) -> Result<()> {
        params.validate_local()?;
        if self.ctx.local_ice == params {
            return Ok(());
        }
        self.ctx.local_ice = params;
        for conn in self.connections.values_mut() {
            conn.restart_checks(&self.ctx, now);
        }
        Ok(())
    }

    pub fn remote_ice_parameters(&self) -> Option<&IceParameters> {
        self.ctx.remote_ice.as_ref()
    }

    /// Replacing the remote credentials drops every check made with the
    /// old ones.
    pub fn set_remote_ice_parameters(&mut self, params: IceParameters, now: Instant) {
        if self.ctx.remote_ice.as_ref() == Some(&params) {
            return;
        }
        self.ctx.remote_ice = Some(params);
        for conn in self.connections.values_mut() {
            conn.restart_checks(&self.ctx, now);
        }
    }

    /// Emits the local candidate. Without a listen socket the candidate is
    /// a placeholder on the discard port that nothing can reach.
    pub fn prepare_address(&mut self) -> Result<()> {
        let (address, port) = match self.listen_socket.as_ref() {
            Some(socket) => {
                let addr = socket.local_addr();
                (addr.ip(), addr.port())
            }
            None => {
                let ip = self
                    .ctx
                    .network
                    .best_ip()
                    .ok_or(Error::ErrNoNetworkAddress)?;
                warn!(
                    "[{}]: no listen socket, advertising {}:{}",
                    self.ctx.name, ip, DISCARD_PORT
                );
                (ip, DISCARD_PORT)
            }
        };

        let candidate = CandidateConfig {
            candidate_type: CandidateType::Host,
            address: address.to_string(),
            port,
            component: self.ctx.component,
            network_id: self.ctx.network.id,
            network_name: self.ctx.network.name.clone(),
            username: self.ctx.local_ice.ufrag.clone(),
            password: self.ctx.local_ice.pwd.clone(),
            ..Default::default()
        }
        .new_candidate()?;

        info!("[{}]: gathered {}", self.ctx.name, candidate);
        self.candidates.push(candidate.clone());
        self.events.push_back(PortEvent::CandidateGathered(candidate));
        self.events.push_back(PortEvent::PortComplete);

        Ok(())
    }

    fn local_candidate_for(&self, remote: &Candidate) -> Option<&Candidate> {
        self.candidates
            .iter()
            .find(|local| local.address().is_ipv4() == remote.address().is_ipv4())
    }

    /// Builds (or finds) the connection to `remote`.
    ///
    /// Returns `None` when the pair cannot exist on this port. A socket
    /// accepted earlier from the same address is handed to the new
    /// connection.
    pub fn create_connection(
        &mut self,
        remote: &Candidate,
        origin: CandidateOrigin,
        now: Instant,
    ) -> Option<ConnectionId> {
        if self.destroyed {
            return None;
        }
        if remote.protocol() != QUIC_PROTOCOL_NAME {
            debug!(
                "[{}]: unsupported protocol {} for {}",
                self.ctx.name,
                remote.protocol(),
                remote.address()
            );
            return None;
        }
        if origin == CandidateOrigin::OtherPort {
            debug!(
                "[{}]: {} was learned on another port",
                self.ctx.name,
                remote.address()
            );
            return None;
        }
        if let Some(conn) = self.connection_for(remote.address()) {
            return Some(conn.id());
        }
        let Some(local) = self.local_candidate_for(remote).cloned() else {
            debug!(
                "[{}]: no local candidate compatible with {}",
                self.ctx.name,
                remote.address()
            );
            return None;
        };

        let socket = self.incoming.remove(&remote.address());
        if let Some(socket) = &socket {
            debug!(
                "[{}]: adopting incoming {} for {}",
                self.ctx.name,
                socket.id(),
                remote.address()
            );
        }
        Some(self.add_connection(local, remote.clone(), socket, now))
    }

    fn add_connection(
        &mut self,
        local: Candidate,
        remote: Candidate,
        socket: Option<Box<dyn PacketSocket>>,
        now: Instant,
    ) -> ConnectionId {
        self.next_connection_id += 1;
        let id = ConnectionId(self.next_connection_id);
        let mut conn = Connection::new(id, &self.ctx, local, remote, socket);
        conn.start(&self.ctx, now);
        info!("[{}]: created {}", self.ctx.name, conn);

        self.connections.insert(id, conn);
        self.events.push_back(PortEvent::ConnectionCreated(id));
        id
    }

    /// Remembers `candidate` and pairs it with the local candidate.
    pub fn add_remote_candidate(
        &mut self,
        candidate: Candidate,
        now: Instant,
    ) -> Option<ConnectionId> {
        if !self
            .remote_candidates
            .iter()
            .any(|known| known.equal(&candidate))
        {
            self.remote_candidates.push(candidate.clone());
        }
        self.create_connection(&candidate, CandidateOrigin::Message, now)
    }

    /// Forgets `candidate` and destroys the connection to its address.
    pub fn remove_remote_candidate(&mut self, candidate: &Candidate) -> Vec<ConnectionId> {
        self.remote_candidates
            .retain(|known| !known.equal(candidate));

        let doomed: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| conn.remote_candidate().address() == candidate.address())
            .map(|conn| conn.id())
            .collect();
        for id in &doomed {
            self.destroy_connection(*id);
        }
        doomed
    }

    pub fn remove_all_remote_candidates(&mut self) -> Vec<ConnectionId> {
        self.remote_candidates.clear();
        let doomed: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in &doomed {
            self.destroy_connection(*id);
        }
        doomed
    }

    pub fn destroy_connection(&mut self, id: ConnectionId) -> bool {
        let Some(mut conn) = self.connections.remove(&id) else {
            return false;
        };
        conn.destroy();
        self.events.push_back(PortEvent::ConnectionDestroyed(id));
        true
    }

    pub fn set_option(&mut self, option: SocketOption, value: i32) -> Result<()> {
        self.ctx.socket_options.insert(option, value);
        if let Some(socket) = self.listen_socket.as_mut() {
            socket.set_option(option, value)?;
        }
        for socket in self.incoming.values_mut() {
            socket.set_option(option, value)?;
        }
        for conn in self.connections.values_mut() {
            conn.set_socket_option(option, value)?;
        }
        Ok(())
    }

    pub fn get_option(&self, option: SocketOption) -> Option<i32> {
        self.ctx.socket_options.get(&option).copied()
    }

    pub fn send(&mut self, id: ConnectionId, data: &[u8], now: Instant) -> Result<usize> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(Error::ErrConnectionNotFound(id.0))?;
        let result = conn.send(&self.ctx, data, now);
        self.drain_connection(id);
        result
    }

    pub fn reconnect(&mut self, id: ConnectionId, now: Instant) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(Error::ErrConnectionNotFound(id.0))?;
        let result = conn.reconnect(&self.ctx, now);
        self.drain_connection(id);
        result
    }

    /// Routes a socket event to the connection owning the socket, or
    /// handles it here when the port still owns it.
    pub fn handle_socket_message(&mut self, msg: SocketMessage) {
        if self.destroyed {
            return;
        }
        let SocketMessage {
            now,
            socket_id,
            event,
        } = msg;

        if self.listen_socket.as_ref().map(|socket| socket.id()) == Some(socket_id) {
            self.handle_listen_event(event);
            return;
        }

        let owner = self
            .connections
            .values()
            .find(|conn| conn.socket_id() == Some(socket_id))
            .map(|conn| conn.id());
        if let Some(id) = owner {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.handle_socket_event(&self.ctx, event, now);
            }
            self.drain_connection(id);
            return;
        }

        let parked = self
            .incoming
            .iter()
            .find(|(_, socket)| socket.id() == socket_id)
            .map(|(addr, _)| *addr);
        if let Some(remote) = parked {
            match event {
                SocketEvent::Read(msg) => self.handle_unknown_address(remote, msg, now),
                SocketEvent::Closed(reason) => {
                    debug!(
                        "[{}]: incoming socket for {} closed: {:?}",
                        self.ctx.name, remote, reason
                    );
                    self.incoming.remove(&remote);
                }
                SocketEvent::ReadyToSend => {}
                SocketEvent::NewConnection(mut socket) => socket.close(),
            }
            return;
        }

        // a socket released on reconnect or destroy
        trace!(
            "[{}]: discarding {:?} for stale {}",
            self.ctx.name, event, socket_id
        );
    }

    fn handle_listen_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::NewConnection(mut socket) => {
                let Some(remote) = socket.remote_addr() else {
                    warn!(
                        "[{}]: accepted {} without a remote address",
                        self.ctx.name,
                        socket.id()
                    );
                    socket.close();
                    return;
                };
                for (option, value) in &self.ctx.socket_options {
                    if let Err(err) = socket.set_option(*option, *value) {
                        debug!(
                            "[{}]: failed to set {:?} on {}: {}",
                            self.ctx.name,
                            option,
                            socket.id(),
                            err
                        );
                    }
                }
                trace!(
                    "[{}]: parked incoming {} from {}",
                    self.ctx.name,
                    socket.id(),
                    remote
                );
                if let Some(mut old) = self.incoming.insert(remote, socket) {
                    old.close();
                }
            }
            SocketEvent::Read(msg) => {
                warn!(
                    "[{}]: discarding {} bytes read on the listen socket from {}",
                    self.ctx.name,
                    msg.message.len(),
                    msg.transport.peer_addr
                );
            }
            SocketEvent::Closed(reason) => {
                warn!("[{}]: listen socket closed: {:?}", self.ctx.name, reason);
                self.listen_socket = None;
                self.error = Some(ErrorKind::NotConnected);
            }
            SocketEvent::ReadyToSend => {}
        }
    }

    /// A datagram on a parked socket. Only an authenticated check request
    /// creates a connection; the peer-reflexive candidate is the source.
    fn handle_unknown_address(&mut self, remote: SocketAddr, msg: TaggedBytesMut, now: Instant) {
        let checker = Rc::clone(&self.ctx.checker);
        if !checker.is_check_message(&msg.message) {
            warn!(
                "[{}]: discarding {} bytes from unknown address {}",
                self.ctx.name,
                msg.message.len(),
                remote
            );
            return;
        }

        let (username, priority) = match checker.parse(&msg.message) {
            Ok(CheckMessage::Request {
                username, priority, ..
            }) => (username, priority),
            Ok(other) => {
                debug!(
                    "[{}]: discarding {:?} from unknown address {}",
                    self.ctx.name,
                    other.transaction_id(),
                    remote
                );
                return;
            }
            Err(err) => {
                warn!("[{}]: malformed check from {}: {}", self.ctx.name, remote, err);
                return;
            }
        };

        let Some((_, remote_ufrag)) = username.split_once(':') else {
            warn!("[{}]: bad username {} from {}", self.ctx.name, username, remote);
            return;
        };
        // same rule the connection applies to every request
        if !username_matches(&self.ctx, &username) {
            warn!(
                "[{}]: check from {} for another session: {}",
                self.ctx.name, remote, username
            );
            return;
        }
        if let Err(err) = checker.verify(&msg.message, &self.ctx.local_ice.pwd) {
            warn!(
                "[{}]: unauthenticated check from {}: {}",
                self.ctx.name, remote, err
            );
            return;
        }

        if self.connection_for(remote).is_some() {
            debug!(
                "[{}]: {} already has a connection, dropping its second socket",
                self.ctx.name, remote
            );
            if let Some(mut socket) = self.incoming.remove(&remote) {
                socket.close();
            }
            return;
        }
        let Some(socket) = self.incoming.remove(&remote) else {
            return;
        };
        let prflx = CandidateConfig {
            candidate_type: CandidateType::PeerReflexive,
            address: remote.ip().to_string(),
            port: remote.port(),
            component: self.ctx.component,
            priority: priority.unwrap_or_default(),
            username: remote_ufrag.to_owned(),
            ..Default::default()
        }
        .new_candidate();
        let prflx = match prflx {
            Ok(prflx) => prflx,
            Err(err) => {
                warn!("[{}]: bad peer reflexive {}: {}", self.ctx.name, remote, err);
                return;
            }
        };
        let Some(local) = self.local_candidate_for(&prflx).cloned() else {
            warn!(
                "[{}]: no local candidate for peer reflexive {}",
                self.ctx.name, remote
            );
            return;
        };

        info!("[{}]: discovered peer reflexive {}", self.ctx.name, prflx);
        let id = self.add_connection(local, prflx, Some(socket), now);
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.handle_read(&self.ctx, msg, now);
        }
        self.drain_connection(id);
    }

    fn drain_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        while let Some(packet) = conn.poll_sent_packet() {
            self.sent_packets.push_back(packet);
        }
        while let Some(event) = conn.poll_event() {
            self.events.push_back(match event {
                ConnectionEvent::StateChange => PortEvent::ConnectionStateChange(id),
                ConnectionEvent::ReadPacket(msg) => PortEvent::ConnectionReadPacket(id, msg),
                ConnectionEvent::ReadyToSend => PortEvent::ConnectionReadyToSend(id),
                ConnectionEvent::SocketClosed => PortEvent::ConnectionSocketClosed(id),
                ConnectionEvent::Reconnecting => PortEvent::ConnectionReconnecting(id),
                ConnectionEvent::RoleConflict(conflict) => PortEvent::RoleConflict(id, conflict),
            });
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.destroyed {
            return;
        }
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.handle_timeout(&self.ctx, now);
            }
            self.drain_connection(id);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.destroyed {
            return None;
        }
        self.connections
            .values()
            .filter_map(|conn| conn.poll_timeout())
            .min()
    }

    pub fn poll_event(&mut self) -> Option<PortEvent> {
        self.events.pop_front()
    }

    pub fn poll_sent_packet(&mut self) -> Option<SentPacket> {
        self.sent_packets.pop_front()
    }

    /// Closes every socket and destroys every connection; nothing fires
    /// afterwards.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        info!("[{}]: destroyed", self.ctx.name);
        for conn in self.connections.values_mut() {
            conn.destroy();
        }
        self.connections.clear();
        for (_, mut socket) in self.incoming.drain() {
            socket.close();
        }
        if let Some(mut socket) = self.listen_socket.take() {
            socket.close();
        }
        self.events.clear();
        self.sent_packets.clear();
        self.destroyed = true;
    }
}
