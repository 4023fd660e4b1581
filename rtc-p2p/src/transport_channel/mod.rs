#[cfg(test)]
mod transport_channel_test;

pub mod transport_channel_config;
mod transport_channel_proto;

use bytes::BytesMut;
use log::{debug, info, trace, warn};
use shared::error::{Error, Result};
use shared::marshal::Marshal;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

pub use transport_channel_config::TransportChannelConfig;

use crate::candidate::*;
use crate::checker::ConnectivityChecker;
use crate::connection::{CandidatePairState, Connection, ConnectionId, ConnectionTimeouts};
use crate::context::NetworkContext;
use crate::handshake::*;
use crate::ice::rand::generate_tiebreaker;
use crate::ice::*;
use crate::message::*;
use crate::port::{Port, PortConfig, PortEvent, PortId};
pub use crate::socket::SentPacket;
use crate::socket::*;

/// Per-message options of [`TransportChannel::send_data`].
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct SendDataParams {
    /// Tag of a signaling channel message, ignored on data channels.
    pub signaling_type: SignalingMessageType,
}

/// An application message of one logical channel.
///
/// Written to the channel to send it, read from the channel once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelMessage {
    pub channel_id: ChannelId,
    pub params: SendDataParams,
    pub payload: BytesMut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportChannelEvent {
    CandidateGathered(Candidate),
    GatheringStateChange(IceGatheringState),
    WritableStateChange(bool),
    ReceivingStateChange(bool),
    TransportStateChange(TransportState),
    SelectedCandidatePairChange { local: Candidate, remote: Candidate },
    /// Both peers claimed the same ICE role. The channel keeps its role,
    /// the owner decides whether to switch.
    RoleConflict(RoleConflict),
    ReadyToSend,
    ChannelClosed(ChannelId),
    /// A message of the signaling channel; it never shows up as data.
    SignalingMessage(SignalingMessage),
    HandshakeReady,
    HandshakeClosed(Option<String>),
}

/// The ICE transport of one component, with numbered data channels and the
/// signaling channel multiplexed over the selected connection.
pub struct TransportChannel {
    name: String,
    component: u16,
    context: NetworkContext,
    network: Network,
    min_port: u16,
    max_port: u16,
    allow_listen: bool,
    timeouts: ConnectionTimeouts,
    socket_factory: Rc<dyn PacketSocketFactory>,
    checker: Rc<dyn ConnectivityChecker>,
    engine_factory: Option<Rc<dyn HandshakeEngineFactory>>,
    handshake_role_convention: HandshakeRoleConvention,

    ice_role: IceRole,
    tiebreaker: u64,
    local_ice: IceParameters,
    remote_ice: Option<IceParameters>,
    // remote candidates and options given before the port exists
    pending_remote_candidates: Vec<Candidate>,
    socket_options: HashMap<SocketOption, i32>,

    port: Option<Port>,
    gathering_state: IceGatheringState,
    transport_state: TransportState,
    writable: bool,
    receiving: bool,
    selected: Option<ConnectionId>,
    channels: BTreeSet<ChannelId>,
    handshake: Option<Box<dyn HandshakeEngine>>,
    handshake_created: bool,
    closed: bool,
    last_now: Instant,

    events: VecDeque<TransportChannelEvent>,
    reads: VecDeque<DataChannelMessage>,
    writes: VecDeque<SentPacket>,
}

impl TransportChannel {
    /// Creates a channel bound to the calling thread.
    pub fn new(config: TransportChannelConfig) -> Result<Self> {
        let socket_factory = config
            .socket_factory
            .clone()
            .ok_or(Error::ErrSocketFactoryRequired)?;
        let component = validate_component(config.component)?;
        let local_ice = match &config.local_ice_parameters {
            Some(params) => params.clone(),
            None => IceParameters::generate(),
        };
        local_ice.validate_local()?;

        let mut channels = BTreeSet::new();
        channels.insert(SIGNALING_CHANNEL_ID);

        Ok(Self {
            name: config.transport_name.clone(),
            component,
            context: NetworkContext::current(),
            network: config.network.clone(),
            min_port: config.min_port,
            max_port: config.max_port,
            allow_listen: config.allow_listen,
            timeouts: config.timeouts(),
            socket_factory,
            checker: config.checker(),
            engine_factory: config.handshake_engine_factory.clone(),
            handshake_role_convention: config.handshake_role_convention,

            ice_role: config.ice_role,
            tiebreaker: config.ice_tiebreaker.unwrap_or_else(generate_tiebreaker),
            local_ice,
            remote_ice: None,
            pending_remote_candidates: vec![],
            socket_options: HashMap::new(),

            port: None,
            gathering_state: IceGatheringState::New,
            transport_state: TransportState::Init,
            writable: false,
            receiving: false,
            selected: None,
            channels,
            handshake: None,
            handshake_created: false,
            closed: false,
            last_now: Instant::now(),

            events: VecDeque::new(),
            reads: VecDeque::new(),
            writes: VecDeque::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    pub fn context(&self) -> NetworkContext {
        self.context
    }

    pub fn gathering_state(&self) -> IceGatheringState {
        self.gathering_state
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport_state
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn receiving(&self) -> bool {
        self.receiving
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn ice_role(&self) -> IceRole {
        self.ice_role
    }

    pub fn tiebreaker(&self) -> u64 {
        self.tiebreaker
    }

    pub fn local_ice_parameters(&self) -> &IceParameters {
        &self.local_ice
    }

    pub fn remote_ice_parameters(&self) -> Option<&IceParameters> {
        self.remote_ice.as_ref()
    }

    pub fn port(&self) -> Option<&Port> {
        self.port.as_ref()
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        match &self.port {
            Some(port) => port.candidates(),
            None => &[],
        }
    }

    /// The selected connection, if it still exists.
    pub fn selected_connection(&self) -> Option<&Connection> {
        let id = self.selected?;
        self.port.as_ref()?.connection(id)
    }

    /// Local and remote candidate of the selected connection.
    pub fn selected_candidate_pair(&self) -> Option<(Candidate, Candidate)> {
        self.selected_connection().map(|conn| {
            (
                conn.local_candidate().clone(),
                conn.remote_candidate().clone(),
            )
        })
    }

    pub fn is_ready_to_send(&self) -> bool {
        !self.closed && self.selected_connection().is_some_and(|conn| conn.writable())
    }

    pub fn is_channel_open(&self, id: ChannelId) -> bool {
        self.channels.contains(&id)
    }

    /// Open channel ids, the signaling channel included.
    pub fn open_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().copied()
    }

    pub fn handshake_role(&self) -> HandshakeRole {
        self.handshake_role_convention.handshake_role(self.ice_role)
    }

    /// Takes effect for checks sent from now on; a conflict reported by the
    /// peer is resolved by calling this.
    pub fn set_ice_role(&mut self, role: IceRole) {
        self.context.assert_current();
        if self.ice_role == role {
            return;
        }
        info!("[{}]: ICE role {} -> {}", self.name, self.ice_role, role);
        self.ice_role = role;
        if let Some(port) = self.port.as_mut() {
            port.set_ice_role(role);
        }
    }

    pub fn set_ice_tiebreaker(&mut self, tiebreaker: u64) {
        self.context.assert_current();
        self.tiebreaker = tiebreaker;
        if let Some(port) = self.port.as_mut() {
            port.set_tiebreaker(tiebreaker);
        }
    }

    pub fn set_local_ice_parameters(&mut self, params: IceParameters, now: Instant) -> Result<()> {
        self.context.assert_current();
        params.validate_local()?;
        if let Some(port) = self.port.as_mut() {
            port.set_local_ice_parameters(params.clone(), now)?;
        }
        self.local_ice = params;
        Ok(())
    }

    /// Checks made with previous remote credentials are dropped.
    pub fn set_remote_ice_parameters(&mut self, params: IceParameters, now: Instant) -> Result<()> {
        self.context.assert_current();
        params.validate_remote()?;
        if let Some(port) = self.port.as_mut() {
            port.set_remote_ice_parameters(params.clone(), now);
        }
        self.remote_ice = Some(params);
        self.process_port_events(now);
        Ok(())
    }

    /// Builds the port and gathers the local candidate, once.
    pub fn maybe_start_gathering(&mut self, now: Instant) -> Result<()> {
        self.context.assert_current();
        if self.closed {
            return Err(Error::ErrTransportClosed);
        }
        if self.gathering_state != IceGatheringState::New {
            return Ok(());
        }

        let port = match self.create_port() {
            Ok(port) => port,
            Err(err) => {
                // gathering stays New so a later call retries
                warn!("[{}]: failed to gather: {}", self.name, err);
                self.set_transport_state(TransportState::Failed);
                return Err(err);
            }
        };
        self.set_gathering_state(IceGatheringState::Gathering);
        self.port = Some(port);
        self.process_port_events(now);

        for candidate in std::mem::take(&mut self.pending_remote_candidates) {
            self.add_remote_candidate(candidate, now);
        }

        Ok(())
    }

    /// Builds the port with the stored socket options and its host candidate.
    fn create_port(&self) -> Result<Port> {
        let mut port = Port::new(PortConfig {
            port_id: PortId(u64::from(self.component)),
            name: format!("{}:{}", self.name, self.component),
            network: self.network.clone(),
            component: self.component,
            min_port: self.min_port,
            max_port: self.max_port,
            allow_listen: self.allow_listen,
            local_ice: self.local_ice.clone(),
            remote_ice: self.remote_ice.clone(),
            ice_role: self.ice_role,
            tiebreaker: self.tiebreaker,
            timeouts: self.timeouts,
            socket_factory: Rc::clone(&self.socket_factory),
            checker: Rc::clone(&self.checker),
        })?;
        let prepared = self
            .socket_options
            .iter()
            .try_for_each(|(option, value)| port.set_option(*option, *value))
            .and_then(|()| port.prepare_address());
        if let Err(err) = prepared {
            port.destroy();
            return Err(err);
        }
        Ok(port)
    }

    fn set_gathering_state(&mut self, state: IceGatheringState) {
        // gathering never goes backwards
        if state <= self.gathering_state {
            return;
        }
        info!(
            "[{}]: gathering state {} -> {}",
            self.name, self.gathering_state, state
        );
        self.gathering_state = state;
        self.events
            .push_back(TransportChannelEvent::GatheringStateChange(state));
    }

    /// Ignores (with a log) candidates of another component or protocol.
    pub fn add_remote_candidate(&mut self, candidate: Candidate, now: Instant) {
        self.context.assert_current();
        if self.closed {
            return;
        }
        if candidate.component() != self.component {
            warn!(
                "[{}]: ignoring candidate {} of component {}, expected {}",
                self.name,
                candidate,
                candidate.component(),
                self.component
            );
            return;
        }
        if candidate.protocol() != QUIC_PROTOCOL_NAME {
            warn!(
                "[{}]: ignoring candidate {} with protocol {}",
                self.name,
                candidate,
                candidate.protocol()
            );
            return;
        }

        let Some(port) = self.port.as_mut() else {
            debug!(
                "[{}]: keeping candidate {} until gathering starts",
                self.name, candidate
            );
            self.pending_remote_candidates.push(candidate);
            return;
        };
        if port.add_remote_candidate(candidate.clone(), now).is_none() {
            warn!("[{}]: no connection possible to {}", self.name, candidate);
        }
        self.process_port_events(now);
    }

    pub fn remove_remote_candidate(&mut self, candidate: &Candidate, now: Instant) {
        self.context.assert_current();
        self.pending_remote_candidates
            .retain(|pending| !pending.equal(candidate));
        if let Some(port) = self.port.as_mut() {
            port.remove_remote_candidate(candidate);
        }
        self.process_port_events(now);
    }

    pub fn remove_all_remote_candidates(&mut self, now: Instant) {
        self.context.assert_current();
        self.pending_remote_candidates.clear();
        if let Some(port) = self.port.as_mut() {
            port.remove_all_remote_candidates();
        }
        self.process_port_events(now);
    }

    pub fn set_option(&mut self, option: SocketOption, value: i32) -> Result<()> {
        self.context.assert_current();
        self.socket_options.insert(option, value);
        match self.port.as_mut() {
            Some(port) => port.set_option(option, value),
            None => Ok(()),
        }
    }

    pub fn get_option(&self, option: SocketOption) -> Option<i32> {
        self.socket_options.get(&option).copied()
    }

    /// Registers a data channel. The signaling channel is always open.
    pub fn open_channel(&mut self, id: ChannelId) -> Result<()> {
        self.context.assert_current();
        if self.closed {
            return Err(Error::ErrTransportClosed);
        }
        if id < 0 {
            return Err(Error::ErrInvalidChannelId(id));
        }
        if !self.channels.insert(id) {
            return Err(Error::ErrChannelAlreadyOpen(id));
        }
        if shadowed_by_signaling(id) {
            warn!(
                "[{}]: channel {} frames start with a signaling tag, the peer reads them as signaling",
                self.name, id
            );
        }
        debug!("[{}]: opened channel {}", self.name, id);
        Ok(())
    }

    /// Unregisters a data channel; `ChannelClosed` is queued before this
    /// returns.
    pub fn close_channel(&mut self, id: ChannelId) -> Result<()> {
        self.context.assert_current();
        if id == SIGNALING_CHANNEL_ID {
            return Err(Error::ErrInvalidChannelId(id));
        }
        if !self.channels.remove(&id) {
            return Err(Error::ErrChannelNotOpen(id));
        }
        debug!("[{}]: closed channel {}", self.name, id);
        self.events
            .push_back(TransportChannelEvent::ChannelClosed(id));
        Ok(())
    }

    /// Frames `payload` for channel `id` and sends it over the selected
    /// connection, through the handshake engine once there is one.
    pub fn send_data(
        &mut self,
        id: ChannelId,
        params: &SendDataParams,
        payload: &[u8],
        now: Instant,
    ) -> Result<usize> {
        self.context.assert_current();
        if self.closed {
            return Err(Error::ErrTransportClosed);
        }
        if id < 0 {
            return Err(Error::ErrInvalidChannelId(id));
        }
        if !self.channels.contains(&id) {
            return Err(Error::ErrChannelNotOpen(id));
        }
        let max = if id == SIGNALING_CHANNEL_ID {
            MAX_SIGNALING_PAYLOAD_SIZE
        } else {
            MAX_DATA_PAYLOAD_SIZE
        };
        if payload.len() > max {
            return Err(Error::ErrMessageTooLarge {
                size: payload.len(),
                max,
            });
        }
        let selected = self
            .selected_connection()
            .filter(|conn| conn.writable())
            .map(|conn| conn.id())
            .ok_or(Error::ErrNoWritableConnection)?;

        let frame = if id == SIGNALING_CHANNEL_ID {
            SignalingMessage {
                message_type: params.signaling_type,
                payload: BytesMut::from(payload),
            }
            .marshal()?
        } else {
            DataFrame {
                channel_id: id,
                payload: BytesMut::from(payload),
            }
            .marshal()?
        };

        self.last_now = now;
        if let Some(engine) = self.handshake.as_mut() {
            engine.handle_write(&frame, now)?;
            self.flush_handshake(now);
            return Ok(payload.len());
        }

        let result = match self.port.as_mut() {
            Some(port) => port.send(selected, &frame, now),
            None => Err(Error::ErrNoWritableConnection),
        };
        self.process_port_events(now);
        result.map(|_| payload.len())
    }

    fn process_port_events(&mut self, now: Instant) {
        while let Some(event) = self.port.as_mut().and_then(|port| port.poll_event()) {
            match event {
                PortEvent::CandidateGathered(candidate) => {
                    self.events
                        .push_back(TransportChannelEvent::CandidateGathered(candidate));
                }
                PortEvent::PortComplete => {
                    self.set_gathering_state(IceGatheringState::Complete);
                }
                PortEvent::ConnectionCreated(id) => {
                    trace!("[{}]: {} created", self.name, id);
                    self.update_state(now);
                }
                PortEvent::ConnectionStateChange(_) => self.update_state(now),
                PortEvent::ConnectionReadPacket(id, msg) => {
                    self.handle_inbound(id, msg.message, now);
                }
                PortEvent::ConnectionReadyToSend(id) => {
                    if self.selected == Some(id) {
                        self.events.push_back(TransportChannelEvent::ReadyToSend);
                    }
                }
                PortEvent::ConnectionSocketClosed(id) => self.handle_socket_closed(id, now),
                PortEvent::ConnectionReconnecting(id) => {
                    debug!("[{}]: {} reconnecting", self.name, id);
                }
                PortEvent::ConnectionDestroyed(id) => {
                    if self.selected == Some(id) {
                        info!("[{}]: selected {} destroyed", self.name, id);
                        self.selected = None;
                    }
                    self.update_state(now);
                }
                PortEvent::RoleConflict(id, conflict) => {
                    warn!(
                        "[{}]: role conflict on {}, resolved role would be {}",
                        self.name,
                        id,
                        conflict.resolved_role()
                    );
                    self.events
                        .push_back(TransportChannelEvent::RoleConflict(conflict));
                }
            }
        }

        while let Some(packet) = self.port.as_mut().and_then(|port| port.poll_sent_packet()) {
            self.writes.push_back(packet);
        }
    }

    /// An outgoing connection whose socket closed gets one reconnection
    /// per close.
    fn handle_socket_closed(&mut self, id: ConnectionId, now: Instant) {
        let Some(port) = self.port.as_mut() else {
            return;
        };
        let outgoing = port.connection(id).is_some_and(|conn| conn.outgoing());
        if outgoing {
            if let Err(err) = port.reconnect(id, now) {
                warn!("[{}]: failed to reconnect {}: {}", self.name, id, err);
            }
        }
        self.update_state(now);
    }

    /// Keeps the selected connection while it is writable, otherwise moves
    /// to the first writable one. A selection with no alternative stays so
    /// that it can recover.
    fn update_selection(&mut self) {
        let Some(port) = self.port.as_ref() else {
            return;
        };
        let current = self.selected.and_then(|id| port.connection(id));
        if current.is_some_and(|conn| conn.writable()) {
            return;
        }

        let next = port
            .connections()
            .find(|conn| conn.writable() && Some(conn.id()) != self.selected);
        match next {
            Some(conn) => {
                info!("[{}]: selected {}", self.name, conn);
                self.selected = Some(conn.id());
                self.events
                    .push_back(TransportChannelEvent::SelectedCandidatePairChange {
                        local: conn.local_candidate().clone(),
                        remote: conn.remote_candidate().clone(),
                    });
            }
            None if current.is_none() && self.selected.is_some() => {
                self.selected = None;
            }
            None => {}
        }
    }

    fn update_state(&mut self, now: Instant) {
        self.update_selection();

        let (writable, receiving) = match self.selected_connection() {
            Some(conn) => (conn.writable(), conn.receiving()),
            None => (false, false),
        };
        if writable != self.writable {
            self.writable = writable;
            self.events
                .push_back(TransportChannelEvent::WritableStateChange(writable));
            if writable {
                self.events.push_back(TransportChannelEvent::ReadyToSend);
            }
        }
        if receiving != self.receiving {
            self.receiving = receiving;
            self.events
                .push_back(TransportChannelEvent::ReceivingStateChange(receiving));
        }

        let all_failed = self.port.as_ref().is_some_and(|port| {
            let mut connections = port.connections().peekable();
            connections.peek().is_some()
                && connections.all(|conn| {
                    conn.pair_state() == CandidatePairState::Failed
                        && !conn.writable()
                })
        });
        let state = if self.selected.is_some() {
            match (writable, receiving) {
                (true, true) => TransportState::Completed,
                (true, false) => TransportState::Connecting,
                _ => TransportState::Failed,
            }
        } else if all_failed || self.transport_state != TransportState::Init {
            // lost the selection, or nothing ever worked out
            TransportState::Failed
        } else {
            TransportState::Init
        };
        self.set_transport_state(state);

        self.maybe_start_handshake(now);
    }

    fn set_transport_state(&mut self, state: TransportState) {
        if state == self.transport_state {
            return;
        }
        // Completed is only ever entered from Connecting
        if state == TransportState::Completed && self.transport_state != TransportState::Connecting
        {
            self.set_transport_state(TransportState::Connecting);
        }
        info!(
            "[{}]: transport state {} -> {}",
            self.name, self.transport_state, state
        );
        self.transport_state = state;
        self.events
            .push_back(TransportChannelEvent::TransportStateChange(state));
    }

    /// Creates the handshake engine the first time the selected connection
    /// is writable. Never retried.
    fn maybe_start_handshake(&mut self, now: Instant) {
        if self.handshake_created || self.closed {
            return;
        }
        let Some(factory) = self.engine_factory.as_ref().map(Rc::clone) else {
            return;
        };
        let Some((local, remote)) = self
            .selected_connection()
            .filter(|conn| conn.writable())
            .map(|conn| {
                (
                    conn.local_candidate().address(),
                    conn.remote_candidate().address(),
                )
            })
        else {
            return;
        };

        self.handshake_created = true;
        let role = self.handshake_role();
        info!(
            "[{}]: starting handshake as {} over {} -> {}",
            self.name, role, local, remote
        );
        match factory.create_engine(role, local, remote) {
            Ok(mut engine) => {
                if let Err(err) = engine.start(now) {
                    warn!("[{}]: handshake start failed: {}", self.name, err);
                }
                self.handshake = Some(engine);
                self.flush_handshake(now);
            }
            Err(err) => warn!("[{}]: failed to create handshake engine: {}", self.name, err),
        }
    }

    /// Moves whatever the engine produced: datagrams to the selected
    /// connection, application bytes to the dispatcher, events upward.
    fn flush_handshake(&mut self, now: Instant) {
        let Some(engine) = self.handshake.as_mut() else {
            return;
        };
        let mut datagrams = vec![];
        while let Some(datagram) = engine.poll_write() {
            datagrams.push(datagram);
        }
        let mut plaintexts = vec![];
        while let Some(plaintext) = engine.poll_read() {
            plaintexts.push(plaintext);
        }
        let mut closed = false;
        while let Some(event) = engine.poll_event() {
            match event {
                HandshakeEvent::Ready => {
                    info!("[{}]: handshake ready", self.name);
                    self.events.push_back(TransportChannelEvent::HandshakeReady);
                }
                HandshakeEvent::Closed(reason) => {
                    info!("[{}]: handshake closed: {:?}", self.name, reason);
                    self.events
                        .push_back(TransportChannelEvent::HandshakeClosed(reason));
                    closed = true;
                }
            }
        }
        if closed {
            self.handshake = None;
        }

        if let (Some(id), Some(port)) = (self.selected, self.port.as_mut()) {
            for datagram in datagrams {
                if let Err(err) = port.send(id, &datagram, now) {
                    debug!("[{}]: handshake send failed: {}", self.name, err);
                }
            }
        }
        for plaintext in plaintexts {
            self.dispatch_application(plaintext);
        }
        self.process_port_events(now);
    }

    /// Inbound non-check datagram of any connection: the engine has the
    /// first look, then signaling, then data frames.
    fn handle_inbound(&mut self, id: ConnectionId, datagram: BytesMut, now: Instant) {
        if let Some(engine) = self.handshake.as_mut() {
            match engine.handle_read(&datagram, now) {
                Ok(HandshakeRead::Consumed) => {
                    self.flush_handshake(now);
                    return;
                }
                Ok(HandshakeRead::NotHandshake) => {}
                Err(err) => {
                    warn!(
                        "[{}]: handshake rejected {} bytes from {}: {}",
                        self.name,
                        datagram.len(),
                        id,
                        err
                    );
                    return;
                }
            }
        }
        self.dispatch_application(datagram);
    }

    fn dispatch_application(&mut self, datagram: BytesMut) {
        match classify(&datagram) {
            Ok(Frame::Signaling(message)) => self.handle_signaling(message),
            Ok(Frame::Data(frame)) => {
                if frame.channel_id == SIGNALING_CHANNEL_ID || frame.channel_id < 0 {
                    warn!(
                        "[{}]: discarding data frame for channel {}",
                        self.name, frame.channel_id
                    );
                    return;
                }
                if self.channels.insert(frame.channel_id) {
                    debug!(
                        "[{}]: channel {} opened by the remote side",
                        self.name, frame.channel_id
                    );
                }
                self.reads.push_back(DataChannelMessage {
                    channel_id: frame.channel_id,
                    params: SendDataParams::default(),
                    payload: frame.payload,
                });
            }
            Err(err) => {
                warn!(
                    "[{}]: discarding {} bytes: {}",
                    self.name,
                    datagram.len(),
                    err
                );
            }
        }
    }

    /// Candidate messages are applied, every message is reported.
    fn handle_signaling(&mut self, message: SignalingMessage) {
        trace!(
            "[{}]: signaling {} with {} bytes",
            self.name,
            message.message_type,
            message.payload.len()
        );
        let now = self.last_now;
        match message.message_type {
            SignalingMessageType::CandidateAdd | SignalingMessageType::CandidateRemove => {
                match parse_candidate_payload(&message.payload) {
                    Ok(candidate) => {
                        if message.message_type == SignalingMessageType::CandidateAdd {
                            self.add_remote_candidate(candidate, now);
                        } else {
                            self.remove_remote_candidate(&candidate, now);
                        }
                    }
                    Err(err) => warn!(
                        "[{}]: bad candidate in {} message: {}",
                        self.name, message.message_type, err
                    ),
                }
            }
            SignalingMessageType::Offer | SignalingMessageType::Answer => {}
        }
        self.events
            .push_back(TransportChannelEvent::SignalingMessage(message));
    }

    /// Closes every data channel, the handshake engine and the port.
    /// Nothing fires afterwards.
    pub(crate) fn shutdown(&mut self) -> Result<()> {
        self.context.assert_current();
        if self.closed {
            return Ok(());
        }
        info!("[{}]: closing", self.name);

        let open: Vec<ChannelId> = self
            .channels
            .iter()
            .copied()
            .filter(|id| *id != SIGNALING_CHANNEL_ID)
            .collect();
        for id in open {
            self.close_channel(id)?;
        }

        let mut result = Ok(());
        if let Some(mut engine) = self.handshake.take() {
            result = engine.close();
        }
        if let Some(port) = self.port.as_mut() {
            port.destroy();
        }
        self.selected = None;
        self.writable = false;
        self.receiving = false;
        self.closed = true;
        self.reads.clear();
        result
    }
}

fn parse_candidate_payload(payload: &[u8]) -> Result<Candidate> {
    let raw = String::from_utf8(payload.to_vec())?;
    unmarshal_candidate(raw.trim())
}
