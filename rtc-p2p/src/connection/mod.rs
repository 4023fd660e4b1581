
use bytes::BytesMut;
use log::{debug, info, trace, warn};
use serde::Serialize;
use shared::TaggedBytesMut;
use shared::error::{Error, ErrorKind, Result};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::candidate::Candidate;
use crate::checker::{CheckMessage, CheckRequest, ROLE_CONFLICT_ERROR_CODE, TransactionId};
use crate::ice::{IceRole, RoleConflict};
use crate::port::{PortContext, PortId};
use crate::socket::{PacketSocket, SentPacket, SocketEvent, SocketId, SocketOption};

/// The interval at which connectivity checks are sent while a pair is not writable.
pub(crate) const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// The interval used to keep a writable pair alive.
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(480);

/// Silence after which a pair is no longer receiving.
pub(crate) const DEFAULT_RECEIVING_TIMEOUT: Duration = Duration::from_millis(2500);

/// Max binding request before considering a pair failed.
pub(crate) const DEFAULT_MAX_BINDING_REQUESTS: u16 = 7;

/// Grace period of a reconnection, and the time without responses after
/// which a writable pair becomes unreliable.
pub(crate) const CONNECTION_WRITE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Unanswered checks needed before a writable pair can degrade.
pub(crate) const CONNECTION_WRITE_CONNECT_FAILURES: u16 = 5;

/// Time without responses after which a writable pair times out.
pub(crate) const CONNECTION_WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Wait time before binding requests can be deleted.
pub(crate) const MAX_BINDING_REQUEST_TIMEOUT: Duration = Duration::from_millis(4000);

/// Timers of a connection, shared by every connection of a port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    pub check_interval: Duration,
    pub keepalive_interval: Duration,
    pub receiving_timeout: Duration,
    pub max_binding_requests: u16,
    pub reconnection_timeout: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            receiving_timeout: DEFAULT_RECEIVING_TIMEOUT,
            max_binding_requests: DEFAULT_MAX_BINDING_REQUESTS,
            reconnection_timeout: CONNECTION_WRITE_CONNECT_TIMEOUT,
        }
    }
}

/// Identity of a connection within its port, never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Whether the pair has confirmed that it can send.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WriteState {
    /// No response received yet.
    #[default]
    Init,
    /// A check round trip succeeded recently.
    Writable,
    /// Checks are going unanswered for a while.
    WriteUnreliable,
    /// Checks have gone unanswered for too long, or the socket closed.
    WriteTimeout,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Init => "init",
            Self::Writable => "writable",
            Self::WriteUnreliable => "write-unreliable",
            Self::WriteTimeout => "write-timeout",
        };
        write!(f, "{s}")
    }
}

/// Represent the ICE candidate pair state.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidatePairState {
    /// Means a check has not been performed for this pair.
    #[default]
    #[serde(rename = "waiting")]
    Waiting,

    /// Means a check has been sent for this pair, but the transaction is in progress.
    #[serde(rename = "in-progress")]
    InProgress,

    /// Means a check for this pair was already done and failed, either never producing any response
    /// or producing an unrecoverable failure response.
    #[serde(rename = "failed")]
    Failed,

    /// Means a check for this pair was already done and produced a successful result.
    #[serde(rename = "succeeded")]
    Succeeded,
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        };

        write!(f, "{s}")
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_discarded: u64,
    pub checks_sent: u64,
    pub reconnects: u32,
}

/// Something the owning port must react to.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Write state, receiving, connected or pair state changed.
    StateChange,
    /// A datagram that is not a connectivity check.
    ReadPacket(TaggedBytesMut),
    ReadyToSend,
    SocketClosed,
    Reconnecting,
    RoleConflict(RoleConflict),
}

struct BindingRequest {
    transaction_id: TransactionId,
    sent_at: Instant,
    generation: u64,
}

#[derive(PartialEq, Eq)]
struct Status {
    write_state: WriteState,
    pair_state: CandidatePairState,
    receiving: bool,
    connected: bool,
    pretending_writable: bool,
}

/// One candidate pair and the socket that carries it.
pub struct Connection {
    id: ConnectionId,
    port_id: PortId,
    name: String,
    local_candidate: Candidate,
    remote_candidate: Candidate,
    socket: Option<Box<dyn PacketSocket>>,
    outgoing: bool,
    receiving_timeout: Duration,

    write_state: WriteState,
    pair_state: CandidatePairState,
    connected: bool,
    receiving: bool,
    error: Option<ErrorKind>,

    last_send: Option<Instant>,
    last_received: Option<Instant>,
    last_ping_sent: Option<Instant>,
    last_ping_response: Option<Instant>,
    rtt: Option<Duration>,
    stats: ConnectionStats,

    reconnection_pending: bool,
    pretending_writable: bool,
    reconnect_deadline: Option<Instant>,

    // bumped on reconnect and destroy; requests of an older generation are stale
    generation: u64,
    pending_requests: Vec<BindingRequest>,
    unanswered_pings: u16,
    next_ping: Option<Instant>,
    destroyed: bool,

    events: VecDeque<ConnectionEvent>,
    sent_packets: VecDeque<SentPacket>,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} {} {}",
            self.id,
            self.local_candidate.address(),
            self.remote_candidate.address(),
            self.write_state,
            self.pair_state,
        )
    }
}

impl Connection {
    /// An incoming connection adopts `socket`; an outgoing one (no socket)
    /// opens its own on its first check.
    pub(crate) fn new(
        id: ConnectionId,
        ctx: &PortContext,
        local_candidate: Candidate,
        remote_candidate: Candidate,
        socket: Option<Box<dyn PacketSocket>>,
    ) -> Self {
        let outgoing = socket.is_none();
        Self {
            id,
            port_id: ctx.port_id,
            name: format!("{}:{}", ctx.name, id),
            local_candidate,
            remote_candidate,
            connected: socket.is_some(),
            socket,
            outgoing,
            receiving_timeout: ctx.timeouts.receiving_timeout,

            write_state: WriteState::Init,
            pair_state: CandidatePairState::Waiting,
            receiving: false,
            error: None,

            last_send: None,
            last_received: None,
            last_ping_sent: None,
            last_ping_response: None,
            rtt: None,
            stats: ConnectionStats::default(),

            reconnection_pending: false,
            pretending_writable: false,
            reconnect_deadline: None,

            generation: 0,
            pending_requests: vec![],
            unanswered_pings: 0,
            next_ping: None,
            destroyed: false,

            events: VecDeque::new(),
            sent_packets: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_candidate(&self) -> &Candidate {
        &self.local_candidate
    }

    pub fn remote_candidate(&self) -> &Candidate {
        &self.remote_candidate
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket.as_ref().map(|socket| socket.id())
    }

    pub fn outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    pub fn pair_state(&self) -> CandidatePairState {
        self.pair_state
    }

    /// True once a check round trip succeeded, and while a reconnection
    /// is still inside its grace period.
    pub fn writable(&self) -> bool {
        self.write_state == WriteState::Writable || self.pretending_writable
    }

    pub fn receiving(&self) -> bool {
        self.receiving
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    pub fn reconnection_pending(&self) -> bool {
        self.reconnection_pending
    }

    pub fn pretending_writable(&self) -> bool {
        self.pretending_writable
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn last_received(&self) -> Option<Instant> {
        self.last_received
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub(crate) fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    pub(crate) fn poll_sent_packet(&mut self) -> Option<SentPacket> {
        self.sent_packets.pop_front()
    }

    pub(crate) fn set_socket_option(&mut self, option: SocketOption, value: i32) -> Result<()> {
        match self.socket.as_mut() {
            Some(socket) => socket.set_option(option, value),
            None => Ok(()),
        }
    }

    fn check_port(&self, ctx: &PortContext) {
        debug_assert_eq!(
            self.port_id, ctx.port_id,
            "{} used with a port it does not belong to",
            self.name
        );
    }

    fn status(&self) -> Status {
        Status {
            write_state: self.write_state,
            pair_state: self.pair_state,
            receiving: self.receiving,
            connected: self.connected,
            pretending_writable: self.pretending_writable,
        }
    }

    fn emit_if_changed(&mut self, before: Status) {
        if self.status() != before {
            trace!("[{}]: state changed: {}", self.name, self);
            self.events.push_back(ConnectionEvent::StateChange);
        }
    }

    /// Starts connectivity checks. Needs the remote ICE parameters.
    pub(crate) fn start(&mut self, ctx: &PortContext, now: Instant) {
        self.check_port(ctx);
        if self.destroyed || ctx.remote_ice.is_none() {
            return;
        }
        if self.next_ping.is_none() {
            self.next_ping = Some(now);
        }
    }

    /// Drops in-flight checks, e.g. when the remote credentials changed,
    /// and checks again right away.
    pub(crate) fn restart_checks(&mut self, ctx: &PortContext, now: Instant) {
        self.pending_requests.clear();
        self.unanswered_pings = 0;
        self.next_ping = None;
        self.start(ctx, now);
    }

    /// Sends application data over the pair.
    ///
    /// Write state is not consulted, a pretending-writable pair sends over
    /// its new socket.
    pub fn send(&mut self, ctx: &PortContext, data: &[u8], now: Instant) -> Result<usize> {
        self.check_port(ctx);
        if self.socket.is_none() || self.destroyed {
            self.error = Some(ErrorKind::Unreachable);
            return Err(Error::ErrNoSocket);
        }
        if !self.connected {
            self.error = Some(ErrorKind::NotConnected);
            self.maybe_reconnect(ctx, now);
            return Err(Error::ErrNotConnected);
        }

        let Some(socket) = self.socket.as_mut() else {
            return Err(Error::ErrNoSocket);
        };
        match socket.send(data, now) {
            Ok(n) => {
                self.stats.bytes_sent += n as u64;
                self.stats.packets_sent += 1;
                self.last_send = Some(now);
                self.sent_packets.push_back(SentPacket {
                    socket_id: socket.id(),
                    size: n,
                    send_time: now,
                });
                Ok(n)
            }
            Err(err) => {
                self.stats.packets_discarded += 1;
                self.error = Some(err.kind());
                debug!("[{}]: send of {} bytes failed: {}", self.name, data.len(), err);
                Err(err)
            }
        }
    }

    fn maybe_reconnect(&mut self, ctx: &PortContext, now: Instant) -> bool {
        if !self.outgoing || self.reconnection_pending || self.socket.is_none() {
            return false;
        }
        match self.reconnect(ctx, now) {
            Ok(()) => true,
            Err(err) => {
                warn!("[{}]: reconnect failed: {}", self.name, err);
                false
            }
        }
    }

    /// Replaces the socket of an outgoing connection with a fresh one on a
    /// new local port and pretends to stay writable until the new socket
    /// answers a check or the reconnection timeout expires.
    pub fn reconnect(&mut self, ctx: &PortContext, now: Instant) -> Result<()> {
        self.check_port(ctx);
        if !self.outgoing {
            return Err(Error::ErrReconnectIncoming);
        }
        if self.reconnection_pending {
            return Err(Error::ErrReconnectionPending);
        }

        // the new socket is bound before the old one is released
        let socket = match self.open_socket(ctx) {
            Ok(socket) => socket,
            Err(err) => {
                self.error = Some(err.kind());
                return Err(err);
            }
        };
        let before = self.status();
        if let Some(mut old) = self.socket.replace(socket) {
            old.close();
        }

        self.generation += 1;
        self.pending_requests.clear();
        self.unanswered_pings = 0;
        self.connected = true;
        self.reconnection_pending = true;
        self.pretending_writable = true;
        self.reconnect_deadline = Some(now + ctx.timeouts.reconnection_timeout);
        self.pair_state = CandidatePairState::InProgress;
        self.stats.reconnects += 1;

        info!(
            "[{}]: reconnecting from {:?}, pretending writable for {:?}",
            self.name,
            self.socket.as_ref().map(|socket| socket.local_addr()),
            ctx.timeouts.reconnection_timeout
        );
        self.events.push_back(ConnectionEvent::Reconnecting);
        self.emit_if_changed(before);

        if let Err(err) = self.ping(ctx, now) {
            warn!("[{}]: check after reconnect failed: {}", self.name, err);
        }
        self.next_ping = Some(now + ctx.timeouts.check_interval);

        Ok(())
    }

    fn open_socket(&self, ctx: &PortContext) -> Result<Box<dyn PacketSocket>> {
        let local_ip = self.local_candidate.address().ip();
        let mut socket =
            ctx.socket_factory
                .create_udp_socket(local_ip, ctx.min_port, ctx.max_port)?;
        for (option, value) in &ctx.socket_options {
            if let Err(err) = socket.set_option(*option, *value) {
                debug!("[{}]: failed to set {:?}: {}", self.name, option, err);
            }
        }
        socket.connect(self.remote_candidate.address())?;
        Ok(socket)
    }

    fn ensure_socket(&mut self, ctx: &PortContext) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        match self.open_socket(ctx) {
            Ok(socket) => {
                debug!(
                    "[{}]: opened {} at {}",
                    self.name,
                    socket.id(),
                    socket.local_addr()
                );
                self.socket = Some(socket);
                self.connected = true;
                Ok(())
            }
            Err(err) => {
                let before = self.status();
                self.error = Some(err.kind());
                self.write_state = WriteState::WriteTimeout;
                self.pair_state = CandidatePairState::Failed;
                self.emit_if_changed(before);
                Err(err)
            }
        }
    }

    /// Sends a connectivity check.
    pub(crate) fn ping(&mut self, ctx: &PortContext, now: Instant) -> Result<()> {
        let Some(remote_ice) = ctx.remote_ice.as_ref() else {
            return Err(Error::ErrRemoteIceParametersNotSet);
        };
        self.ensure_socket(ctx)?;

        let username = format!("{}:{}", remote_ice.ufrag, ctx.local_ice.ufrag);
        let (transaction_id, raw) = ctx.checker.build_request(&CheckRequest {
            username: &username,
            password: &remote_ice.pwd,
            role: ctx.ice_role,
            tiebreaker: ctx.tiebreaker,
            priority: self.local_candidate.priority(),
            use_candidate: ctx.ice_role == IceRole::Controlling,
        })?;
        self.write_check(&raw, now)?;

        trace!("[{}]: ping {:?}", self.name, transaction_id);
        self.pending_requests.push(BindingRequest {
            transaction_id,
            sent_at: now,
            generation: self.generation,
        });
        self.unanswered_pings += 1;
        self.last_ping_sent = Some(now);
        self.stats.checks_sent += 1;
        if self.pair_state == CandidatePairState::Waiting {
            self.pair_state = CandidatePairState::InProgress;
        }

        Ok(())
    }

    fn write_check(&mut self, raw: &[u8], now: Instant) -> Result<()> {
        if !self.connected {
            return Err(Error::ErrNotConnected);
        }
        let socket = self.socket.as_mut().ok_or(Error::ErrNoSocket)?;
        socket.send(raw, now)?;
        Ok(())
    }

    /// Dispatches an event of the socket this connection owns.
    pub(crate) fn handle_socket_event(
        &mut self,
        ctx: &PortContext,
        event: SocketEvent,
        now: Instant,
    ) {
        match event {
            SocketEvent::Read(msg) => self.handle_read(ctx, msg, now),
            SocketEvent::ReadyToSend => self.events.push_back(ConnectionEvent::ReadyToSend),
            SocketEvent::Closed(reason) => self.handle_socket_closed(reason),
            SocketEvent::NewConnection(mut socket) => {
                warn!(
                    "[{}]: unexpected accepted {} on a connection socket",
                    self.name,
                    socket.id()
                );
                socket.close();
            }
        }
    }

    /// Takes an inbound datagram: checks are answered here, everything else
    /// is passed upward regardless of write state.
    pub(crate) fn handle_read(&mut self, ctx: &PortContext, msg: TaggedBytesMut, now: Instant) {
        self.check_port(ctx);
        if self.destroyed {
            return;
        }

        if ctx.checker.is_check_message(&msg.message) {
            self.handle_check_message(ctx, &msg.message, now);
            return;
        }

        self.stats.bytes_received += msg.message.len() as u64;
        self.stats.packets_received += 1;
        self.mark_received(now);
        self.events.push_back(ConnectionEvent::ReadPacket(msg));
    }

    fn mark_received(&mut self, now: Instant) {
        self.last_received = Some(now);
        if !self.receiving {
            let before = self.status();
            self.receiving = true;
            self.emit_if_changed(before);
        }
    }

    fn handle_check_message(&mut self, ctx: &PortContext, raw: &BytesMut, now: Instant) {
        let message = match ctx.checker.parse(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!("[{}]: discarding malformed check: {}", self.name, err);
                return;
            }
        };

        match message {
            CheckMessage::Request {
                transaction_id,
                username,
                role,
                ..
            } => self.handle_binding_request(ctx, raw, transaction_id, &username, role, now),
            CheckMessage::SuccessResponse { transaction_id, .. } => {
                self.handle_success_response(ctx, raw, transaction_id, now)
            }
            CheckMessage::ErrorResponse {
                transaction_id,
                code,
                reason,
            } => {
                self.pending_requests
                    .retain(|r| r.transaction_id != transaction_id);
                if code == ROLE_CONFLICT_ERROR_CODE {
                    warn!("[{}]: peer reported a role conflict", self.name);
                } else {
                    warn!("[{}]: check failed: {} {}", self.name, code, reason);
                }
            }
            CheckMessage::Indication { .. } => self.mark_received(now),
        }
    }

    fn handle_binding_request(
        &mut self,
        ctx: &PortContext,
        raw: &[u8],
        transaction_id: TransactionId,
        username: &str,
        role: Option<(IceRole, u64)>,
        now: Instant,
    ) {
        if !username_matches(ctx, username) {
            warn!("[{}]: discarding check for username {}", self.name, username);
            return;
        }
        if let Err(err) = ctx.checker.verify(raw, &ctx.local_ice.pwd) {
            warn!("[{}]: discarding unauthenticated check: {}", self.name, err);
            return;
        }
        self.mark_received(now);

        if let Some((remote_role, remote_tiebreaker)) = role {
            if remote_role == ctx.ice_role {
                let conflict = RoleConflict {
                    local_role: ctx.ice_role,
                    local_tiebreaker: ctx.tiebreaker,
                    remote_tiebreaker,
                };
                warn!(
                    "[{}]: role conflict, both {}, local wins: {}",
                    self.name,
                    ctx.ice_role,
                    conflict.local_wins()
                );
                self.events.push_back(ConnectionEvent::RoleConflict(conflict));

                // whoever keeps its claim tells the other side to switch
                let keep_claim = match ctx.ice_role {
                    IceRole::Controlling => conflict.local_wins(),
                    IceRole::Controlled => !conflict.local_wins(),
                };
                if keep_claim {
                    self.respond(
                        ctx.checker.build_error_response(
                            transaction_id,
                            ROLE_CONFLICT_ERROR_CODE,
                            "Role Conflict",
                            &ctx.local_ice.pwd,
                        ),
                        now,
                    );
                    return;
                }
            }
        }

        let Some(peer_addr) = self
            .socket
            .as_ref()
            .and_then(|socket| socket.remote_addr())
        else {
            return;
        };
        self.respond(
            ctx.checker
                .build_success_response(transaction_id, peer_addr, &ctx.local_ice.pwd),
            now,
        );

        // triggered check
        if self.write_state != WriteState::Writable && self.pending_requests.is_empty() {
            if let Err(err) = self.ping(ctx, now) {
                debug!("[{}]: triggered check failed: {}", self.name, err);
            }
        }
    }

    fn respond(&mut self, response: Result<BytesMut>, now: Instant) {
        let result = response.and_then(|raw| self.write_check(&raw, now));
        if let Err(err) = result {
            debug!("[{}]: failed to answer check: {}", self.name, err);
        }
    }

    fn handle_success_response(
        &mut self,
        ctx: &PortContext,
        raw: &[u8],
        transaction_id: TransactionId,
        now: Instant,
    ) {
        let Some(pos) = self
            .pending_requests
            .iter()
            .position(|r| r.transaction_id == transaction_id)
        else {
            trace!(
                "[{}]: discarding response to unknown transaction {:?}",
                self.name, transaction_id
            );
            return;
        };
        let request = self.pending_requests.remove(pos);
        if request.generation != self.generation {
            return;
        }
        if let Some(remote_ice) = ctx.remote_ice.as_ref() {
            if let Err(err) = ctx.checker.verify(raw, &remote_ice.pwd) {
                warn!("[{}]: discarding unauthenticated response: {}", self.name, err);
                return;
            }
        }

        let before = self.status();
        self.mark_received(now);
        self.rtt = Some(now.saturating_duration_since(request.sent_at));
        self.last_ping_response = Some(now);
        self.unanswered_pings = 0;
        self.pair_state = CandidatePairState::Succeeded;
        self.write_state = WriteState::Writable;
        if self.reconnection_pending {
            info!("[{}]: reconnected", self.name);
            self.reconnection_pending = false;
            self.pretending_writable = false;
            self.reconnect_deadline = None;
        }
        self.emit_if_changed(before);
    }

    /// Socket closure is terminal for the current socket; retrying is up to
    /// the caller through [`Connection::reconnect`].
    pub(crate) fn handle_socket_closed(&mut self, reason: Option<String>) {
        if self.destroyed {
            return;
        }
        warn!("[{}]: socket closed: {:?}", self.name, reason);
        let before = self.status();
        self.connected = false;
        self.write_state = WriteState::WriteTimeout;
        self.pair_state = CandidatePairState::Failed;
        self.error = Some(ErrorKind::NotConnected);
        self.reconnection_pending = false;
        self.pretending_writable = false;
        self.reconnect_deadline = None;
        self.pending_requests.clear();
        self.events.push_back(ConnectionEvent::SocketClosed);
        self.emit_if_changed(before);
    }

    pub(crate) fn handle_timeout(&mut self, ctx: &PortContext, now: Instant) {
        self.check_port(ctx);
        if self.destroyed {
            return;
        }
        let before = self.status();

        self.pending_requests
            .retain(|r| now.saturating_duration_since(r.sent_at) < MAX_BINDING_REQUEST_TIMEOUT);

        if let Some(deadline) = self.reconnect_deadline {
            if now >= deadline {
                self.reconnect_deadline = None;
                if self.write_state != WriteState::Writable {
                    warn!("[{}]: reconnection timed out", self.name);
                    self.reconnection_pending = false;
                    self.pretending_writable = false;
                }
            }
        }

        if self.receiving {
            let silent = self
                .last_received
                .is_none_or(|t| now.saturating_duration_since(t) >= ctx.timeouts.receiving_timeout);
            if silent {
                self.receiving = false;
            }
        }

        match self.write_state {
            WriteState::Writable | WriteState::WriteUnreliable => {
                let since_response = self
                    .last_ping_response
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                if self.unanswered_pings >= CONNECTION_WRITE_CONNECT_FAILURES {
                    if since_response >= CONNECTION_WRITE_TIMEOUT {
                        self.write_state = WriteState::WriteTimeout;
                        self.pair_state = CandidatePairState::Failed;
                    } else if since_response >= CONNECTION_WRITE_CONNECT_TIMEOUT {
                        self.write_state = WriteState::WriteUnreliable;
                    }
                }
            }
            WriteState::Init => {
                if self.unanswered_pings >= ctx.timeouts.max_binding_requests
                    && !self.pretending_writable
                {
                    self.write_state = WriteState::WriteTimeout;
                    self.pair_state = CandidatePairState::Failed;
                }
            }
            WriteState::WriteTimeout => {}
        }

        self.emit_if_changed(before);

        if let Some(next_ping) = self.next_ping {
            if now >= next_ping {
                // a closed socket is not pinged, reconnecting is the way back
                if self.connected || self.socket.is_none() {
                    if let Err(err) = self.ping(ctx, now) {
                        debug!("[{}]: check failed: {}", self.name, err);
                    }
                }
                let interval = if self.write_state == WriteState::Writable {
                    ctx.timeouts.keepalive_interval
                } else {
                    ctx.timeouts.check_interval
                };
                self.next_ping = Some(now + interval);
            }
        }
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        if self.destroyed {
            return None;
        }
        let receiving_deadline = if self.receiving {
            self.last_received.map(|t| t + self.receiving_timeout)
        } else {
            None
        };
        let request_expiry = self
            .pending_requests
            .iter()
            .map(|r| r.sent_at + MAX_BINDING_REQUEST_TIMEOUT)
            .min();

        [
            self.next_ping,
            self.reconnect_deadline,
            receiving_deadline,
            request_expiry,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Releases the socket and invalidates every pending timer.
    pub(crate) fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        debug!("[{}]: destroyed", self.name);
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
        self.destroyed = true;
        self.connected = false;
        self.generation += 1;
        self.pending_requests.clear();
        self.next_ping = None;
        self.reconnect_deadline = None;
        self.reconnection_pending = false;
        self.pretending_writable = false;
        self.events.clear();
    }
}

/// Requests must be addressed to `local_ufrag:remote_ufrag`.
pub(crate) fn username_matches(ctx: &PortContext, username: &str) -> bool {
    let Some((local, remote)) = username.split_once(':') else {
        return false;
    };
    if local != ctx.local_ice.ufrag {
        return false;
    }
    match ctx.remote_ice.as_ref() {
        Some(remote_ice) => remote == remote_ice.ufrag,
        None => true,
    }
}
