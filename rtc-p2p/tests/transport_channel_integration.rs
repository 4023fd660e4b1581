//! Integration tests for rtc-p2p
//!
//! Two transport channels share one in-memory network. Time only moves when
//! a test advances it, so every run takes the same path.

use bytes::BytesMut;
use rtc_p2p::handshake::{
    HandshakeEngine, HandshakeEngineFactory, HandshakeEvent, HandshakeRead, HandshakeRole,
    HandshakeRoleConvention,
};
use rtc_p2p::ice::{IceRole, TransportState};
use rtc_p2p::message::{ChannelId, SignalingMessage, SignalingMessageType};
use rtc_p2p::socket::Network;
use rtc_p2p::vnet::VirtualNetwork;
use rtc_p2p::{
    DataChannelMessage, SendDataParams, SentPacket, TransportChannel, TransportChannelConfig,
    TransportChannelEvent,
};
use sansio::Protocol;
use shared::error::{Error, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(10);

struct Peer {
    host: IpAddr,
    channel: TransportChannel,
    events: Vec<TransportChannelEvent>,
    sent: Vec<SentPacket>,
}

impl Peer {
    fn new(
        net: &VirtualNetwork,
        host: &str,
        role: IceRole,
        tiebreaker: u64,
        convention: HandshakeRoleConvention,
        factory: Option<Rc<MockEngineFactory>>,
    ) -> Result<Self> {
        let host: IpAddr = host.parse()?;
        let channel = TransportChannel::new(TransportChannelConfig {
            transport_name: format!("peer-{host}"),
            ice_role: role,
            ice_tiebreaker: Some(tiebreaker),
            network: Network::new("eth0", 1, vec![host]),
            handshake_role_convention: convention,
            socket_factory: Some(Rc::new(net.clone())),
            handshake_engine_factory: factory
                .map(|factory| factory as Rc<dyn HandshakeEngineFactory>),
            ..Default::default()
        })?;
        Ok(Self {
            host,
            channel,
            events: vec![],
            sent: vec![],
        })
    }

    fn simple(net: &VirtualNetwork, host: &str, role: IceRole, tiebreaker: u64) -> Result<Self> {
        Self::new(
            net,
            host,
            role,
            tiebreaker,
            HandshakeRoleConvention::default(),
            None,
        )
    }

    fn drain(&mut self) {
        while let Some(event) = self.channel.poll_event() {
            self.events.push(event);
        }
        while let Some(packet) = self.channel.poll_write() {
            self.sent.push(packet);
        }
    }

    fn completed(&self) -> bool {
        self.channel.transport_state() == TransportState::Completed
    }

    fn has_event(&self, event: &TransportChannelEvent) -> bool {
        self.events.contains(event)
    }
}

/// Hands every queued socket event to the peer living on its host.
fn deliver(net: &VirtualNetwork, a: &mut Peer, b: &mut Peer) -> Result<()> {
    while let Some((host, msg)) = net.poll_delivery() {
        if host == a.host {
            a.channel.handle_read(msg)?;
        } else if host == b.host {
            b.channel.handle_read(msg)?;
        }
    }
    a.drain();
    b.drain();
    Ok(())
}

fn step(net: &VirtualNetwork, a: &mut Peer, b: &mut Peer, now: Instant) -> Result<()> {
    a.channel.handle_timeout(now)?;
    b.channel.handle_timeout(now)?;
    deliver(net, a, b)
}

fn run_until(
    net: &VirtualNetwork,
    a: &mut Peer,
    b: &mut Peer,
    now: &mut Instant,
    limit: Duration,
    done: impl Fn(&Peer, &Peer) -> bool,
) -> Result<bool> {
    let deadline = *now + limit;
    while *now < deadline {
        step(net, a, b, *now)?;
        if done(a, b) {
            return Ok(true);
        }
        *now += TICK;
    }
    Ok(false)
}

/// Gathers on both sides, swaps credentials and gives `a` the candidate of
/// `b`; `b` learns `a` from its checks.
fn start(net: &VirtualNetwork, a: &mut Peer, b: &mut Peer, now: Instant) -> Result<()> {
    a.channel.maybe_start_gathering(now)?;
    b.channel.maybe_start_gathering(now)?;
    a.channel
        .set_remote_ice_parameters(b.channel.local_ice_parameters().clone(), now)?;
    b.channel
        .set_remote_ice_parameters(a.channel.local_ice_parameters().clone(), now)?;
    let candidate = b.channel.local_candidates()[0].clone();
    a.channel.add_remote_candidate(candidate, now);
    a.drain();
    b.drain();
    Ok(())
}

fn connect(net: &VirtualNetwork, a: &mut Peer, b: &mut Peer, now: &mut Instant) -> Result<()> {
    start(net, a, b, *now)?;
    let connected = run_until(net, a, b, now, Duration::from_secs(5), |a, b| {
        a.completed() && b.completed()
    })?;
    assert!(connected, "peers did not connect");
    Ok(())
}

#[test]
fn test_channels_connect_and_exchange() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let net = VirtualNetwork::new();
    let mut now = Instant::now();
    let mut a = Peer::simple(&net, "10.0.0.1", IceRole::Controlling, 2)?;
    let mut b = Peer::simple(&net, "10.0.0.2", IceRole::Controlled, 1)?;
    connect(&net, &mut a, &mut b, &mut now)?;

    for peer in [&a, &b] {
        assert!(peer.channel.writable());
        assert!(peer.channel.receiving());
        assert!(peer.channel.is_ready_to_send());
        assert!(peer.has_event(&TransportChannelEvent::WritableStateChange(true)));
        assert!(peer.has_event(&TransportChannelEvent::ReadyToSend));

        let states: Vec<TransportState> = peer
            .events
            .iter()
            .filter_map(|event| match event {
                TransportChannelEvent::TransportStateChange(state) => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![TransportState::Connecting, TransportState::Completed]
        );
    }

    let (local, remote) = a.channel.selected_candidate_pair().expect("pair");
    assert_eq!(remote, b.channel.local_candidates()[0]);
    assert_eq!(local.address().ip(), a.host);
    assert!(a.has_event(&TransportChannelEvent::SelectedCandidatePairChange {
        local,
        remote
    }));

    // the signaling channel surfaces as events, never as reads
    a.channel.send_data(
        0,
        &SendDataParams {
            signaling_type: SignalingMessageType::Offer,
        },
        b"hello",
        now,
    )?;
    deliver(&net, &mut a, &mut b)?;
    assert!(
        b.has_event(&TransportChannelEvent::SignalingMessage(SignalingMessage {
            message_type: SignalingMessageType::Offer,
            payload: BytesMut::from(&b"hello"[..]),
        }))
    );
    assert!(b.channel.poll_read().is_none());

    // data channels are opened on first use by the receiving side
    a.channel.open_channel(5)?;
    a.sent.clear();
    let n = a
        .channel
        .send_data(5, &SendDataParams::default(), b"data", now)?;
    assert_eq!(n, 4);
    deliver(&net, &mut a, &mut b)?;
    assert_eq!(a.sent.len(), 1);
    assert_eq!(a.sent[0].size, 8);

    let msg = b.channel.poll_read().expect("data");
    assert_eq!(msg.channel_id, 5);
    assert_eq!(&msg.payload[..], b"data");
    assert!(b.channel.is_channel_open(5));

    b.channel
        .send_data(5, &SendDataParams::default(), b"reply", now)?;
    deliver(&net, &mut a, &mut b)?;
    let msg = a.channel.poll_read().expect("reply");
    assert_eq!(msg.channel_id, 5);
    assert_eq!(&msg.payload[..], b"reply");

    // the sans-IO write path sends at the time of the last read or timeout
    b.channel.handle_write(DataChannelMessage {
        channel_id: 5,
        params: SendDataParams::default(),
        payload: BytesMut::from(&b"late"[..]),
    })?;
    deliver(&net, &mut a, &mut b)?;
    let msg = a.channel.poll_read().expect("late");
    assert_eq!(&msg.payload[..], b"late");
    assert_eq!(
        b.channel.handle_write(DataChannelMessage {
            channel_id: 7,
            params: SendDataParams::default(),
            payload: BytesMut::from(&b"late"[..]),
        }),
        Err(Error::ErrChannelNotOpen(7))
    );

    Ok(())
}

#[test]
fn test_candidate_add_over_signaling_channel() -> Result<()> {
    let net = VirtualNetwork::new();
    let mut now = Instant::now();
    let mut a = Peer::simple(&net, "10.0.0.1", IceRole::Controlling, 2)?;
    let mut b = Peer::simple(&net, "10.0.0.2", IceRole::Controlled, 1)?;
    connect(&net, &mut a, &mut b, &mut now)?;

    let a_candidate = a.channel.local_candidates()[0].clone();
    let a_listen: SocketAddr = a_candidate.address();
    assert!(
        b.channel
            .port()
            .expect("port")
            .connection_for(a_listen)
            .is_none()
    );

    a.channel.send_data(
        0,
        &SendDataParams {
            signaling_type: SignalingMessageType::CandidateAdd,
        },
        a_candidate.marshal().as_bytes(),
        now,
    )?;
    deliver(&net, &mut a, &mut b)?;

    let port = b.channel.port().expect("port");
    let conn = port.connection_for(a_listen).expect("connection");
    assert!(conn.outgoing());

    // the new pair checks its way to writable without disturbing the selection
    let selected = b.channel.selected_connection().map(|conn| conn.id());
    let writable = run_until(&net, &mut a, &mut b, &mut now, Duration::from_secs(2), |_, b| {
        b.channel
            .port()
            .and_then(|port| port.connection_for(a_listen))
            .is_some_and(|conn| conn.writable())
    })?;
    assert!(writable);
    assert_eq!(
        b.channel.selected_connection().map(|conn| conn.id()),
        selected
    );

    Ok(())
}

#[test]
fn test_socket_close_reconnects_once() -> Result<()> {
    let net = VirtualNetwork::new();
    let mut now = Instant::now();
    let mut a = Peer::simple(&net, "10.0.0.1", IceRole::Controlling, 2)?;
    let mut b = Peer::simple(&net, "10.0.0.2", IceRole::Controlled, 1)?;
    connect(&net, &mut a, &mut b, &mut now)?;
    a.channel.open_channel(5)?;
    a.events.clear();

    let old = a
        .channel
        .selected_connection()
        .and_then(|conn| conn.socket_id())
        .expect("socket");
    net.close_socket(old, now);
    let (host, msg) = net.poll_delivery().expect("close event");
    assert_eq!(host, a.host);
    a.channel.handle_read(msg)?;
    a.drain();

    let conn = a.channel.selected_connection().expect("selected");
    assert!(conn.reconnection_pending());
    assert!(conn.pretending_writable());
    assert!(conn.writable());
    assert_eq!(conn.stats().reconnects, 1);
    assert_ne!(conn.socket_id(), Some(old));

    // data keeps flowing while the new path is verified
    assert!(a.channel.is_ready_to_send());
    a.channel
        .send_data(5, &SendDataParams::default(), b"still here", now)?;
    deliver(&net, &mut a, &mut b)?;
    let msg = b.channel.poll_read().expect("data");
    assert_eq!(&msg.payload[..], b"still here");

    let verified = run_until(&net, &mut a, &mut b, &mut now, Duration::from_secs(1), |a, _| {
        a.channel
            .selected_connection()
            .is_some_and(|conn| !conn.reconnection_pending())
    })?;
    assert!(verified);
    run_until(&net, &mut a, &mut b, &mut now, Duration::from_secs(2), |_, _| false)?;

    let conn = a.channel.selected_connection().expect("selected");
    assert!(!conn.pretending_writable());
    assert!(conn.writable());
    assert_eq!(conn.stats().reconnects, 1);
    assert_eq!(a.channel.transport_state(), TransportState::Completed);
    assert!(!a.has_event(&TransportChannelEvent::WritableStateChange(false)));
    assert!(!a.has_event(&TransportChannelEvent::TransportStateChange(
        TransportState::Failed
    )));

    Ok(())
}

#[test]
fn test_role_conflict_is_reported() -> Result<()> {
    let net = VirtualNetwork::new();
    let mut now = Instant::now();
    let mut a = Peer::simple(&net, "10.0.0.1", IceRole::Controlling, 1)?;
    let mut b = Peer::simple(&net, "10.0.0.2", IceRole::Controlling, 2)?;
    start(&net, &mut a, &mut b, now)?;

    let reported = run_until(&net, &mut a, &mut b, &mut now, Duration::from_secs(1), |_, b| {
        b.events
            .iter()
            .any(|event| matches!(event, TransportChannelEvent::RoleConflict(_)))
    })?;
    assert!(reported);
    let conflict = b
        .events
        .iter()
        .find_map(|event| match event {
            TransportChannelEvent::RoleConflict(conflict) => Some(*conflict),
            _ => None,
        })
        .expect("conflict");
    assert!(conflict.local_wins());
    assert_eq!(conflict.resolved_role(), IceRole::Controlling);
    // b kept its claim, so nothing got writable yet
    assert!(!a.channel.writable());

    // the owner of the losing side switches
    a.channel.set_ice_role(IceRole::Controlled);
    let connected = run_until(&net, &mut a, &mut b, &mut now, Duration::from_secs(5), |a, b| {
        a.completed() && b.completed()
    })?;
    assert!(connected);

    Ok(())
}

#[test]
fn test_open_channel_from_two_threads() -> Result<()> {
    type Request = (ChannelId, mpsc::Sender<Result<()>>);
    let (tx, rx) = mpsc::channel::<Request>();

    let mut callers = vec![];
    for _ in 0..2 {
        let tx = tx.clone();
        callers.push(thread::spawn(move || {
            let (reply_tx, reply_rx) = mpsc::channel();
            tx.send((5, reply_tx)).expect("network thread gone");
            reply_rx.recv().expect("no reply")
        }));
    }
    drop(tx);

    // every call is marshalled onto the thread owning the channel
    let net = VirtualNetwork::new();
    let mut peer = Peer::simple(&net, "10.0.0.1", IceRole::Controlling, 1)?;
    for (id, reply) in rx {
        reply
            .send(peer.channel.open_channel(id))
            .expect("caller gone");
    }

    let results: Vec<Result<()>> = callers
        .into_iter()
        .map(|caller| caller.join().expect("caller panicked"))
        .collect();
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results.contains(&Err(Error::ErrChannelAlreadyOpen(5))));
    assert!(peer.channel.is_channel_open(5));

    Ok(())
}

const MOCK_PREFIX: [u8; 4] = [0xff; 4];
const HELLO: u8 = 1;
const HELLO_ACK: u8 = 2;
const APP: u8 = 3;
const RETRANSMIT: Duration = Duration::from_millis(100);

fn record(kind: u8, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MOCK_PREFIX.len() + 1 + payload.len());
    buf.extend_from_slice(&MOCK_PREFIX);
    buf.extend_from_slice(&[kind]);
    buf.extend_from_slice(payload);
    buf
}

/// Two-message handshake, then application bytes wrapped in a record
/// header. The prefix reads as channel -1 to a side without an engine,
/// which drops it.
struct MockEngine {
    role: HandshakeRole,
    ready: bool,
    outbound: VecDeque<BytesMut>,
    inbound: VecDeque<BytesMut>,
    events: VecDeque<HandshakeEvent>,
    retransmit_at: Option<Instant>,
}

impl MockEngine {
    fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            ready: false,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            events: VecDeque::new(),
            retransmit_at: None,
        }
    }

    fn set_ready(&mut self) {
        if !self.ready {
            self.ready = true;
            self.events.push_back(HandshakeEvent::Ready);
        }
    }
}

impl HandshakeEngine for MockEngine {
    fn role(&self) -> HandshakeRole {
        self.role
    }

    fn start(&mut self, now: Instant) -> Result<()> {
        if self.role == HandshakeRole::Client {
            self.outbound.push_back(record(HELLO, &[]));
            self.retransmit_at = Some(now + RETRANSMIT);
        }
        Ok(())
    }

    fn handle_read(&mut self, datagram: &[u8], _now: Instant) -> Result<HandshakeRead> {
        if datagram.len() <= MOCK_PREFIX.len() || datagram[..MOCK_PREFIX.len()] != MOCK_PREFIX {
            return Ok(HandshakeRead::NotHandshake);
        }
        match (datagram[MOCK_PREFIX.len()], self.role) {
            (HELLO, HandshakeRole::Server) => {
                self.outbound.push_back(record(HELLO_ACK, &[]));
                self.set_ready();
            }
            (HELLO_ACK, HandshakeRole::Client) => {
                self.retransmit_at = None;
                self.set_ready();
            }
            (APP, _) if self.ready => {
                self.inbound
                    .push_back(BytesMut::from(&datagram[MOCK_PREFIX.len() + 1..]));
            }
            (kind, _) => {
                return Err(Error::ErrHandshake(format!("unexpected record {kind}")));
            }
        }
        Ok(HandshakeRead::Consumed)
    }

    fn poll_read(&mut self) -> Option<BytesMut> {
        self.inbound.pop_front()
    }

    fn handle_write(&mut self, payload: &[u8], _now: Instant) -> Result<()> {
        if !self.ready {
            return Err(Error::ErrHandshake("not ready".to_owned()));
        }
        self.outbound.push_back(record(APP, payload));
        Ok(())
    }

    fn poll_write(&mut self) -> Option<BytesMut> {
        self.outbound.pop_front()
    }

    fn poll_event(&mut self) -> Option<HandshakeEvent> {
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.retransmit_at.is_some_and(|at| now >= at) {
            self.outbound.push_back(record(HELLO, &[]));
            self.retransmit_at = Some(now + RETRANSMIT);
        }
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.retransmit_at
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn close(&mut self) -> Result<()> {
        self.events.push_back(HandshakeEvent::Closed(None));
        Ok(())
    }
}

#[derive(Default)]
struct MockEngineFactory {
    created: RefCell<Vec<HandshakeRole>>,
}

impl HandshakeEngineFactory for MockEngineFactory {
    fn create_engine(
        &self,
        role: HandshakeRole,
        _local_addr: SocketAddr,
        _remote_addr: SocketAddr,
    ) -> Result<Box<dyn HandshakeEngine>> {
        self.created.borrow_mut().push(role);
        Ok(Box::new(MockEngine::new(role)))
    }
}

fn handshake_over(
    convention: HandshakeRoleConvention,
    a_role: HandshakeRole,
    b_role: HandshakeRole,
) -> Result<()> {
    let net = VirtualNetwork::new();
    let mut now = Instant::now();
    let a_factory = Rc::new(MockEngineFactory::default());
    let b_factory = Rc::new(MockEngineFactory::default());
    let mut a = Peer::new(
        &net,
        "10.0.0.1",
        IceRole::Controlling,
        2,
        convention,
        Some(Rc::clone(&a_factory)),
    )?;
    let mut b = Peer::new(
        &net,
        "10.0.0.2",
        IceRole::Controlled,
        1,
        convention,
        Some(Rc::clone(&b_factory)),
    )?;
    assert_eq!(a.channel.handshake_role(), a_role);
    assert_eq!(b.channel.handshake_role(), b_role);

    connect(&net, &mut a, &mut b, &mut now)?;
    let ready = run_until(&net, &mut a, &mut b, &mut now, Duration::from_secs(2), |a, b| {
        a.has_event(&TransportChannelEvent::HandshakeReady)
            && b.has_event(&TransportChannelEvent::HandshakeReady)
    })?;
    assert!(ready);
    // one engine per side, never recreated
    assert_eq!(*a_factory.created.borrow(), vec![a_role]);
    assert_eq!(*b_factory.created.borrow(), vec![b_role]);

    // application traffic now goes through the engine
    a.sent.clear();
    a.channel.send_data(
        0,
        &SendDataParams {
            signaling_type: SignalingMessageType::Answer,
        },
        b"hello",
        now,
    )?;
    deliver(&net, &mut a, &mut b)?;
    assert_eq!(a.sent.len(), 1);
    assert_eq!(a.sent[0].size, MOCK_PREFIX.len() + 1 + 1 + 5);
    assert!(
        b.has_event(&TransportChannelEvent::SignalingMessage(SignalingMessage {
            message_type: SignalingMessageType::Answer,
            payload: BytesMut::from(&b"hello"[..]),
        }))
    );

    b.channel.open_channel(9)?;
    b.channel
        .send_data(9, &SendDataParams::default(), b"secret", now)?;
    deliver(&net, &mut a, &mut b)?;
    let msg = a.channel.poll_read().expect("data");
    assert_eq!(msg.channel_id, 9);
    assert_eq!(&msg.payload[..], b"secret");

    a.channel.close()?;
    a.drain();
    assert!(a.has_event(&TransportChannelEvent::ChannelClosed(9)));
    assert_eq!(a.channel.poll_timeout(), None);

    Ok(())
}

#[test]
fn test_handshake_controlling_is_client() -> Result<()> {
    handshake_over(
        HandshakeRoleConvention::ControllingIsClient,
        HandshakeRole::Client,
        HandshakeRole::Server,
    )
}

#[test]
fn test_handshake_controlling_is_server() -> Result<()> {
    handshake_over(
        HandshakeRoleConvention::ControllingIsServer,
        HandshakeRole::Server,
        HandshakeRole::Client,
    )
}
