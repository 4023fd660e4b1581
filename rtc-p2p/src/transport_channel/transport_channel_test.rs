use super::*;
use crate::vnet::VirtualNetwork;
use sansio::Protocol;
use shared::error::ErrorKind;
use std::net::IpAddr;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn new_channel(net: &VirtualNetwork, host: &str, role: IceRole) -> Result<TransportChannel> {
    TransportChannel::new(TransportChannelConfig {
        transport_name: "audio".to_owned(),
        ice_role: role,
        network: Network::new("eth0", 1, vec![ip(host)]),
        socket_factory: Some(Rc::new(net.clone())),
        ..Default::default()
    })
}

fn remote_candidate(address: &str, port: u16, component: u16) -> Result<Candidate> {
    CandidateConfig {
        candidate_type: CandidateType::Host,
        address: address.to_owned(),
        port,
        component,
        ..Default::default()
    }
    .new_candidate()
}

fn drain_events(channel: &mut TransportChannel) -> Vec<TransportChannelEvent> {
    let mut events = vec![];
    while let Some(event) = channel.poll_event() {
        events.push(event);
    }
    events
}

#[test]
fn test_new_requires_socket_factory() {
    let result = TransportChannel::new(TransportChannelConfig::default());
    assert_eq!(result.err(), Some(Error::ErrSocketFactoryRequired));
}

#[test]
fn test_new_rejects_weak_local_credentials() {
    let net = VirtualNetwork::new();
    let result = TransportChannel::new(TransportChannelConfig {
        local_ice_parameters: Some(IceParameters::new("abcd", "short")),
        socket_factory: Some(Rc::new(net)),
        ..Default::default()
    });
    assert_eq!(result.err(), Some(Error::ErrLocalPwdInsufficientBits));
}

#[test]
fn test_config_defaults() -> Result<()> {
    let config = TransportChannelConfig::default();
    assert!(config.allow_listen);
    assert_eq!(config.component, ICE_CANDIDATE_COMPONENT_DEFAULT);
    assert_eq!(
        config.handshake_role_convention,
        HandshakeRoleConvention::ControllingIsClient
    );
    assert_eq!(config.timeouts(), ConnectionTimeouts::default());

    let net = VirtualNetwork::new();
    let channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;
    assert_eq!(channel.gathering_state(), IceGatheringState::New);
    assert_eq!(channel.transport_state(), TransportState::Init);
    assert!(!channel.writable());
    assert!(!channel.receiving());
    assert!(channel.local_ice_parameters().validate_local().is_ok());
    assert_eq!(channel.handshake_role(), HandshakeRole::Client);
    assert_eq!(channel.open_channels().collect::<Vec<_>>(), vec![0]);

    Ok(())
}

#[test]
fn test_gathering_runs_once() -> Result<()> {
    let net = VirtualNetwork::new();
    let now = Instant::now();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;

    channel.maybe_start_gathering(now)?;
    let events = drain_events(&mut channel);
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0],
        TransportChannelEvent::GatheringStateChange(IceGatheringState::Gathering)
    );
    match &events[1] {
        TransportChannelEvent::CandidateGathered(candidate) => {
            assert_eq!(candidate.address().ip(), ip("10.0.0.1"));
            assert_eq!(candidate.protocol(), QUIC_PROTOCOL_NAME);
            assert_eq!(
                candidate.username(),
                channel.local_ice_parameters().ufrag
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        events[2],
        TransportChannelEvent::GatheringStateChange(IceGatheringState::Complete)
    );
    assert_eq!(channel.local_candidates().len(), 1);

    channel.maybe_start_gathering(now)?;
    assert!(drain_events(&mut channel).is_empty());
    assert_eq!(net.open_sockets(ip("10.0.0.1")).len(), 1);

    Ok(())
}

#[test]
fn test_gathering_without_network_address_fails() -> Result<()> {
    let net = VirtualNetwork::new();
    let now = Instant::now();
    let mut channel = TransportChannel::new(TransportChannelConfig {
        transport_name: "audio".to_owned(),
        network: Network::new("eth0", 1, vec![]),
        socket_factory: Some(Rc::new(net.clone())),
        ..Default::default()
    })?;
    channel.add_remote_candidate(remote_candidate("10.0.0.2", 5000, 1)?, now);

    assert_eq!(
        channel.maybe_start_gathering(now),
        Err(Error::ErrNoNetworkAddress)
    );
    assert_eq!(channel.gathering_state(), IceGatheringState::New);
    assert_eq!(channel.transport_state(), TransportState::Failed);
    assert!(channel.port().is_none());
    assert_eq!(
        drain_events(&mut channel),
        vec![TransportChannelEvent::TransportStateChange(
            TransportState::Failed
        )]
    );

    // every further attempt reports the failure again
    assert_eq!(
        channel.maybe_start_gathering(now),
        Err(Error::ErrNoNetworkAddress)
    );
    assert!(drain_events(&mut channel).is_empty());
    assert_eq!(channel.pending_remote_candidates.len(), 1);

    Ok(())
}

#[test]
fn test_channel_registry() -> Result<()> {
    let net = VirtualNetwork::new();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;

    assert_eq!(
        channel.open_channel(SIGNALING_CHANNEL_ID),
        Err(Error::ErrChannelAlreadyOpen(0))
    );
    assert_eq!(channel.open_channel(-1), Err(Error::ErrInvalidChannelId(-1)));

    channel.open_channel(5)?;
    assert!(channel.is_channel_open(5));
    assert_eq!(channel.open_channel(5), Err(Error::ErrChannelAlreadyOpen(5)));

    assert_eq!(
        channel.close_channel(SIGNALING_CHANNEL_ID),
        Err(Error::ErrInvalidChannelId(0))
    );
    assert_eq!(channel.close_channel(6), Err(Error::ErrChannelNotOpen(6)));

    channel.close_channel(5)?;
    assert!(!channel.is_channel_open(5));
    assert_eq!(
        channel.poll_event(),
        Some(TransportChannelEvent::ChannelClosed(5))
    );
    assert_eq!(channel.close_channel(5), Err(Error::ErrChannelNotOpen(5)));

    // reopening a closed id is allowed
    channel.open_channel(5)?;

    // ids the peer would read as signaling still open, with a warning
    assert!(shadowed_by_signaling(3));
    channel.open_channel(3)?;
    assert!(channel.is_channel_open(3));

    Ok(())
}

#[test]
fn test_send_data_errors() -> Result<()> {
    let net = VirtualNetwork::new();
    let now = Instant::now();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;
    let params = SendDataParams::default();

    assert_eq!(
        channel.send_data(-3, &params, b"x", now),
        Err(Error::ErrInvalidChannelId(-3))
    );
    assert_eq!(
        channel.send_data(7, &params, b"x", now),
        Err(Error::ErrChannelNotOpen(7))
    );

    channel.open_channel(7)?;
    let too_large = vec![0u8; MAX_DATA_PAYLOAD_SIZE + 1];
    assert_eq!(
        channel.send_data(7, &params, &too_large, now),
        Err(Error::ErrMessageTooLarge {
            size: 1197,
            max: 1196
        })
    );

    let signaling = vec![0u8; MAX_SIGNALING_PAYLOAD_SIZE + 1];
    assert_eq!(
        channel.send_data(SIGNALING_CHANNEL_ID, &params, &signaling, now),
        Err(Error::ErrMessageTooLarge {
            size: 1200,
            max: 1199
        })
    );

    // the largest allowed payload only fails for lack of a path
    let err = channel
        .send_data(7, &params, &too_large[1..], now)
        .unwrap_err();
    assert_eq!(err, Error::ErrNoWritableConnection);
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert!(!channel.is_ready_to_send());

    channel.close()?;
    assert_eq!(
        channel.send_data(7, &params, b"x", now),
        Err(Error::ErrTransportClosed)
    );

    Ok(())
}

#[test]
fn test_remote_candidates_wait_for_gathering() -> Result<()> {
    let net = VirtualNetwork::new();
    let now = Instant::now();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;

    channel.add_remote_candidate(remote_candidate("10.0.0.2", 5000, 1)?, now);
    // another component is ignored
    channel.add_remote_candidate(remote_candidate("10.0.0.3", 5000, 2)?, now);
    assert!(channel.port().is_none());

    channel.maybe_start_gathering(now)?;
    let port = channel.port().expect("port");
    assert_eq!(port.connections().count(), 1);
    assert!(port.connection_for("10.0.0.2:5000".parse().unwrap()).is_some());

    let udp = CandidateConfig {
        protocol: "udp".to_owned(),
        address: "10.0.0.4".to_owned(),
        port: 5000,
        ..Default::default()
    }
    .new_candidate()?;
    channel.add_remote_candidate(udp, now);
    assert_eq!(channel.port().expect("port").connections().count(), 1);

    channel.remove_remote_candidate(&remote_candidate("10.0.0.2", 5000, 1)?, now);
    assert_eq!(channel.port().expect("port").connections().count(), 0);

    Ok(())
}

#[test]
fn test_remote_ice_parameters_validated() -> Result<()> {
    let net = VirtualNetwork::new();
    let now = Instant::now();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;

    assert_eq!(
        channel.set_remote_ice_parameters(IceParameters::new("", "pwd"), now),
        Err(Error::ErrRemoteUfragEmpty)
    );
    assert!(channel.remote_ice_parameters().is_none());

    let remote = IceParameters::generate();
    channel.set_remote_ice_parameters(remote.clone(), now)?;
    channel.maybe_start_gathering(now)?;
    assert_eq!(
        channel.port().expect("port").remote_ice_parameters(),
        Some(&remote)
    );

    channel.set_ice_role(IceRole::Controlled);
    channel.set_ice_tiebreaker(42);
    let port = channel.port().expect("port");
    assert_eq!(port.ice_role(), IceRole::Controlled);
    assert_eq!(port.tiebreaker(), 42);
    assert_eq!(channel.handshake_role(), HandshakeRole::Server);

    Ok(())
}

#[test]
fn test_signaling_candidate_messages() -> Result<()> {
    let net = VirtualNetwork::new();
    let now = Instant::now();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;
    channel.maybe_start_gathering(now)?;
    drain_events(&mut channel);

    let candidate = remote_candidate("10.0.0.2", 5000, 1)?;
    let add = SignalingMessage {
        message_type: SignalingMessageType::CandidateAdd,
        payload: BytesMut::from(candidate.marshal().as_bytes()),
    };
    channel.dispatch_application(BytesMut::from(add.marshal()?.as_ref()));

    assert_eq!(channel.port().expect("port").connections().count(), 1);
    assert!(channel.reads.is_empty());
    let events = drain_events(&mut channel);
    assert!(events.contains(&TransportChannelEvent::SignalingMessage(add)));

    let remove = SignalingMessage {
        message_type: SignalingMessageType::CandidateRemove,
        payload: BytesMut::from(candidate.marshal().as_bytes()),
    };
    channel.dispatch_application(BytesMut::from(remove.marshal()?.as_ref()));
    assert_eq!(channel.port().expect("port").connections().count(), 0);

    // a malformed candidate is still reported, but changes nothing
    let garbage = SignalingMessage {
        message_type: SignalingMessageType::CandidateAdd,
        payload: BytesMut::from(&b"not a candidate"[..]),
    };
    drain_events(&mut channel);
    channel.dispatch_application(BytesMut::from(garbage.marshal()?.as_ref()));
    assert_eq!(channel.port().expect("port").connections().count(), 0);
    assert_eq!(
        drain_events(&mut channel),
        vec![TransportChannelEvent::SignalingMessage(garbage)]
    );

    Ok(())
}

#[test]
fn test_signaling_candidate_with_out_of_range_component() -> Result<()> {
    let net = VirtualNetwork::new();
    let now = Instant::now();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;
    channel.maybe_start_gathering(now)?;
    drain_events(&mut channel);

    let mut raw = BytesMut::from(&[SignalingMessageType::CandidateAdd as u8][..]);
    raw.extend_from_slice(b"f 300 quic-transport 0 10.0.0.9 5000 typ host");
    channel.dispatch_application(raw);

    assert_eq!(channel.port().expect("port").connections().count(), 0);
    let events = drain_events(&mut channel);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        TransportChannelEvent::SignalingMessage(message)
            if message.message_type == SignalingMessageType::CandidateAdd
    ));

    Ok(())
}

#[test]
fn test_new_rejects_out_of_range_component() {
    let net = VirtualNetwork::new();
    for component in [0, 257] {
        let result = TransportChannel::new(TransportChannelConfig {
            component,
            socket_factory: Some(Rc::new(net.clone())),
            ..Default::default()
        });
        assert_eq!(
            result.err(),
            Some(Error::ErrInvalidCandidateComponent(component))
        );
    }
}

#[test]
fn test_data_frames_dispatch() -> Result<()> {
    let net = VirtualNetwork::new();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;

    let frame = |channel_id: ChannelId, payload: &[u8]| -> Result<BytesMut> {
        let raw = DataFrame {
            channel_id,
            payload: BytesMut::from(payload),
        }
        .marshal()?;
        Ok(BytesMut::from(raw.as_ref()))
    };

    // data frames never reach the signaling channel
    channel.dispatch_application(frame(SIGNALING_CHANNEL_ID, b"nope")?);
    channel.dispatch_application(frame(-1, b"nope")?);
    assert!(channel.poll_read().is_none());

    // an unknown channel is opened by the first frame
    channel.dispatch_application(frame(9, b"hello")?);
    assert!(channel.is_channel_open(9));
    let msg = channel.poll_read().expect("message");
    assert_eq!(msg.channel_id, 9);
    assert_eq!(&msg.payload[..], b"hello");

    // too short for any framing
    channel.dispatch_application(BytesMut::from(&[0x00u8, 0x00][..]));
    assert!(channel.poll_read().is_none());

    Ok(())
}

#[test]
fn test_socket_options_reach_the_port() -> Result<()> {
    let net = VirtualNetwork::new();
    let now = Instant::now();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;

    channel.set_option(SocketOption::SendBufferSize, 65536)?;
    assert_eq!(channel.get_option(SocketOption::SendBufferSize), Some(65536));
    assert_eq!(channel.get_option(SocketOption::Dscp), None);

    channel.maybe_start_gathering(now)?;
    let listen = net.open_sockets(ip("10.0.0.1"))[0];
    assert_eq!(
        net.socket_option(listen, SocketOption::SendBufferSize),
        Some(65536)
    );

    channel.set_option(SocketOption::Dscp, 46)?;
    assert_eq!(net.socket_option(listen, SocketOption::Dscp), Some(46));

    Ok(())
}

#[test]
fn test_close_releases_everything() -> Result<()> {
    let net = VirtualNetwork::new();
    let now = Instant::now();
    let mut channel = new_channel(&net, "10.0.0.1", IceRole::Controlling)?;
    channel.maybe_start_gathering(now)?;
    channel.open_channel(5)?;
    channel.open_channel(6)?;
    drain_events(&mut channel);

    channel.close()?;
    assert!(channel.is_closed());
    assert_eq!(
        drain_events(&mut channel),
        vec![
            TransportChannelEvent::ChannelClosed(5),
            TransportChannelEvent::ChannelClosed(6),
        ]
    );
    assert!(channel.port().expect("port").is_destroyed());
    assert!(net.open_sockets(ip("10.0.0.1")).is_empty());
    assert_eq!(channel.poll_timeout(), None);
    assert_eq!(channel.open_channel(8), Err(Error::ErrTransportClosed));
    assert_eq!(
        channel.maybe_start_gathering(now),
        Err(Error::ErrTransportClosed)
    );

    // closing twice is harmless
    channel.close()?;
    assert!(drain_events(&mut channel).is_empty());

    Ok(())
}
