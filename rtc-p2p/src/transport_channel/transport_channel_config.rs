use std::rc::Rc;
use std::time::Duration;

use super::*;
use crate::checker::{ConnectivityChecker, StunChecker};
use crate::connection::*;

/// Collects the arguments to [`TransportChannel`] construction into a single
/// structure, for future-proofness of the interface.
pub struct TransportChannelConfig {
    /// Names the channel in logs and in the port it owns.
    pub transport_name: String,

    /// Component id of every local candidate; remote candidates of another
    /// component are ignored.
    pub component: u16,

    pub ice_role: IceRole,

    /// Random when none is given.
    pub ice_tiebreaker: Option<u64>,

    /// Generated when none are given. The values MUST be unguessable, with at
    /// least 128 bits of random number generator output used to generate the
    /// password, and at least 24 bits of output to generate the username
    /// fragment.
    pub local_ice_parameters: Option<IceParameters>,

    /// The interface candidates are gathered on.
    pub network: Network,

    /// Local port range for every socket, both zero for ephemeral ports.
    pub min_port: u16,
    pub max_port: u16,

    /// Open a listen socket so the remote side can reach the local candidate.
    pub allow_listen: bool,

    /// How long a reconnecting connection keeps pretending to be writable.
    /// Defaults to 5 seconds when this property is nil.
    pub reconnection_timeout: Option<Duration>,

    /// Interval between checks of a pair that is not writable yet.
    /// Defaults to 200 milliseconds when this property is nil.
    pub check_interval: Option<Duration>,

    /// Interval between checks of a writable pair.
    /// Defaults to 480 milliseconds when this property is nil.
    pub keepalive_interval: Option<Duration>,

    /// Silence after which a pair stops receiving.
    /// Defaults to 2.5 seconds when this property is nil.
    pub receiving_timeout: Option<Duration>,

    /// Max unanswered checks before a new pair is considered failed.
    /// Defaults to 7 when this property is nil.
    pub max_binding_requests: Option<u16>,

    /// Both peers must use the same convention.
    pub handshake_role_convention: HandshakeRoleConvention,

    /// Required.
    pub socket_factory: Option<Rc<dyn PacketSocketFactory>>,

    /// Without a factory, no handshake engine is ever created and data
    /// goes straight to the selected connection.
    pub handshake_engine_factory: Option<Rc<dyn HandshakeEngineFactory>>,

    /// Defaults to [`StunChecker`].
    pub connectivity_checker: Option<Rc<dyn ConnectivityChecker>>,
}

impl Default for TransportChannelConfig {
    fn default() -> Self {
        Self {
            transport_name: String::new(),
            component: ICE_CANDIDATE_COMPONENT_DEFAULT,
            ice_role: IceRole::default(),
            ice_tiebreaker: None,
            local_ice_parameters: None,
            network: Network::default(),
            min_port: 0,
            max_port: 0,
            allow_listen: true,
            reconnection_timeout: None,
            check_interval: None,
            keepalive_interval: None,
            receiving_timeout: None,
            max_binding_requests: None,
            handshake_role_convention: HandshakeRoleConvention::default(),
            socket_factory: None,
            handshake_engine_factory: None,
            connectivity_checker: None,
        }
    }
}

impl TransportChannelConfig {
    pub(crate) fn timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            check_interval: self.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL),
            keepalive_interval: self
                .keepalive_interval
                .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL),
            receiving_timeout: self.receiving_timeout.unwrap_or(DEFAULT_RECEIVING_TIMEOUT),
            max_binding_requests: self
                .max_binding_requests
                .unwrap_or(DEFAULT_MAX_BINDING_REQUESTS),
            reconnection_timeout: self
                .reconnection_timeout
                .unwrap_or(CONNECTION_WRITE_CONNECT_TIMEOUT),
        }
    }

    pub(crate) fn checker(&self) -> Rc<dyn ConnectivityChecker> {
        match &self.connectivity_checker {
            Some(checker) => Rc::clone(checker),
            None => Rc::new(StunChecker),
        }
    }
}
