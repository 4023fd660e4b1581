#![allow(dead_code)]

use std::io;
use std::net;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of [`Error`] that callers can match on without
/// caring about the individual variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad argument: channel id, oversize message, malformed candidate or check message.
    InvalidParameter,
    /// Operation not valid in the current state: duplicate open, double close.
    InvalidState,
    /// Send failure or no writable path.
    NetworkError,
    /// No socket for the destination.
    Unreachable,
    /// The socket exists but is not connected.
    NotConnected,
    /// Anything else.
    Other,
}

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    // data channel layer
    #[error("channel id {0} is invalid")]
    ErrInvalidChannelId(i32),
    #[error("channel {0} is already open")]
    ErrChannelAlreadyOpen(i32),
    #[error("channel {0} is not open")]
    ErrChannelNotOpen(i32),
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    ErrMessageTooLarge { size: usize, max: usize },
    #[error("no writable connection is selected")]
    ErrNoWritableConnection,
    #[error("transport channel is closed")]
    ErrTransportClosed,
    #[error("unknown signaling message type {0}")]
    ErrUnknownSignalingMessageType(u8),
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    ErrShortBuffer { expected: usize, actual: usize },

    // connection layer
    #[error("connection has no socket")]
    ErrNoSocket,
    #[error("connection is not connected")]
    ErrNotConnected,
    #[error("only outgoing connections can reconnect")]
    ErrReconnectIncoming,
    #[error("a reconnection is already pending")]
    ErrReconnectionPending,
    #[error("connection {0} not found")]
    ErrConnectionNotFound(u64),
    #[error("remote ICE parameters are not set")]
    ErrRemoteIceParametersNotSet,

    // socket layer
    #[error("socket would block")]
    ErrWouldBlock,
    #[error("socket is closed")]
    ErrSocketClosed,
    #[error("socket is not connected to a remote address")]
    ErrSocketNotConnected,
    #[error("failed to create socket: {0}")]
    ErrSocketCreationFailed(String),
    #[error("no available port in range {0}-{1}")]
    ErrNoAvailablePort(u16, u16),
    #[error("address already in use")]
    ErrAddressAlreadyInUse,
    #[error("socket factory is required")]
    ErrSocketFactoryRequired,

    // port / candidate layer
    #[error("unsupported protocol {0}")]
    ErrUnsupportedProtocol(String),
    #[error("candidate belongs to another port")]
    ErrCandidateFromOtherPort,
    #[error("address family is not compatible with the local network")]
    ErrIncompatibleAddress,
    #[error("candidate component {0} does not match the channel component {1}")]
    ErrComponentMismatch(u16, u16),
    #[error("candidate component {0} is outside 1-256")]
    ErrInvalidCandidateComponent(u16),
    #[error("attribute not long enough to be ICE candidate")]
    ErrAttributeTooShortIceCandidate,
    #[error("could not parse related addresses")]
    ErrParseRelatedAddr,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("network has no usable IP address")]
    ErrNoNetworkAddress,

    // ICE credentials
    #[error("remote ufrag is empty")]
    ErrRemoteUfragEmpty,
    #[error("remote pwd is empty")]
    ErrRemotePwdEmpty,
    #[error("local username fragment is less than 24 bits long")]
    ErrLocalUfragInsufficientBits,
    #[error("local password is less than 128 bits long")]
    ErrLocalPwdInsufficientBits,

    // connectivity checks
    #[error("not a connectivity check message")]
    ErrNotCheckMessage,
    #[error("unexpected check message class {0:#06x}")]
    ErrUnexpectedCheckMessageType(u16),
    #[error("attribute {0:#06x} not found")]
    ErrAttributeNotFound(u16),
    #[error("attribute {0:#06x} is malformed")]
    ErrAttributeMalformed(u16),
    #[error("malformed check message: {0}")]
    ErrMalformedCheckMessage(String),
    #[error("username mismatch")]
    ErrMismatchUsername,
    #[error("message integrity mismatch")]
    ErrIntegrityMismatch,
    #[error("fingerprint mismatch")]
    ErrFingerprintMismatch,

    // handshake engine
    #[error("handshake: {0}")]
    ErrHandshake(String),

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Maps this error onto the caller facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ErrInvalidChannelId(_)
            | Error::ErrMessageTooLarge { .. }
            | Error::ErrUnknownSignalingMessageType(_)
            | Error::ErrShortBuffer { .. }
            | Error::ErrUnsupportedProtocol(_)
            | Error::ErrCandidateFromOtherPort
            | Error::ErrIncompatibleAddress
            | Error::ErrComponentMismatch(..)
            | Error::ErrInvalidCandidateComponent(_)
            | Error::ErrAttributeTooShortIceCandidate
            | Error::ErrParseRelatedAddr
            | Error::ErrUnknownCandidateType
            | Error::ErrRemoteUfragEmpty
            | Error::ErrRemotePwdEmpty
            | Error::ErrLocalUfragInsufficientBits
            | Error::ErrLocalPwdInsufficientBits
            | Error::ErrNotCheckMessage
            | Error::ErrUnexpectedCheckMessageType(_)
            | Error::ErrAttributeNotFound(_)
            | Error::ErrAttributeMalformed(_)
            | Error::ErrMalformedCheckMessage(_)
            | Error::ErrMismatchUsername
            | Error::ErrIntegrityMismatch
            | Error::ErrFingerprintMismatch
            | Error::ParseInt(_)
            | Error::ParseIp(_)
            | Error::Utf8(_) => ErrorKind::InvalidParameter,

            Error::ErrChannelAlreadyOpen(_)
            | Error::ErrChannelNotOpen(_)
            | Error::ErrTransportClosed
            | Error::ErrReconnectIncoming
            | Error::ErrReconnectionPending
            | Error::ErrConnectionNotFound(_)
            | Error::ErrRemoteIceParametersNotSet
            | Error::ErrSocketFactoryRequired => ErrorKind::InvalidState,

            Error::ErrNoWritableConnection
            | Error::ErrWouldBlock
            | Error::ErrSocketCreationFailed(_)
            | Error::ErrNoAvailablePort(..)
            | Error::ErrAddressAlreadyInUse
            | Error::ErrNoNetworkAddress
            | Error::ErrHandshake(_)
            | Error::Io(_) => ErrorKind::NetworkError,

            Error::ErrNoSocket => ErrorKind::Unreachable,

            Error::ErrNotConnected | Error::ErrSocketClosed | Error::ErrSocketNotConnected => {
                ErrorKind::NotConnected
            }

            Error::Other(_) => ErrorKind::Other,
        }
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
