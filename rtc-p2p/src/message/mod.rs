
use bytes::{Buf, BufMut, BytesMut};
use shared::error::{Error, Result};
use shared::marshal::*;
use std::fmt;

/// Logical channel identifier carried in front of every data frame.
pub type ChannelId = i32;

/// Channel reserved for the signaling sub-protocol.
pub const SIGNALING_CHANNEL_ID: ChannelId = 0;

/// Largest datagram handed to a connection, chosen to stay under common
/// path MTUs once IP/UDP and engine overhead are added.
pub const MAX_MESSAGE_SIZE: usize = 1200;

pub(crate) const CHANNEL_ID_LEN: usize = 4;
pub(crate) const SIGNALING_TYPE_LEN: usize = 1;

/// Largest payload of a data channel frame.
pub const MAX_DATA_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - CHANNEL_ID_LEN;
/// Largest payload of a signaling message.
pub const MAX_SIGNALING_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - SIGNALING_TYPE_LEN;

/// Signaling message tag, the first byte of every channel 0 datagram.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalingMessageType {
    #[default]
    Offer = 1,
    Answer = 2,
    CandidateAdd = 3,
    CandidateRemove = 4,
}

impl fmt::Display for SignalingMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::CandidateAdd => "candidate-add",
            Self::CandidateRemove => "candidate-remove",
        };
        write!(f, "{s}")
    }
}

impl TryFrom<u8> for SignalingMessageType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Offer),
            2 => Ok(Self::Answer),
            3 => Ok(Self::CandidateAdd),
            4 => Ok(Self::CandidateRemove),
            _ => Err(Error::ErrUnknownSignalingMessageType(v)),
        }
    }
}

impl SignalingMessageType {
    /// Whether `b` is a valid signaling tag.
    pub fn is_signaling_tag(b: u8) -> bool {
        (Self::Offer as u8..=Self::CandidateRemove as u8).contains(&b)
    }
}

/// A message of the signaling sub-protocol carried on channel 0.
///
/// # Memory layout
///
/// ```plain
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Message Type |                  Payload ...                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub message_type: SignalingMessageType,
    pub payload: BytesMut,
}

impl MarshalSize for SignalingMessage {
    fn marshal_size(&self) -> usize {
        SIGNALING_TYPE_LEN + self.payload.len()
    }
}

impl Marshal for SignalingMessage {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrShortBuffer {
                expected: size,
                actual: buf.remaining_mut(),
            });
        }
        buf.put_u8(self.message_type as u8);
        buf.put_slice(&self.payload);
        Ok(size)
    }
}

impl Unmarshal for SignalingMessage {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < SIGNALING_TYPE_LEN {
            return Err(Error::ErrShortBuffer {
                expected: SIGNALING_TYPE_LEN,
                actual: buf.remaining(),
            });
        }
        let message_type = SignalingMessageType::try_from(buf.get_u8())?;
        let len = buf.remaining();
        let payload = BytesMut::from(buf.copy_to_bytes(len).as_ref());
        Ok(Self {
            message_type,
            payload,
        })
    }
}

/// A datagram of a numbered data channel.
///
/// The channel id is written in host byte order, both peers are expected to
/// share it.
///
/// # Memory layout
///
/// ```plain
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     Channel ID (native endian)                |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Payload ...                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub channel_id: ChannelId,
    pub payload: BytesMut,
}

impl MarshalSize for DataFrame {
    fn marshal_size(&self) -> usize {
        CHANNEL_ID_LEN + self.payload.len()
    }
}

impl Marshal for DataFrame {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrShortBuffer {
                expected: size,
                actual: buf.remaining_mut(),
            });
        }
        buf.put_i32_ne(self.channel_id);
        buf.put_slice(&self.payload);
        Ok(size)
    }
}

impl Unmarshal for DataFrame {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < CHANNEL_ID_LEN {
            return Err(Error::ErrShortBuffer {
                expected: CHANNEL_ID_LEN,
                actual: buf.remaining(),
            });
        }
        let channel_id = buf.get_i32_ne();
        let len = buf.remaining();
        let payload = BytesMut::from(buf.copy_to_bytes(len).as_ref());
        Ok(Self {
            channel_id,
            payload,
        })
    }
}

/// Whether data frames for `channel_id` classify as signaling on the wire.
pub fn shadowed_by_signaling(channel_id: ChannelId) -> bool {
    SignalingMessageType::is_signaling_tag(channel_id.to_ne_bytes()[0])
}

/// An application datagram after connectivity checks and the handshake
/// engine have had their turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Signaling(SignalingMessage),
    Data(DataFrame),
}

/// Splits an application datagram into signaling or data framing.
///
/// A first byte that is a valid signaling tag wins, so data channel ids
/// whose leading byte in host order falls in 1..=4 are never seen as data.
pub fn classify(mut buf: &[u8]) -> Result<Frame> {
    let first = buf.first().copied();
    match first {
        Some(b) if SignalingMessageType::is_signaling_tag(b) => {
            Ok(Frame::Signaling(SignalingMessage::unmarshal(&mut buf)?))
        }
        _ => Ok(Frame::Data(DataFrame::unmarshal(&mut buf)?)),
    }
}
