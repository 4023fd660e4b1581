use bytes::BytesMut;
use shared::error::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::*;
use stun::integrity::*;
use stun::message::*;
use stun::textattrs::*;
use stun::xoraddr::*;

use super::*;

const PRIORITY_SIZE: usize = 4;
const TIE_BREAKER_SIZE: usize = 8;

/// RFC 5389 binding messages with the RFC 8445 ICE attributes.
///
/// Requests and responses carry MESSAGE-INTEGRITY keyed with the short term
/// password and end with a FINGERPRINT.
#[derive(Default, Debug, Copy, Clone)]
pub struct StunChecker;

impl StunChecker {
    fn decode(&self, datagram: &[u8]) -> Result<Message> {
        if !self.is_check_message(datagram) {
            return Err(Error::ErrNotCheckMessage);
        }
        let mut m = Message {
            raw: vec![],
            ..Message::default()
        };
        m.raw.extend_from_slice(datagram);
        m.decode().map_err(malformed)?;
        Ok(m)
    }
}

impl ConnectivityChecker for StunChecker {
    fn is_check_message(&self, datagram: &[u8]) -> bool {
        // the two most significant bits of every STUN message are zero
        if !is_stun_message(datagram) || datagram[0] & 0xC0 != 0 {
            return false;
        }
        let length = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
        let mut typ = MessageType::default();
        typ.read_value(u16::from_be_bytes([datagram[0], datagram[1]]));

        typ.method == METHOD_BINDING
            && length % 4 == 0
            && MESSAGE_HEADER_SIZE + length == datagram.len()
    }

    fn build_request(&self, request: &CheckRequest<'_>) -> Result<(TransactionId, BytesMut)> {
        let transaction_id = TransactionId::new();
        let mut m = Message::new();
        m.build(&[
            Box::new(BINDING_REQUEST),
            Box::new(transaction_id),
            Box::new(Username::new(ATTR_USERNAME, request.username.to_owned())),
        ])
        .map_err(malformed)?;

        m.add(ATTR_PRIORITY, &request.priority.to_be_bytes());
        let role = match request.role {
            IceRole::Controlling => ATTR_ICE_CONTROLLING,
            IceRole::Controlled => ATTR_ICE_CONTROLLED,
        };
        m.add(role, &request.tiebreaker.to_be_bytes());
        if request.use_candidate {
            m.add(ATTR_USE_CANDIDATE, &[]);
        }

        // integrity covers everything added so far, the fingerprint must come last
        MessageIntegrity::new_short_term_integrity(request.password.to_owned())
            .add_to(&mut m)
            .map_err(malformed)?;
        FINGERPRINT.add_to(&mut m).map_err(malformed)?;

        Ok((transaction_id, BytesMut::from(&m.raw[..])))
    }

    fn build_success_response(
        &self,
        transaction_id: TransactionId,
        mapped_address: SocketAddr,
        password: &str,
    ) -> Result<BytesMut> {
        let mut m = Message::new();
        m.build(&[
            Box::new(BINDING_SUCCESS),
            Box::new(transaction_id),
            Box::new(XorMappedAddress {
                ip: mapped_address.ip(),
                port: mapped_address.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                password.to_owned(),
            )),
            Box::new(FINGERPRINT),
        ])
        .map_err(malformed)?;

        Ok(BytesMut::from(&m.raw[..]))
    }

    fn build_error_response(
        &self,
        transaction_id: TransactionId,
        code: u16,
        reason: &str,
        password: &str,
    ) -> Result<BytesMut> {
        let mut m = Message::new();
        m.build(&[
            Box::new(BINDING_ERROR),
            Box::new(transaction_id),
            Box::new(ErrorCodeAttribute {
                code: ErrorCode(code),
                reason: reason.as_bytes().to_vec(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                password.to_owned(),
            )),
            Box::new(FINGERPRINT),
        ])
        .map_err(malformed)?;

        Ok(BytesMut::from(&m.raw[..]))
    }

    fn build_indication(&self) -> Result<BytesMut> {
        let mut m = Message::new();
        m.build(&[
            Box::new(MessageType::new(METHOD_BINDING, CLASS_INDICATION)),
            Box::new(TransactionId::new()),
            Box::new(FINGERPRINT),
        ])
        .map_err(malformed)?;

        Ok(BytesMut::from(&m.raw[..]))
    }

    fn parse(&self, datagram: &[u8]) -> Result<CheckMessage> {
        let m = self.decode(datagram)?;
        let transaction_id = m.transaction_id;

        if m.typ.class == CLASS_REQUEST {
            if !m.contains(ATTR_USERNAME) {
                return Err(Error::ErrAttributeNotFound(ATTR_USERNAME.0));
            }
            let username = TextAttribute::get_from_as(&m, ATTR_USERNAME)
                .map_err(malformed)?
                .text;

            let role = if m.contains(ATTR_ICE_CONTROLLING) {
                Some((IceRole::Controlling, read_u64(&m, ATTR_ICE_CONTROLLING)?))
            } else if m.contains(ATTR_ICE_CONTROLLED) {
                Some((IceRole::Controlled, read_u64(&m, ATTR_ICE_CONTROLLED)?))
            } else {
                None
            };
            let priority = if m.contains(ATTR_PRIORITY) {
                Some(read_u32(&m, ATTR_PRIORITY)?)
            } else {
                None
            };

            Ok(CheckMessage::Request {
                transaction_id,
                username,
                role,
                priority,
                use_candidate: m.contains(ATTR_USE_CANDIDATE),
            })
        } else if m.typ.class == CLASS_SUCCESS_RESPONSE {
            let mapped_address = if m.contains(ATTR_XORMAPPED_ADDRESS) {
                let mut addr = XorMappedAddress::default();
                addr.get_from(&m).map_err(malformed)?;
                Some(SocketAddr::new(addr.ip, addr.port))
            } else {
                None
            };
            Ok(CheckMessage::SuccessResponse {
                transaction_id,
                mapped_address,
            })
        } else if m.typ.class == CLASS_ERROR_RESPONSE {
            if !m.contains(ATTR_ERROR_CODE) {
                return Err(Error::ErrAttributeNotFound(ATTR_ERROR_CODE.0));
            }
            let mut error_code = ErrorCodeAttribute::default();
            error_code.get_from(&m).map_err(malformed)?;
            Ok(CheckMessage::ErrorResponse {
                transaction_id,
                code: error_code.code.0,
                reason: String::from_utf8(error_code.reason)?,
            })
        } else if m.typ.class == CLASS_INDICATION {
            Ok(CheckMessage::Indication { transaction_id })
        } else {
            Err(Error::ErrUnexpectedCheckMessageType(m.typ.value()))
        }
    }

    fn verify(&self, datagram: &[u8], password: &str) -> Result<()> {
        let mut m = self.decode(datagram)?;

        if m.contains(ATTR_FINGERPRINT) {
            FINGERPRINT
                .check(&m)
                .map_err(|_| Error::ErrFingerprintMismatch)?;
        }
        if !m.contains(ATTR_MESSAGE_INTEGRITY) {
            return Err(Error::ErrAttributeNotFound(ATTR_MESSAGE_INTEGRITY.0));
        }
        MessageIntegrity::new_short_term_integrity(password.to_owned())
            .check(&mut m)
            .map_err(|_| Error::ErrIntegrityMismatch)
    }
}

fn malformed(err: impl fmt::Display) -> Error {
    Error::ErrMalformedCheckMessage(err.to_string())
}

fn read_u32(m: &Message, attr: AttrType) -> Result<u32> {
    let value = m.get(attr).map_err(malformed)?;
    let bytes: [u8; PRIORITY_SIZE] = value
        .as_slice()
        .try_into()
        .map_err(|_| Error::ErrAttributeMalformed(attr.0))?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(m: &Message, attr: AttrType) -> Result<u64> {
    let value = m.get(attr).map_err(malformed)?;
    let bytes: [u8; TIE_BREAKER_SIZE] = value
        .as_slice()
        .try_into()
        .map_err(|_| Error::ErrAttributeMalformed(attr.0))?;
    Ok(u64::from_be_bytes(bytes))
}
