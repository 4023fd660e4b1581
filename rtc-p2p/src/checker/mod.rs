
pub mod stun_checker;

use bytes::BytesMut;
use shared::error::Result;
use std::net::SocketAddr;
use stun::error_code::{CODE_ROLE_CONFLICT, CODE_UNAUTHORIZED};

use crate::ice::IceRole;

pub use self::stun_checker::StunChecker;
pub use stun::message::TransactionId;

/// Error code sent back when both peers claim the same role.
pub const ROLE_CONFLICT_ERROR_CODE: u16 = CODE_ROLE_CONFLICT.0;
/// Error code sent back when a request fails authentication.
pub const UNAUTHORIZED_ERROR_CODE: u16 = CODE_UNAUTHORIZED.0;

/// The fields of an outgoing connectivity check request.
#[derive(Debug, Clone)]
pub struct CheckRequest<'a> {
    /// `remote_ufrag:local_ufrag`
    pub username: &'a str,
    /// Remote password, keys MESSAGE-INTEGRITY.
    pub password: &'a str,
    pub role: IceRole,
    pub tiebreaker: u64,
    pub priority: u32,
    pub use_candidate: bool,
}

/// A parsed connectivity check datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckMessage {
    Request {
        transaction_id: TransactionId,
        username: String,
        /// Claimed role and tiebreaker of the sender, if any.
        role: Option<(IceRole, u64)>,
        priority: Option<u32>,
        use_candidate: bool,
    },
    SuccessResponse {
        transaction_id: TransactionId,
        mapped_address: Option<SocketAddr>,
    },
    ErrorResponse {
        transaction_id: TransactionId,
        code: u16,
        reason: String,
    },
    Indication {
        transaction_id: TransactionId,
    },
}

impl CheckMessage {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            CheckMessage::Request { transaction_id, .. }
            | CheckMessage::SuccessResponse { transaction_id, .. }
            | CheckMessage::ErrorResponse { transaction_id, .. }
            | CheckMessage::Indication { transaction_id } => *transaction_id,
        }
    }
}

/// Builds and parses connectivity check datagrams.
///
/// Check traffic shares sockets with application data, so
/// [`is_check_message`](ConnectivityChecker::is_check_message) must be cheap
/// and must never claim a datagram produced by the data channel framing.
pub trait ConnectivityChecker {
    fn is_check_message(&self, datagram: &[u8]) -> bool;

    fn build_request(&self, request: &CheckRequest<'_>) -> Result<(TransactionId, BytesMut)>;

    fn build_success_response(
        &self,
        transaction_id: TransactionId,
        mapped_address: SocketAddr,
        password: &str,
    ) -> Result<BytesMut>;

    fn build_error_response(
        &self,
        transaction_id: TransactionId,
        code: u16,
        reason: &str,
        password: &str,
    ) -> Result<BytesMut>;

    fn build_indication(&self) -> Result<BytesMut>;

    /// Parses without authenticating.
    fn parse(&self, datagram: &[u8]) -> Result<CheckMessage>;

    /// Authenticates a datagram keyed with `password`.
    fn verify(&self, datagram: &[u8], password: &str) -> Result<()>;
}
