
pub mod rand;

use serde::{Deserialize, Serialize};
use shared::error::{Error, Result};
use std::fmt;

use self::rand::{generate_pwd, generate_ufrag};

/// Whether the local agent drives candidate selection and handshake initiation.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IceRole {
    #[serde(rename = "controlling")]
    Controlling,
    #[default]
    #[serde(rename = "controlled")]
    Controlled,
}

impl fmt::Display for IceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Controlling => "controlling",
            Self::Controlled => "controlled",
        };
        write!(f, "{s}")
    }
}

/// Credentials used to authenticate connectivity checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceParameters {
    pub ufrag: String,
    pub pwd: String,
}

impl IceParameters {
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }

    /// Fresh random local credentials.
    pub fn generate() -> Self {
        Self {
            ufrag: generate_ufrag(),
            pwd: generate_pwd(),
        }
    }

    /// The values MUST be unguessable, with at least 128 bits of random number
    /// generator output used to generate the password, and at least 24 bits of
    /// output to generate the username fragment.
    pub fn validate_local(&self) -> Result<()> {
        if self.ufrag.len() * 8 < 24 {
            return Err(Error::ErrLocalUfragInsufficientBits);
        }
        if self.pwd.len() * 8 < 128 {
            return Err(Error::ErrLocalPwdInsufficientBits);
        }
        Ok(())
    }

    pub fn validate_remote(&self) -> Result<()> {
        if self.ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        }
        if self.pwd.is_empty() {
            return Err(Error::ErrRemotePwdEmpty);
        }
        Ok(())
    }
}

/// Progress of local candidate gathering. Never regresses.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

impl fmt::Display for IceGatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::New => "new",
            Self::Gathering => "gathering",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// Aggregate connectivity of a transport channel.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportState {
    #[default]
    Init,
    Connecting,
    Completed,
    Failed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Init => "Init",
            Self::Connecting => "Connecting",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Both peers claimed the same ICE role in a connectivity check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RoleConflict {
    pub local_role: IceRole,
    pub local_tiebreaker: u64,
    pub remote_tiebreaker: u64,
}

impl RoleConflict {
    /// The agent with the larger tiebreaker ends up controlling.
    pub fn local_wins(&self) -> bool {
        self.local_tiebreaker >= self.remote_tiebreaker
    }

    /// The role the local agent should hold once the conflict is resolved.
    pub fn resolved_role(&self) -> IceRole {
        if self.local_wins() {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        }
    }
}
