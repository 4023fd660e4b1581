
use crc::{CRC_32_ISCSI, Crc};
use serde::{Deserialize, Serialize};
use shared::error::*;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::ice::rand::generate_cand_id;

/// Protocol tag carried by every candidate this transport produces or accepts.
pub const QUIC_PROTOCOL_NAME: &str = "quic-transport";

/// Component id used by a single component transport.
pub const ICE_CANDIDATE_COMPONENT_DEFAULT: u16 = 1;

/// Largest component id the priority formula admits.
pub const MAX_ICE_CANDIDATE_COMPONENT: u16 = 256;

/// Port of the placeholder candidate signaled when no listen socket could be created.
pub(crate) const DISCARD_PORT: u16 = 9;

pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Represents the type of candidate `CandidateType` enum.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    #[default]
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

// String makes CandidateType printable
impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

impl TryFrom<&str> for CandidateType {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateType::Host),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(Error::ErrUnknownCandidateType),
        }
    }
}

impl CandidateType {
    /// Returns the preference weight of a `CandidateType`.
    ///
    /// 4.1.2.2.  Guidelines for Choosing Type and Local Preferences
    /// The RECOMMENDED values are 126 for host candidates, 110 for peer
    /// reflexive candidates, and 0 for relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::Relay => 0,
        }
    }
}

/// The config required to create a new [`Candidate`].
///
/// Empty `candidate_id`, `protocol` and `foundation`, and a zero `priority`,
/// are filled in by [`CandidateConfig::new_candidate`].
#[derive(Default, Debug, Clone)]
pub struct CandidateConfig {
    pub candidate_id: String,
    pub candidate_type: CandidateType,
    pub protocol: String,
    pub address: String,
    pub port: u16,
    pub component: u16,
    pub priority: u32,
    pub foundation: String,
    pub generation: u32,
    pub network_id: u16,
    pub network_name: String,
    pub username: String,
    pub password: String,
    pub related_address: Option<SocketAddr>,
}

impl CandidateConfig {
    /// Creates a new candidate. The result is immutable; changing any field
    /// means building another one.
    pub fn new_candidate(self) -> Result<Candidate> {
        let ip: IpAddr = self.address.parse()?;

        let candidate_id = if self.candidate_id.is_empty() {
            generate_cand_id()
        } else {
            self.candidate_id
        };
        let protocol = if self.protocol.is_empty() {
            QUIC_PROTOCOL_NAME.to_owned()
        } else {
            self.protocol
        };
        let component = if self.component == 0 {
            ICE_CANDIDATE_COMPONENT_DEFAULT
        } else {
            validate_component(self.component)?
        };

        let foundation = if self.foundation.is_empty() {
            compute_foundation(self.candidate_type, &protocol, &ip, &self.network_name)
        } else {
            self.foundation
        };
        let priority = if self.priority == 0 {
            compute_priority(self.candidate_type, DEFAULT_LOCAL_PREFERENCE, component)
        } else {
            self.priority
        };

        Ok(Candidate {
            id: candidate_id,
            candidate_type: self.candidate_type,
            protocol,
            address: SocketAddr::new(ip, self.port),
            component,
            priority,
            foundation,
            generation: self.generation,
            network_id: self.network_id,
            network_name: self.network_name,
            username: self.username,
            password: self.password,
            related_address: self.related_address,
        })
    }
}

/// The foundation groups candidates of the same type, protocol and base
/// network so that they can be frozen and unfrozen together.
pub(crate) fn compute_foundation(
    candidate_type: CandidateType,
    protocol: &str,
    ip: &IpAddr,
    network_name: &str,
) -> String {
    let mut buf = vec![];
    buf.extend_from_slice(candidate_type.to_string().as_bytes());
    buf.extend_from_slice(protocol.as_bytes());
    buf.extend_from_slice(ip.to_string().as_bytes());
    buf.extend_from_slice(network_name.as_bytes());

    let checksum = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&buf);

    format!("{checksum}")
}

/// Component ids are 1-based and must leave `256 - component` non negative.
pub(crate) fn validate_component(component: u16) -> Result<u16> {
    if component == 0 || component > MAX_ICE_CANDIDATE_COMPONENT {
        Err(Error::ErrInvalidCandidateComponent(component))
    } else {
        Ok(component)
    }
}

/// RFC 8445 section 5.1.2.1:
/// priority = (2^24)*(type preference) + (2^8)*(local preference) + (2^0)*(256 - component ID)
pub(crate) fn compute_priority(
    candidate_type: CandidateType,
    local_preference: u16,
    component: u16,
) -> u32 {
    (1 << 24) * u32::from(candidate_type.preference())
        + (1 << 8) * u32::from(local_preference)
        + (256 - u32::from(component))
}

/// A local or remote transport address eligible for connectivity checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    id: String,
    candidate_type: CandidateType,
    protocol: String,
    address: SocketAddr,
    component: u16,
    priority: u32,
    foundation: String,
    generation: u32,
    network_id: u16,
    network_name: String,
    username: String,
    password: String,
    related_address: Option<SocketAddr>,
}

// String makes the Candidate printable
impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(related_address) = self.related_address {
            write!(
                f,
                "{} {} {} related {}",
                self.protocol, self.candidate_type, self.address, related_address
            )
        } else {
            write!(f, "{} {} {}", self.protocol, self.candidate_type, self.address)
        }
    }
}

impl Candidate {
    /// Returns Candidate ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns candidate type.
    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    /// Returns the protocol tag, `quic-transport` for candidates of this transport.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Returns the transport address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns candidate component.
    pub fn component(&self) -> u16 {
        self.component
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn network_id(&self) -> u16 {
        self.network_id
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Returns the ICE username fragment the candidate was gathered under.
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn related_address(&self) -> Option<SocketAddr> {
        self.related_address
    }

    /// Two candidates are equal when they describe the same transport address
    /// of the same type, protocol and component.
    pub fn equal(&self, other: &Candidate) -> bool {
        self.candidate_type == other.candidate_type
            && self.protocol == other.protocol
            && self.address == other.address
            && self.component == other.component
    }

    /// Returns the string representation of the candidate, in the form of
    /// the `candidate` SDP attribute value.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.candidate_type
        );

        if let Some(related_address) = self.related_address {
            val += format!(
                " raddr {} rport {}",
                related_address.ip(),
                related_address.port(),
            )
            .as_str();
        }

        val += format!(" generation {}", self.generation).as_str();

        if !self.username.is_empty() {
            val += format!(" ufrag {}", self.username).as_str();
        }

        if self.network_id != 0 {
            val += format!(" network-id {}", self.network_id).as_str();
        }

        val
    }
}

/// Creates a Candidate from its string representation.
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let raw = raw.strip_prefix("candidate:").unwrap_or(raw);
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::ErrAttributeTooShortIceCandidate);
    }

    // Foundation
    let foundation = split[0].to_owned();

    // Component
    let component = validate_component(split[1].parse()?)?;

    // Protocol
    let protocol = split[2].to_owned();

    // Priority
    let priority: u32 = split[3].parse()?;

    // Address
    let address = split[4].to_owned();

    // Port
    let port: u16 = split[5].parse()?;

    if split[6] != "typ" {
        return Err(Error::ErrUnknownCandidateType);
    }
    let candidate_type = CandidateType::try_from(split[7])?;

    let mut rel_addr: Option<IpAddr> = None;
    let mut rel_port: Option<u16> = None;
    let mut generation = 0;
    let mut username = String::new();
    let mut network_id = 0;

    // the remaining tokens are key/value pairs
    for pair in split[8..].chunks(2) {
        let [key, value] = pair else {
            return Err(Error::ErrAttributeTooShortIceCandidate);
        };
        match *key {
            "raddr" => rel_addr = Some(value.parse()?),
            "rport" => rel_port = Some(value.parse()?),
            "generation" => generation = value.parse()?,
            "ufrag" => username = (*value).to_owned(),
            "network-id" => network_id = value.parse()?,
            _ => {}
        }
    }

    let related_address = match (rel_addr, rel_port) {
        (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
        (None, None) => None,
        _ => return Err(Error::ErrParseRelatedAddr),
    };

    CandidateConfig {
        candidate_type,
        protocol,
        address,
        port,
        component,
        priority,
        foundation,
        generation,
        network_id,
        username,
        related_address,
        ..CandidateConfig::default()
    }
    .new_candidate()
}
