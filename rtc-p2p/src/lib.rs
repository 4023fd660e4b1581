#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod candidate;
pub mod checker;
pub mod connection;
pub mod context;
pub mod handshake;
pub mod ice;
pub mod message;
pub mod port;
pub mod socket;
pub mod transport_channel;
pub mod vnet;

pub use transport_channel::{
    DataChannelMessage, SendDataParams, SentPacket, TransportChannel, TransportChannelConfig,
    TransportChannelEvent,
};
