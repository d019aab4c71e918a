//! Secure UDP client/server protocol for latency-sensitive games: connect
//! tokens, an encrypted handshake, and reliable-ordered plus unreliable
//! delivery on top of [`cute_net_transport`].
//!
//! This crate has no knowledge of sockets. [`server::Server`] and
//! [`client::Client`] are both I/O-free state machines: a tick hands in the
//! datagrams received since the last call and gets back a sink closure to
//! send through, leaving socket ownership to the embedding application.

pub mod client;
pub mod condition;
pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod replay;
pub mod server;
pub mod token;

pub use client::{Client, ClientState};
pub use condition::{Conditioner, ConditionerConfig};
pub use config::{ClientConfig, ServerConfig};
pub use crypto::{Crypto, DefaultCrypto};
pub use endpoint::Endpoint;
pub use error::{NetError, NetErrorCode};
pub use packet::Packet;
pub use server::{DatagramSink, Server, ServerEvent};
pub use token::{generate as generate_connect_token, ConnectToken};
