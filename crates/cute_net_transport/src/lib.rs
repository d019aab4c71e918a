//! Reliability layer for the `cute_net` protocol: sequence buffers, the ack
//! system, fragmentation/reassembly, and the reliable/fire-and-forget
//! transport built on top of them.
//!
//! This crate has no knowledge of encryption, connect tokens, or sockets; it
//! only knows how to turn a stream of opaque byte payloads (handed to it by
//! a caller-supplied [`transport::PacketSink`]) into ordered, reassembled
//! messages, and vice versa.

pub mod ack;
pub mod frag;
pub mod handle;
pub mod lane;
pub mod rtt;
pub mod seq_buf;
pub mod transport;

pub use ack::{AckHeader, AckSystem};
pub use frag::{FragmentHeader, ReassembleError};
pub use handle::{Handle, HandleTable};
pub use rtt::RttEstimator;
pub use seq_buf::SeqBuf;
pub use transport::{PacketSink, ReceiveError, SendError, Transport, TransportConfig};
