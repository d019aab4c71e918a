//! Plain configuration structs for the server and client facades.
//!
//! No config-file parsing lives here — callers build these with plain
//! struct literals or `..Default::default()`, matching the "configuration
//! loading is out of scope" boundary; a caller wiring up `serde`/`figment`
//! on top of these types is free to do so outside this crate.

use std::time::Duration;

use crate::crypto::{PublicKey, SecretKey};
use cute_net_transport::transport::TransportConfig;

/// Maximum clients a server may ever be configured for.
pub const MAX_CLIENTS_CEILING: usize = 32;
/// Default rate at which handshake and keepalive packets are resent.
pub const DEFAULT_SEND_RATE: Duration = Duration::from_millis(100);
/// Default idle timeout before a connected client is dropped.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Application id; must match the connect token's and the client's.
    pub application_id: u64,
    /// Server's own bind endpoint, as listed in accepted connect tokens.
    pub max_clients: usize,
    /// Seconds of inactivity before an idle connected client is dropped.
    pub connection_timeout: Duration,
    /// Interval between reliable fragment resends.
    pub resend_rate: Duration,
    /// Rate at which handshake/keepalive packets are sent.
    pub send_rate: Duration,
    /// Server's signature keypair, used to verify connect tokens.
    pub public_key: PublicKey,
    /// Server's signature keypair, used to verify connect tokens.
    pub secret_key: SecretKey,
    /// Transport tunables shared with the reliability layer.
    pub transport: TransportConfig,
}

impl ServerConfig {
    /// Builds a config with the given identity and keys, all other fields
    /// defaulted.
    #[must_use]
    pub fn new(application_id: u64, public_key: PublicKey, secret_key: SecretKey) -> Self {
        Self {
            application_id,
            max_clients: MAX_CLIENTS_CEILING,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            resend_rate: cute_net_transport::transport::DEFAULT_RESEND_RATE,
            send_rate: DEFAULT_SEND_RATE,
            public_key,
            secret_key,
            transport: TransportConfig::default(),
        }
    }
}

/// Client-side configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Rate at which handshake/keepalive packets are sent.
    pub send_rate: Duration,
    /// Transport tunables shared with the reliability layer.
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_rate: DEFAULT_SEND_RATE,
            transport: TransportConfig::default(),
        }
    }
}
