//! Protocol client: the handshake/connected state machine a single client
//! drives against the candidate servers listed in its connect token. See
//! [`Client`].

use std::time::{Duration, Instant};

use cute_net_transport::transport::Transport;
use log::debug;

use crate::{
    config::ClientConfig,
    crypto::Crypto,
    endpoint::Endpoint,
    packet::{self, Packet, CHALLENGE_DATA_LEN},
    replay::ReplayBuffer,
    token::ConnectToken,
};

/// Client connection state. Positive values are in-progress or connected;
/// zero is idle; negative values are terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ClientState {
    /// Token expired before the handshake completed.
    ConnectTokenExpired = -6,
    /// The connect token itself failed validation.
    InvalidConnectToken = -5,
    /// No packet arrived from the candidate within `connection_timeout`
    /// during the connected phase.
    ConnectionTimedOut = -4,
    /// No CONNECTION_ACCEPTED arrived within `handshake_timeout`.
    ChallengeResponseTimedOut = -3,
    /// No CHALLENGE_REQUEST arrived within `handshake_timeout`.
    ConnectionRequestTimedOut = -2,
    /// Every candidate server refused the connection.
    ConnectionDenied = -1,
    /// Not connected and not attempting to connect.
    Disconnected = 0,
    /// Retransmitting the CONNECT_TOKEN packet to the current candidate.
    SendingConnectionRequest = 1,
    /// Retransmitting a CHALLENGE_RESPONSE to the current candidate.
    SendingChallengeResponse = 2,
    /// Handshake complete; PAYLOAD sends are allowed.
    Connected = 3,
}

impl ClientState {
    /// `true` for [`ClientState::Disconnected`] and any negative (terminal
    /// failure) state — the client is not mid-handshake or connected.
    #[must_use]
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Disconnected) || (self as i8) < 0
    }
}

enum Phase {
    SendingConnectionRequest {
        tentative_failure: ClientState,
    },
    SendingChallengeResponse {
        challenge_nonce: u64,
        challenge_data: [u8; CHALLENGE_DATA_LEN],
    },
    Connected {
        max_clients: u32,
        connection_timeout_secs: u32,
    },
}

/// Protocol client, driven by repeated calls to [`Client::update`].
pub struct Client<C: Crypto> {
    config: ClientConfig,
    crypto: C,
    token: ConnectToken,
    candidate_index: usize,
    phase: Phase,
    state: ClientState,
    replay: ReplayBuffer,
    outgoing_sequence: u64,
    last_sent: Option<Instant>,
    last_recv: Instant,
    transport: Transport,
}

impl<C: Crypto> Client<C> {
    /// Starts a handshake attempt against the connect token's first
    /// candidate server.
    #[must_use]
    pub fn new(config: ClientConfig, crypto: C, token: ConnectToken, now: Instant) -> Self {
        Self {
            transport: Transport::new(config.transport),
            config,
            crypto,
            token,
            candidate_index: 0,
            phase: Phase::SendingConnectionRequest {
                tentative_failure: ClientState::ConnectionRequestTimedOut,
            },
            state: ClientState::SendingConnectionRequest,
            replay: ReplayBuffer::new(),
            outgoing_sequence: 0,
            last_sent: None,
            last_recv: now,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    fn current_candidate(&self) -> Option<Endpoint> {
        self.token.endpoints.get(self.candidate_index).copied()
    }

    /// The connected server's configured client capacity, once known.
    #[must_use]
    pub fn server_max_clients(&self) -> Option<u32> {
        match self.phase {
            Phase::Connected { max_clients, .. } => Some(max_clients),
            _ => None,
        }
    }

    /// Drives one tick: retransmits handshake/keepalive packets as needed,
    /// processes `incoming` datagrams (which must all be from the current
    /// candidate), and ages out on timeout.
    pub fn update(
        &mut self,
        now: Instant,
        unix_now: u64,
        incoming: impl IntoIterator<Item = Vec<u8>>,
        sink: &mut impl FnMut(&[u8]),
    ) {
        if self.state.is_idle() {
            return;
        }

        let mid_handshake = matches!(
            self.phase,
            Phase::SendingConnectionRequest { .. } | Phase::SendingChallengeResponse { .. }
        );
        if mid_handshake && unix_now >= self.token.expiration_timestamp {
            self.fail(ClientState::ConnectTokenExpired, sink);
            return;
        }

        for bytes in incoming {
            self.handle_datagram(now, &bytes, sink);
            if self.state.is_idle() {
                return;
            }
        }

        self.check_timeouts(now, sink);
        if self.state.is_idle() {
            return;
        }
        self.send_periodic(now, sink);
    }

    fn handle_datagram(&mut self, now: Instant, bytes: &[u8], sink: &mut impl FnMut(&[u8])) {
        let key = self.token.server_to_client_key;
        let Ok(packet) = packet::read(&self.crypto, &key, bytes, &mut self.replay) else {
            return;
        };
        self.last_recv = now;

        match (&self.phase, packet) {
            (Phase::SendingConnectionRequest { .. }, Packet::ChallengeRequest { challenge_nonce, challenge_data }) => {
                self.phase = Phase::SendingChallengeResponse {
                    challenge_nonce,
                    challenge_data,
                };
                self.state = ClientState::SendingChallengeResponse;
                self.last_sent = None;
            }
            (
                Phase::SendingChallengeResponse { .. },
                Packet::ConnectionAccepted {
                    max_clients,
                    connection_timeout_secs,
                    ..
                },
            ) => {
                self.phase = Phase::Connected {
                    max_clients,
                    connection_timeout_secs,
                };
                self.state = ClientState::Connected;
                self.last_sent = None;
            }
            (Phase::SendingConnectionRequest { .. } | Phase::SendingChallengeResponse { .. }, Packet::ConnectionDenied) => {
                self.advance_candidate(now, ClientState::ConnectionDenied);
            }
            (Phase::Connected { .. }, Packet::Disconnect) => {
                self.state = ClientState::Disconnected;
            }
            (Phase::Connected { .. }, Packet::Keepalive) => {}
            (Phase::Connected { .. }, Packet::Payload(payload)) => {
                let _ = self.transport.receive(now, &payload);
            }
            _ => {}
        }
    }

    fn check_timeouts(&mut self, now: Instant, sink: &mut impl FnMut(&[u8])) {
        match self.phase {
            Phase::SendingConnectionRequest { tentative_failure } => {
                if now.saturating_duration_since(self.last_recv)
                    >= Duration::from_secs(u64::from(self.token.handshake_timeout))
                {
                    self.advance_candidate(now, tentative_failure);
                }
            }
            Phase::SendingChallengeResponse { .. } => {
                if now.saturating_duration_since(self.last_recv)
                    >= Duration::from_secs(u64::from(self.token.handshake_timeout))
                {
                    self.advance_candidate(now, ClientState::ChallengeResponseTimedOut);
                }
            }
            Phase::Connected { connection_timeout_secs, .. } => {
                if now.saturating_duration_since(self.last_recv) >= Duration::from_secs(u64::from(connection_timeout_secs)) {
                    debug!("connection timed out, no packet received in {connection_timeout_secs}s");
                    self.fail(ClientState::ConnectionTimedOut, sink);
                }
            }
        }
    }

    fn advance_candidate(&mut self, now: Instant, terminal_if_exhausted: ClientState) {
        self.candidate_index += 1;
        let Some(next) = self.current_candidate() else {
            debug!("exhausted candidate servers, giving up as {terminal_if_exhausted:?}");
            self.state = terminal_if_exhausted;
            return;
        };
        debug!("advancing to candidate server {next:?}");
        self.phase = Phase::SendingConnectionRequest {
            tentative_failure: ClientState::ConnectionRequestTimedOut,
        };
        self.state = ClientState::SendingConnectionRequest;
        self.last_recv = now;
        self.last_sent = None;
        self.replay = ReplayBuffer::new();
    }

    fn send_periodic(&mut self, now: Instant, sink: &mut impl FnMut(&[u8])) {
        let due = self
            .last_sent
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.send_rate);
        if !due {
            return;
        }
        self.last_sent = Some(now);

        match self.phase {
            Phase::SendingConnectionRequest { .. } => {
                sink(&self.token.packet);
            }
            Phase::SendingChallengeResponse {
                challenge_nonce,
                challenge_data,
            } => {
                self.send_plain(
                    sink,
                    &Packet::ChallengeResponse {
                        challenge_nonce,
                        challenge_data,
                    },
                );
            }
            Phase::Connected { .. } => {
                self.send_plain(sink, &Packet::Keepalive);
                let key = self.token.client_to_server_key;
                let mut seq = self.outgoing_sequence;
                self.transport.update(now, &mut |bytes: &[u8]| {
                    let framed = packet::write(&self.crypto, &key, seq, &Packet::Payload(bytes.to_vec()));
                    seq += 1;
                    sink(&framed);
                });
                self.outgoing_sequence = seq;
            }
        }
    }

    fn send_plain(&mut self, sink: &mut impl FnMut(&[u8]), packet: &Packet) {
        let key = self.token.client_to_server_key;
        let framed = packet::write(&self.crypto, &key, self.outgoing_sequence, packet);
        self.outgoing_sequence += 1;
        sink(&framed);
    }

    fn fail(&mut self, state: ClientState, sink: &mut impl FnMut(&[u8])) {
        for _ in 0..10 {
            self.send_plain(sink, &Packet::Disconnect);
        }
        self.state = state;
    }

    /// Submits a PAYLOAD for delivery.
    ///
    /// # Errors
    /// Fails if the client isn't [`ClientState::Connected`], or the
    /// transport rejects the send.
    pub fn send(
        &mut self,
        now: Instant,
        sink: &mut impl FnMut(&[u8]),
        bytes: &[u8],
        reliable: bool,
    ) -> Result<(), SendError> {
        if self.state != ClientState::Connected {
            return Err(SendError::NotConnected);
        }
        let key = self.token.client_to_server_key;
        let mut seq = self.outgoing_sequence;
        self.transport
            .send(
                now,
                &mut |bytes: &[u8]| {
                    let framed = packet::write(&self.crypto, &key, seq, &Packet::Payload(bytes.to_vec()));
                    seq += 1;
                    sink(&framed);
                },
                bytes,
                reliable,
            )
            .map_err(SendError::Transport)?;
        self.outgoing_sequence = seq;
        Ok(())
    }

    /// Pops the next fully reassembled reliable-in-order message, if ready.
    pub fn receive_reliable(&mut self) -> Option<Vec<u8>> {
        self.transport.receive_reliable()
    }

    /// Pops the next fully reassembled fire-and-forget message, if ready.
    pub fn receive_fire_and_forget(&mut self) -> Option<Vec<u8>> {
        self.transport.receive_fire_and_forget()
    }

    /// Sends 10 redundant DISCONNECTs and clears queues. Idempotent: calling
    /// this more than once has the same observable effect as once.
    pub fn disconnect(&mut self, sink: &mut impl FnMut(&[u8])) {
        if self.state == ClientState::Connected {
            for _ in 0..10 {
                self.send_plain(sink, &Packet::Disconnect);
            }
        }
        self.state = ClientState::Disconnected;
    }
}

/// Failure from [`Client::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The client isn't [`ClientState::Connected`].
    #[error("client not connected")]
    NotConnected,
    /// The transport layer rejected the send.
    #[error(transparent)]
    Transport(#[from] cute_net_transport::transport::SendError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::DefaultCrypto, endpoint::Endpoint, token};

    fn token_for(mut crypto: DefaultCrypto, secret_key: &crate::crypto::SecretKey, endpoint: Endpoint) -> ConnectToken {
        let c2s = crypto.generate_symmetric_key();
        let s2c = crypto.generate_symmetric_key();
        let blob = token::generate(&crypto, 1, 0, c2s, s2c, 1_000_000, 10, &[endpoint], 7, [0u8; 256], secret_key).unwrap();
        token::client_read_rest(&blob, 1, 0).unwrap()
    }

    #[test]
    fn starts_sending_connection_request() {
        let mut crypto = DefaultCrypto;
        let (_, sk) = crypto.sign_keygen();
        let endpoint = Endpoint::V4 {
            octets: [127, 0, 0, 1],
            port: 4000,
        };
        let token = token_for(crypto, &sk, endpoint);
        let client = Client::new(ClientConfig::default(), DefaultCrypto, token, Instant::now());
        assert_eq!(ClientState::SendingConnectionRequest, client.state());
    }

    #[test]
    fn exhausting_candidates_denies_connection() {
        let mut crypto = DefaultCrypto;
        let (_, sk) = crypto.sign_keygen();
        let endpoint = Endpoint::V4 {
            octets: [127, 0, 0, 1],
            port: 4000,
        };
        let token = token_for(crypto, &sk, endpoint);
        let mut client = Client::new(ClientConfig::default(), DefaultCrypto, token, Instant::now());

        let key = client.token.server_to_client_key;
        let denied = packet::write(&DefaultCrypto, &key, 0, &Packet::ConnectionDenied);

        let now = Instant::now();
        let mut out = Vec::new();
        client.update(now, 0, [denied], &mut |bytes: &[u8]| out.push(bytes.to_vec()));
        assert_eq!(ClientState::ConnectionDenied, client.state());
    }
}
