//! Protocol server: the peer-facing state machine that turns connect
//! tokens and framed packets into connected client slots. See [`Server`].
//!
//! The core stays free of actual socket I/O, mirroring how
//! [`cute_net_transport::transport::Transport`] is driven through a caller-
//! supplied sink rather than owning a socket: a tick hands in the
//! datagrams received since the last call and a [`DatagramSink`] to send
//! through, leaving the UDP socket itself to the embedding application.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    time::{Duration, Instant},
};

use cute_net_transport::{
    handle::{Handle, HandleTable},
    transport::Transport,
};
use log::{debug, trace, warn};

use crate::{
    config::ServerConfig,
    crypto::{Crypto, SymmetricKey, SIGNATURE_LEN},
    endpoint::Endpoint,
    packet::{self, Packet, CHALLENGE_DATA_LEN, CONNECT_TOKEN_TAG},
    replay::ReplayBuffer,
    token,
};

/// Destination for datagrams a [`Server`] wants to send.
///
/// Plays the same role [`cute_net_transport::transport::PacketSink`] plays
/// for one connection, generalized to address a peer by [`SocketAddr`]
/// since a server multiplexes many.
pub trait DatagramSink {
    /// Sends one datagram to `to`.
    fn send_to(&mut self, to: SocketAddr, bytes: &[u8]);
}

impl<F: FnMut(SocketAddr, &[u8])> DatagramSink for F {
    fn send_to(&mut self, to: SocketAddr, bytes: &[u8]) {
        self(to, bytes);
    }
}

/// An event produced by [`Server::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client finished its handshake and was assigned this slot.
    NewConnection {
        /// The newly connected client's slot.
        slot: Handle,
        /// Client id carried by its connect token.
        client_id: u64,
    },
    /// A connected client's slot was freed.
    Disconnected {
        /// The slot that was freed.
        slot: Handle,
    },
    /// An application payload arrived from a connected client.
    Payload {
        /// The sending client's slot.
        slot: Handle,
        /// Payload bytes.
        bytes: Vec<u8>,
    },
}

struct EncryptionEntry {
    client_id: u64,
    client_to_server_key: SymmetricKey,
    server_to_client_key: SymmetricKey,
    handshake_timeout: Duration,
    token_expiration: u64,
    token_signature: [u8; SIGNATURE_LEN],
    outgoing_sequence: u64,
    replay: ReplayBuffer,
    last_recv: Instant,
    last_challenge_sent: Option<Instant>,
    challenge_nonce: u64,
    challenge_data: [u8; CHALLENGE_DATA_LEN],
}

struct ClientSlot {
    client_id: u64,
    endpoint: SocketAddr,
    client_to_server_key: SymmetricKey,
    server_to_client_key: SymmetricKey,
    outgoing_sequence: u64,
    replay: ReplayBuffer,
    confirmed: bool,
    last_recv: Instant,
    last_sent: Option<Instant>,
    transport: Transport,
}

struct TokenCache {
    capacity: usize,
    order: VecDeque<[u8; SIGNATURE_LEN]>,
    seen: HashSet<[u8; SIGNATURE_LEN]>,
}

impl TokenCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, signature: &[u8; SIGNATURE_LEN]) -> bool {
        self.seen.contains(signature)
    }

    fn insert(&mut self, signature: [u8; SIGNATURE_LEN]) {
        if self.seen.insert(signature) {
            self.order.push_back(signature);
            if self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
    }
}

/// Default token-cache capacity, a multiple of `max_clients` so a churn of
/// reconnects doesn't evict a still-relevant signature.
const TOKEN_CACHE_FACTOR: usize = 8;

/// Protocol server. Owns every connected client slot, the in-progress
/// handshake table (the "encryption map"), and the token-replay cache.
pub struct Server<C: Crypto> {
    config: ServerConfig,
    crypto: C,
    bind_endpoint: Endpoint,

    encryption_map: HashMap<SocketAddr, EncryptionEntry>,
    slots: HandleTable<ClientSlot>,
    endpoint_to_slot: HashMap<SocketAddr, Handle>,
    connected_client_ids: HashSet<u64>,
    token_cache: TokenCache,
    challenge_nonce_counter: u64,
}

impl<C: Crypto> Server<C> {
    /// Creates a server that will only accept connect tokens listing
    /// `bind_endpoint` among their candidate servers.
    #[must_use]
    pub fn new(config: ServerConfig, crypto: C, bind_endpoint: Endpoint) -> Self {
        let token_cache_capacity = TOKEN_CACHE_FACTOR * config.max_clients;
        Self {
            config,
            crypto,
            bind_endpoint,
            encryption_map: HashMap::new(),
            slots: HandleTable::new(),
            endpoint_to_slot: HashMap::new(),
            connected_client_ids: HashSet::new(),
            token_cache: TokenCache::new(token_cache_capacity),
            challenge_nonce_counter: 0,
        }
    }

    /// Number of currently connected (or handshaking-but-slotted) clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.slots.len()
    }

    /// Sends a PAYLOAD to `slot` over the reliable or fire-and-forget lane.
    ///
    /// # Errors
    /// Fails if `slot` doesn't refer to a connected client.
    pub fn send(
        &mut self,
        now: Instant,
        sink: &mut impl DatagramSink,
        slot: Handle,
        bytes: &[u8],
        reliable: bool,
    ) -> Result<(), SendToSlotError> {
        let Self { crypto, slots, .. } = self;
        let client = slots.get_mut(slot).ok_or(SendToSlotError::NotConnected)?;
        let endpoint = client.endpoint;
        let key = client.server_to_client_key;
        let mut seq = client.outgoing_sequence;
        client
            .transport
            .send(now, &mut |bytes: &[u8]| {
                Self::send_payload_framed(&*crypto, &key, &mut seq, endpoint, bytes, sink);
            }, bytes, reliable)
            .map_err(SendToSlotError::Transport)?;
        client.outgoing_sequence = seq;
        Ok(())
    }

    fn send_payload_framed(
        crypto: &C,
        key: &SymmetricKey,
        sequence: &mut u64,
        endpoint: SocketAddr,
        transport_bytes: &[u8],
        sink: &mut impl DatagramSink,
    ) {
        let framed = packet::write(crypto, key, *sequence, &Packet::Payload(transport_bytes.to_vec()));
        *sequence += 1;
        sink.send_to(endpoint, &framed);
    }

    fn send_plain(
        &mut self,
        sink: &mut impl DatagramSink,
        endpoint: SocketAddr,
        key: &SymmetricKey,
        sequence: &mut u64,
        packet: &Packet,
    ) {
        let framed = packet::write(&self.crypto, key, *sequence, packet);
        *sequence += 1;
        sink.send_to(endpoint, &framed);
    }

    /// Drives one tick: processes `incoming` datagrams, advances handshake
    /// and keepalive timers, ages out stale handshakes, and returns the
    /// events produced.
    pub fn update(
        &mut self,
        now: Instant,
        unix_now: u64,
        incoming: impl IntoIterator<Item = (SocketAddr, Vec<u8>)>,
        sink: &mut impl DatagramSink,
    ) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        for (from, bytes) in incoming {
            self.handle_datagram(now, unix_now, from, &bytes, sink, &mut events);
        }

        self.send_pending_challenges(now, sink);
        self.service_slots(now, sink, &mut events);
        self.age_out_handshakes(now, unix_now);

        events
    }

    fn handle_datagram(
        &mut self,
        now: Instant,
        unix_now: u64,
        from: SocketAddr,
        bytes: &[u8],
        sink: &mut impl DatagramSink,
        events: &mut Vec<ServerEvent>,
    ) {
        if bytes.first() == Some(&CONNECT_TOKEN_TAG) && bytes.len() == token::PACKET_LEN {
            self.handle_connect_token(now, unix_now, from, bytes, sink);
            return;
        }

        if let Some(&slot) = self.endpoint_to_slot.get(&from) {
            self.handle_slot_datagram(now, slot, bytes, events);
            return;
        }

        self.handle_handshake_datagram(now, from, bytes, sink, events);
    }

    fn handle_connect_token(
        &mut self,
        now: Instant,
        unix_now: u64,
        from: SocketAddr,
        bytes: &[u8],
        sink: &mut impl DatagramSink,
    ) {
        if self.encryption_map.contains_key(&from) {
            trace!("duplicate connect token from {from}, ignoring");
            return;
        }

        let mut packet = [0u8; token::PACKET_LEN];
        packet.copy_from_slice(bytes);

        let decrypted = match token::server_decrypt_connect_token(
            &self.crypto,
            &packet,
            &self.config.public_key,
            &self.config.secret_key,
            self.config.application_id,
            unix_now,
        ) {
            Ok(decrypted) => decrypted,
            Err(err) => {
                debug!("rejected connect token from {from}: {err}");
                return;
            }
        };

        if !decrypted.endpoints.contains(&self.bind_endpoint) {
            debug!("connect token from {from} doesn't list this server");
            return;
        }
        if self.endpoint_to_slot.contains_key(&from) || self.connected_client_ids.contains(&decrypted.client_id)
        {
            debug!("connect token from {from} already connected");
            return;
        }
        if self.token_cache.contains(&decrypted.signature) {
            debug!("connect token from {from} already consumed");
            return;
        }

        if self.slots.len() >= self.config.max_clients {
            let mut seq = 0u64;
            self.send_plain(
                sink,
                from,
                &decrypted.server_to_client_key,
                &mut seq,
                &Packet::ConnectionDenied,
            );
            return;
        }

        self.encryption_map.insert(
            from,
            EncryptionEntry {
                client_id: decrypted.client_id,
                client_to_server_key: decrypted.client_to_server_key,
                server_to_client_key: decrypted.server_to_client_key,
                handshake_timeout: Duration::from_secs(u64::from(decrypted.handshake_timeout)),
                token_expiration: decrypted.expiration_timestamp,
                token_signature: decrypted.signature,
                outgoing_sequence: 0,
                replay: ReplayBuffer::new(),
                last_recv: now,
                last_challenge_sent: None,
                challenge_nonce: 0,
                challenge_data: [0u8; CHALLENGE_DATA_LEN],
            },
        );
    }

    fn handle_handshake_datagram(
        &mut self,
        now: Instant,
        from: SocketAddr,
        bytes: &[u8],
        sink: &mut impl DatagramSink,
        events: &mut Vec<ServerEvent>,
    ) {
        let Some(entry) = self.encryption_map.get_mut(&from) else {
            return;
        };
        let key = entry.client_to_server_key;
        let Ok(packet) = packet::read(&self.crypto, &key, bytes, &mut entry.replay) else {
            return;
        };
        entry.last_recv = now;

        let Packet::ChallengeResponse {
            challenge_nonce,
            challenge_data,
        } = packet
        else {
            return;
        };
        if challenge_nonce != entry.challenge_nonce || challenge_data != entry.challenge_data {
            return;
        }

        let has_capacity = self.slots.len() < self.config.max_clients;
        let client_id_free = !self.connected_client_ids.contains(&entry.client_id);

        if !has_capacity || !client_id_free {
            let s2c = entry.server_to_client_key;
            let mut seq = entry.outgoing_sequence;
            self.send_plain(sink, from, &s2c, &mut seq, &Packet::ConnectionDenied);
            return;
        }

        let entry = self.encryption_map.remove(&from).expect("just looked up");
        let handle = self.slots.insert(ClientSlot {
            client_id: entry.client_id,
            endpoint: from,
            client_to_server_key: entry.client_to_server_key,
            server_to_client_key: entry.server_to_client_key,
            outgoing_sequence: entry.outgoing_sequence,
            replay: entry.replay,
            confirmed: false,
            last_recv: now,
            last_sent: None,
            transport: Transport::new(self.config.transport),
        });
        self.endpoint_to_slot.insert(from, handle);
        self.connected_client_ids.insert(entry.client_id);
        self.token_cache.insert(entry.token_signature);

        events.push(ServerEvent::NewConnection {
            slot: handle,
            client_id: entry.client_id,
        });
        self.send_connection_accepted(now, handle, sink);
    }

    fn handle_slot_datagram(&mut self, now: Instant, slot: Handle, bytes: &[u8], events: &mut Vec<ServerEvent>) {
        let Some(client) = self.slots.get_mut(slot) else {
            return;
        };
        let key = client.client_to_server_key;
        let Ok(packet) = packet::read(&self.crypto, &key, bytes, &mut client.replay) else {
            return;
        };
        client.last_recv = now;
        client.confirmed = true;

        match packet {
            Packet::Keepalive => {}
            Packet::Disconnect => {
                self.drop_slot(slot, events);
            }
            Packet::Payload(payload) => {
                if client.transport.receive(now, &payload).is_err() {
                    warn!("malformed transport fragment from slot {slot:?}");
                    return;
                }
                while let Some(bytes) = client.transport.receive_reliable() {
                    events.push(ServerEvent::Payload { slot, bytes });
                }
                while let Some(bytes) = client.transport.receive_fire_and_forget() {
                    events.push(ServerEvent::Payload { slot, bytes });
                }
            }
            Packet::ConnectionAccepted { .. }
            | Packet::ConnectionDenied
            | Packet::ChallengeRequest { .. }
            | Packet::ChallengeResponse { .. } => {}
        }
    }

    fn send_pending_challenges(&mut self, now: Instant, sink: &mut impl DatagramSink) {
        let due: Vec<SocketAddr> = self
            .encryption_map
            .iter()
            .filter(|(_, entry)| {
                entry
                    .last_challenge_sent
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.config.send_rate)
            })
            .map(|(from, _)| *from)
            .collect();

        for from in due {
            let mut blob = [0u8; CHALLENGE_DATA_LEN];
            self.crypto.random_bytes(&mut blob);
            let nonce = self.challenge_nonce_counter;
            self.challenge_nonce_counter = self.challenge_nonce_counter.wrapping_add(1);

            let Some(entry) = self.encryption_map.get_mut(&from) else {
                continue;
            };
            entry.challenge_nonce = nonce;
            entry.challenge_data = blob;
            entry.last_challenge_sent = Some(now);
            let s2c = entry.server_to_client_key;
            let mut seq = entry.outgoing_sequence;
            self.send_plain(
                sink,
                from,
                &s2c,
                &mut seq,
                &Packet::ChallengeRequest {
                    challenge_nonce: nonce,
                    challenge_data: blob,
                },
            );
            if let Some(entry) = self.encryption_map.get_mut(&from) {
                entry.outgoing_sequence = seq;
            }
        }
    }

    fn send_connection_accepted(&mut self, now: Instant, slot: Handle, sink: &mut impl DatagramSink) {
        let max_clients = self.config.max_clients;
        let connection_timeout_secs = self.config.connection_timeout.as_secs();
        let Some(client) = self.slots.get_mut(slot) else {
            return;
        };
        client.last_sent = Some(now);
        let endpoint = client.endpoint;
        let key = client.server_to_client_key;
        let mut seq = client.outgoing_sequence;
        let client_id = client.client_id;
        self.send_plain(
            sink,
            endpoint,
            &key,
            &mut seq,
            &Packet::ConnectionAccepted {
                client_id,
                #[expect(clippy::cast_possible_truncation, reason = "max_clients <= 32")]
                max_clients: max_clients as u32,
                #[expect(clippy::cast_possible_truncation, reason = "fits comfortably in u32")]
                connection_timeout_secs: connection_timeout_secs as u32,
            },
        );
        if let Some(client) = self.slots.get_mut(slot) {
            client.outgoing_sequence = seq;
        }
    }

    fn service_slots(&mut self, now: Instant, sink: &mut impl DatagramSink, events: &mut Vec<ServerEvent>) {
        let handles: Vec<Handle> = self.slots.iter().map(|(handle, _)| handle).collect();
        for handle in handles {
            self.service_one_slot(now, handle, sink, events);
        }
    }

    fn service_one_slot(
        &mut self,
        now: Instant,
        handle: Handle,
        sink: &mut impl DatagramSink,
        events: &mut Vec<ServerEvent>,
    ) {
        {
            let Self { crypto, slots, .. } = self;
            let Some(client) = slots.get_mut(handle) else {
                return;
            };
            let endpoint = client.endpoint;
            let key = client.server_to_client_key;
            let mut seq = client.outgoing_sequence;
            client.transport.update(now, &mut |bytes: &[u8]| {
                Self::send_payload_framed(&*crypto, &key, &mut seq, endpoint, bytes, sink);
            });
            client.outgoing_sequence = seq;
        }

        if self
            .slots
            .get(handle)
            .is_some_and(|c| now.saturating_duration_since(c.last_recv) >= self.config.connection_timeout)
        {
            self.disconnect_slot_with_burst(handle, sink);
            self.drop_slot(handle, events);
            return;
        }

        let due = self.slots.get(handle).is_some_and(|c| {
            c.last_sent
                .map_or(true, |t| now.saturating_duration_since(t) >= self.config.send_rate)
        });
        if !due {
            return;
        }

        let confirmed = self.slots.get(handle).map(|c| c.confirmed);
        match confirmed {
            Some(true) => {
                let Some(client) = self.slots.get_mut(handle) else {
                    return;
                };
                client.last_sent = Some(now);
                let endpoint = client.endpoint;
                let key = client.server_to_client_key;
                let mut seq = client.outgoing_sequence;
                self.send_plain(sink, endpoint, &key, &mut seq, &Packet::Keepalive);
                if let Some(client) = self.slots.get_mut(handle) {
                    client.outgoing_sequence = seq;
                }
            }
            Some(false) => self.send_connection_accepted(now, handle, sink),
            None => {}
        }
    }

    fn disconnect_slot_with_burst(&mut self, handle: Handle, sink: &mut impl DatagramSink) {
        let Some(client) = self.slots.get_mut(handle) else {
            return;
        };
        let endpoint = client.endpoint;
        let key = client.server_to_client_key;
        let mut seq = client.outgoing_sequence;
        for _ in 0..10 {
            self.send_plain(sink, endpoint, &key, &mut seq, &Packet::Disconnect);
        }
        if let Some(client) = self.slots.get_mut(handle) {
            client.outgoing_sequence = seq;
        }
    }

    fn drop_slot(&mut self, handle: Handle, events: &mut Vec<ServerEvent>) {
        if let Some(client) = self.slots.remove(handle) {
            self.endpoint_to_slot.remove(&client.endpoint);
            self.connected_client_ids.remove(&client.client_id);
            events.push(ServerEvent::Disconnected { slot: handle });
        }
    }

    fn age_out_handshakes(&mut self, now: Instant, unix_now: u64) {
        let stale: Vec<SocketAddr> = self
            .encryption_map
            .iter()
            .filter(|(_, entry)| {
                now.saturating_duration_since(entry.last_recv) >= entry.handshake_timeout
                    || unix_now >= entry.token_expiration
            })
            .map(|(from, _)| *from)
            .collect();
        for from in stale {
            self.encryption_map.remove(&from);
        }
    }

    /// Force-disconnects every slot without sending further packets and
    /// resets internal bookkeeping.
    pub fn stop(&mut self) {
        self.slots = HandleTable::new();
        self.endpoint_to_slot.clear();
        self.connected_client_ids.clear();
        self.encryption_map.clear();
    }
}

/// Failure from [`Server::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendToSlotError {
    /// `slot` isn't a currently connected client.
    #[error("slot not connected")]
    NotConnected,
    /// The transport layer rejected the send.
    #[error(transparent)]
    Transport(#[from] cute_net_transport::transport::SendError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCrypto;

    fn server() -> Server<DefaultCrypto> {
        let mut crypto = DefaultCrypto;
        let (pk, sk) = crypto.sign_keygen();
        let config = ServerConfig::new(1, pk, sk);
        let bind = Endpoint::V4 {
            octets: [127, 0, 0, 1],
            port: 40000,
        };
        Server::new(config, crypto, bind)
    }

    #[test]
    fn rejects_connect_token_missing_own_endpoint() {
        let mut server = server();
        let mut crypto = DefaultCrypto;
        let other_endpoint = Endpoint::V4 {
            octets: [10, 0, 0, 1],
            port: 1,
        };
        let client_to_server_key = crypto.generate_symmetric_key();
        let server_to_client_key = crypto.generate_symmetric_key();
        let blob = token::generate(
            &crypto,
            1,
            0,
            client_to_server_key,
            server_to_client_key,
            1_000_000,
            10,
            &[other_endpoint],
            7,
            [0u8; 256],
            &server.config.secret_key,
        )
        .unwrap();
        let mut packet = [0u8; token::PACKET_LEN];
        packet.copy_from_slice(&blob[token::PREAMBLE_LEN..]);

        let mut sent = Vec::new();
        let from: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        server.update(
            Instant::now(),
            0,
            [(from, packet.to_vec())],
            &mut |to: SocketAddr, bytes: &[u8]| sent.push((to, bytes.to_vec())),
        );

        assert!(server.encryption_map.is_empty());
    }

    #[test]
    fn accepts_connect_token_for_own_endpoint() {
        let mut server = server();
        let crypto = DefaultCrypto;
        let blob = token::generate(
            &crypto,
            1,
            0,
            [1u8; 32],
            [2u8; 32],
            1_000_000,
            10,
            &[server.bind_endpoint],
            7,
            [0u8; 256],
            &server.config.secret_key,
        )
        .unwrap();
        let mut packet = [0u8; token::PACKET_LEN];
        packet.copy_from_slice(&blob[token::PREAMBLE_LEN..]);

        let from: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let mut sent = Vec::new();
        server.update(
            Instant::now(),
            0,
            [(from, packet.to_vec())],
            &mut |to: SocketAddr, bytes: &[u8]| sent.push((to, bytes.to_vec())),
        );

        assert_eq!(1, server.encryption_map.len());
        assert!(!sent.is_empty(), "expected an immediate challenge request");
    }
}
