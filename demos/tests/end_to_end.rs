//! Loopback scenarios driving a [`Client`]/[`Server`] pair through their
//! public API with no real sockets: datagrams are relayed by hand between
//! the two sides' sink closures.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use cute_net::{
    client::{Client, ClientState},
    config::{ClientConfig, ServerConfig},
    crypto::{Crypto, DefaultCrypto, PublicKey, SecretKey},
    endpoint::Endpoint,
    generate_connect_token,
    server::{Server, ServerEvent},
    token, ConnectToken,
};

const STEP: Duration = Duration::from_millis(20);

fn keypair() -> (PublicKey, SecretKey) {
    let mut crypto = DefaultCrypto;
    crypto.sign_keygen()
}

fn build_token(
    app_id: u64,
    sk: &SecretKey,
    endpoints: &[Endpoint],
    client_id: u64,
    expiration_timestamp: u64,
    handshake_timeout: u32,
) -> ConnectToken {
    let mut crypto = DefaultCrypto;
    let c2s = crypto.generate_symmetric_key();
    let s2c = crypto.generate_symmetric_key();
    let blob = generate_connect_token(
        &crypto,
        app_id,
        0,
        c2s,
        s2c,
        expiration_timestamp,
        handshake_timeout,
        endpoints,
        client_id,
        [0u8; 256],
        sk,
    )
    .unwrap();
    token::client_read_rest(&blob, app_id, 0).unwrap()
}

fn client_addr() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

struct Connected {
    client: Client<DefaultCrypto>,
    server: Server<DefaultCrypto>,
    now: Instant,
    events: Vec<ServerEvent>,
}

/// Ticks both sides in lockstep, relaying whatever each side's sink produces
/// to the other, until the client reports [`ClientState::Connected`] or the
/// tick budget runs out.
fn drive_until_connected(
    mut client: Client<DefaultCrypto>,
    mut server: Server<DefaultCrypto>,
    mut now: Instant,
) -> Connected {
    let addr = client_addr();
    let mut to_server: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
    let mut to_client: Vec<Vec<u8>> = Vec::new();
    let mut events = Vec::new();

    for _ in 0..100 {
        let mut client_out = Vec::new();
        client.update(now, 0, to_client.drain(..), &mut |b: &[u8]| client_out.push(b.to_vec()));
        to_server.extend(client_out.into_iter().map(|b| (addr, b)));

        let mut server_out = Vec::new();
        events.extend(server.update(now, 0, to_server.drain(..), &mut |to: SocketAddr, b: &[u8]| {
            server_out.push((to, b.to_vec()));
        }));
        to_client.extend(server_out.into_iter().filter(|(to, _)| *to == addr).map(|(_, b)| b));

        if client.state() == ClientState::Connected {
            break;
        }
        now += STEP;
    }

    Connected { client, server, now, events }
}

#[test]
fn happy_path_reaches_connected() {
    let app_id = 1;
    let (pk, sk) = keypair();
    let bind = Endpoint::V4 { octets: [127, 0, 0, 1], port: 40001 };
    let token = build_token(app_id, &sk, &[bind], 7, 1_000_000, 5);
    let client = Client::new(ClientConfig::default(), DefaultCrypto, token, Instant::now());
    let server = Server::new(ServerConfig::new(app_id, pk, sk), DefaultCrypto, bind);

    let conn = drive_until_connected(client, server, Instant::now());

    assert_eq!(ClientState::Connected, conn.client.state());
    assert_eq!(1, conn.server.client_count());
    assert!(conn
        .events
        .iter()
        .any(|e| matches!(e, ServerEvent::NewConnection { client_id: 7, .. })));
}

#[test]
fn payload_round_trip_delivers_both_directions() {
    let app_id = 1;
    let (pk, sk) = keypair();
    let bind = Endpoint::V4 { octets: [127, 0, 0, 1], port: 40002 };
    let token = build_token(app_id, &sk, &[bind], 7, 1_000_000, 5);
    let client = Client::new(ClientConfig::default(), DefaultCrypto, token, Instant::now());
    let server = Server::new(ServerConfig::new(app_id, pk, sk), DefaultCrypto, bind);

    let mut conn = drive_until_connected(client, server, Instant::now());
    let slot = conn
        .events
        .iter()
        .find_map(|e| match e {
            ServerEvent::NewConnection { slot, .. } => Some(*slot),
            _ => None,
        })
        .expect("server accepted the client");

    let addr = client_addr();

    let mut to_server = Vec::new();
    conn.client
        .send(conn.now, &mut |b: &[u8]| to_server.push((addr, b.to_vec())), b"hello from client", true)
        .unwrap();
    let server_events = conn.server.update(conn.now, 0, to_server, &mut |_: std::net::SocketAddr, _: &[u8]| {});
    assert!(server_events
        .iter()
        .any(|e| matches!(e, ServerEvent::Payload { bytes, .. } if bytes == b"hello from client")));

    let mut from_server = Vec::new();
    conn.server
        .send(
            conn.now,
            &mut |to: SocketAddr, b: &[u8]| {
                if to == addr {
                    from_server.push(b.to_vec());
                }
            },
            slot,
            b"hello from server",
            false,
        )
        .unwrap();
    conn.client.update(conn.now, 0, from_server, &mut |_: &[u8]| {});
    assert_eq!(Some(b"hello from server".to_vec()), conn.client.receive_fire_and_forget());
}

#[test]
fn falls_back_to_next_candidate_after_denial() {
    let app_id = 1;
    let (pk, sk) = keypair();
    let endpoint_a = Endpoint::V4 { octets: [127, 0, 0, 1], port: 40010 };
    let endpoint_b = Endpoint::V4 { octets: [127, 0, 0, 1], port: 40011 };
    let token = build_token(app_id, &sk, &[endpoint_a, endpoint_b], 7, 1_000_000, 5);

    let mut server_a = Server::new(
        ServerConfig { max_clients: 0, ..ServerConfig::new(app_id, pk, sk) },
        DefaultCrypto,
        endpoint_a,
    );
    let mut server_b = Server::new(ServerConfig::new(app_id, pk, sk), DefaultCrypto, endpoint_b);
    let mut client = Client::new(ClientConfig::default(), DefaultCrypto, token, Instant::now());

    let addr = client_addr();
    let mut now = Instant::now();
    let mut to_client: Vec<Vec<u8>> = Vec::new();
    let mut events = Vec::new();

    for round in 0..50 {
        let mut client_out = Vec::new();
        client.update(now, 0, to_client.drain(..), &mut |b: &[u8]| client_out.push(b.to_vec()));
        let incoming: Vec<(SocketAddr, Vec<u8>)> = client_out.into_iter().map(|b| (addr, b)).collect();

        let mut server_out = Vec::new();
        if round == 0 {
            // The client's connect token always tries the first listed
            // candidate first; server_a is configured to be full and must
            // refuse it outright.
            server_a.update(now, 0, incoming, &mut |to: SocketAddr, b: &[u8]| server_out.push((to, b.to_vec())));
        } else {
            events.extend(server_b.update(now, 0, incoming, &mut |to: SocketAddr, b: &[u8]| {
                server_out.push((to, b.to_vec()));
            }));
        }
        to_client.extend(server_out.into_iter().filter(|(to, _)| *to == addr).map(|(_, b)| b));

        if client.state() == ClientState::Connected {
            break;
        }
        now += STEP;
    }

    assert_eq!(ClientState::Connected, client.state());
    assert_eq!(0, server_a.client_count());
    assert_eq!(1, server_b.client_count());
    assert!(events.iter().any(|e| matches!(e, ServerEvent::NewConnection { client_id: 7, .. })));
}

#[test]
fn expired_token_transitions_to_terminal_state_mid_handshake() {
    let (_, sk) = keypair();
    let bind = Endpoint::V4 { octets: [127, 0, 0, 1], port: 40020 };
    let token = build_token(1, &sk, &[bind], 7, 100, 5);
    let mut client = Client::new(ClientConfig::default(), DefaultCrypto, token, Instant::now());

    let now = Instant::now();
    let mut out = Vec::new();
    client.update(now, 0, std::iter::empty(), &mut |b: &[u8]| out.push(b.to_vec()));
    assert_eq!(ClientState::SendingConnectionRequest, client.state());
    assert!(!out.is_empty(), "still attempting the handshake before expiry");

    let mut out_after_expiry = Vec::new();
    client.update(now, 100, std::iter::empty(), &mut |b: &[u8]| out_after_expiry.push(b.to_vec()));
    assert_eq!(ClientState::ConnectTokenExpired, client.state());
    assert_eq!(10, out_after_expiry.len(), "expiry triggers a disconnect burst");

    let mut out_idle = Vec::new();
    client.update(now, 100, std::iter::empty(), &mut |b: &[u8]| out_idle.push(b.to_vec()));
    assert!(out_idle.is_empty(), "a terminal client state is idle");
}

#[test]
fn client_disconnect_frees_server_slot() {
    let app_id = 1;
    let (pk, sk) = keypair();
    let bind = Endpoint::V4 { octets: [127, 0, 0, 1], port: 40030 };
    let token = build_token(app_id, &sk, &[bind], 7, 1_000_000, 5);
    let client = Client::new(ClientConfig::default(), DefaultCrypto, token, Instant::now());
    let server = Server::new(ServerConfig::new(app_id, pk, sk), DefaultCrypto, bind);

    let mut conn = drive_until_connected(client, server, Instant::now());
    assert_eq!(1, conn.server.client_count());

    let addr = client_addr();
    let mut to_server = Vec::new();
    conn.client.disconnect(&mut |b: &[u8]| to_server.push((addr, b.to_vec())));
    assert_eq!(ClientState::Disconnected, conn.client.state());

    let events = conn.server.update(conn.now, 0, to_server, &mut |_: std::net::SocketAddr, _: &[u8]| {});
    assert!(events.iter().any(|e| matches!(e, ServerEvent::Disconnected { .. })));
    assert_eq!(0, conn.server.client_count());
}

#[test]
fn reliable_message_survives_a_dropped_fragment() {
    let app_id = 1;
    let (pk, sk) = keypair();
    let bind = Endpoint::V4 { octets: [127, 0, 0, 1], port: 40040 };
    let token = build_token(app_id, &sk, &[bind], 7, 1_000_000, 5);
    let client = Client::new(ClientConfig::default(), DefaultCrypto, token, Instant::now());
    let server = Server::new(ServerConfig::new(app_id, pk, sk), DefaultCrypto, bind);

    let mut conn = drive_until_connected(client, server, Instant::now());
    assert_eq!(ClientState::Connected, conn.client.state());

    let addr = client_addr();
    let message = vec![0xABu8; 3_000];

    let mut fragments = Vec::new();
    conn.client
        .send(conn.now, &mut |b: &[u8]| fragments.push(b.to_vec()), &message, true)
        .unwrap();
    assert!(fragments.len() >= 2, "a 3000-byte message must split into several fragments");
    fragments.remove(1); // the middle fragment never makes it across the wire

    let delivered: Vec<(SocketAddr, Vec<u8>)> = fragments.into_iter().map(|b| (addr, b)).collect();
    let partial_events = conn.server.update(conn.now, 0, delivered, &mut |_: std::net::SocketAddr, _: &[u8]| {});
    assert!(
        !partial_events.iter().any(|e| matches!(e, ServerEvent::Payload { .. })),
        "reassembly must not complete with a fragment missing"
    );

    conn.now += cute_net_transport::transport::DEFAULT_RESEND_RATE + Duration::from_millis(10);
    let mut resent = Vec::new();
    conn.client
        .update(conn.now, 0, std::iter::empty(), &mut |b: &[u8]| resent.push((addr, b.to_vec())));
    assert!(resent.len() >= 2, "the periodic tick resends the unacked fragment alongside a keepalive");

    let events = conn.server.update(conn.now, 0, resent, &mut |_: std::net::SocketAddr, _: &[u8]| {});
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::Payload { bytes, .. } if *bytes == message)),
        "the message reassembles once the dropped fragment is retransmitted"
    );
}
