//! Wire encoding for the seven AEAD-framed packet kinds. The eighth kind,
//! CONNECT_TOKEN, carries its own self-contained framing (see [`crate::token`])
//! and is dispatched on before reaching this module.

use thiserror::Error;

use crate::{
    crypto::{Crypto, SymmetricKey},
    replay::ReplayBuffer,
};

/// Tag byte identifying the CONNECT_TOKEN packet kind, handled outside this
/// module's AEAD framing.
pub const CONNECT_TOKEN_TAG: u8 = 0;

/// Length of the 256-byte opaque blob carried by a challenge handshake.
pub const CHALLENGE_DATA_LEN: usize = 256;
/// Largest payload a single PAYLOAD packet may carry after AEAD framing,
/// leaving room for the cleartext header and tag within the 1207-byte cap.
pub const MAX_PAYLOAD_BODY_LEN: usize = 1100;

/// Cleartext framing: one type byte, an 8-byte monotonic nonce, and 28
/// bytes of zeroed padding the AEAD binds as associated data.
pub const HEADER_LEN: usize = 1 + 8 + 28;

/// One of the seven AEAD-framed protocol packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Sent by the server once a handshake completes.
    ConnectionAccepted {
        /// Client id assigned by the connect token.
        client_id: u64,
        /// Server's configured client capacity.
        max_clients: u32,
        /// Server's configured idle-connection timeout, in seconds.
        connection_timeout_secs: u32,
    },
    /// Sent by the server to refuse a handshake.
    ConnectionDenied,
    /// Periodic liveness packet.
    Keepalive,
    /// Sent by either side to end a connection.
    Disconnect,
    /// Server-to-client handshake challenge.
    ChallengeRequest {
        /// Nonce echoed back by the client.
        challenge_nonce: u64,
        /// Opaque blob echoed back by the client.
        challenge_data: [u8; CHALLENGE_DATA_LEN],
    },
    /// Client-to-server handshake response, echoing the challenge.
    ChallengeResponse {
        /// Echoed nonce.
        challenge_nonce: u64,
        /// Echoed blob.
        challenge_data: [u8; CHALLENGE_DATA_LEN],
    },
    /// Application payload bytes.
    Payload(Vec<u8>),
}

impl Packet {
    fn tag(&self) -> u8 {
        match self {
            Self::ConnectionAccepted { .. } => 1,
            Self::ConnectionDenied => 2,
            Self::Keepalive => 3,
            Self::Disconnect => 4,
            Self::ChallengeRequest { .. } => 5,
            Self::ChallengeResponse { .. } => 6,
            Self::Payload(_) => 7,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Self::ConnectionAccepted {
                client_id,
                max_clients,
                connection_timeout_secs,
            } => {
                out.extend_from_slice(&client_id.to_le_bytes());
                out.extend_from_slice(&max_clients.to_le_bytes());
                out.extend_from_slice(&connection_timeout_secs.to_le_bytes());
            }
            Self::ConnectionDenied | Self::Keepalive | Self::Disconnect => {}
            Self::ChallengeRequest {
                challenge_nonce,
                challenge_data,
            }
            | Self::ChallengeResponse {
                challenge_nonce,
                challenge_data,
            } => {
                out.extend_from_slice(&challenge_nonce.to_le_bytes());
                out.extend_from_slice(challenge_data);
            }
            Self::Payload(bytes) => {
                #[expect(clippy::cast_possible_truncation, reason = "checked by caller")]
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    fn decode_body(tag: u8, body: &[u8]) -> Option<Self> {
        match tag {
            1 => {
                if body.len() < 16 {
                    return None;
                }
                Some(Self::ConnectionAccepted {
                    client_id: u64::from_le_bytes(body[0..8].try_into().ok()?),
                    max_clients: u32::from_le_bytes(body[8..12].try_into().ok()?),
                    connection_timeout_secs: u32::from_le_bytes(body[12..16].try_into().ok()?),
                })
            }
            2 => Some(Self::ConnectionDenied),
            3 => Some(Self::Keepalive),
            4 => Some(Self::Disconnect),
            5 | 6 => {
                if body.len() < 8 + CHALLENGE_DATA_LEN {
                    return None;
                }
                let challenge_nonce = u64::from_le_bytes(body[0..8].try_into().ok()?);
                let mut challenge_data = [0u8; CHALLENGE_DATA_LEN];
                challenge_data.copy_from_slice(&body[8..8 + CHALLENGE_DATA_LEN]);
                Some(if tag == 5 {
                    Self::ChallengeRequest {
                        challenge_nonce,
                        challenge_data,
                    }
                } else {
                    Self::ChallengeResponse {
                        challenge_nonce,
                        challenge_data,
                    }
                })
            }
            7 => {
                if body.len() < 2 {
                    return None;
                }
                let len = usize::from(u16::from_le_bytes(body[0..2].try_into().ok()?));
                if !(1..=MAX_PAYLOAD_BODY_LEN).contains(&len) {
                    return None;
                }
                let bytes = body.get(2..2 + len)?;
                Some(Self::Payload(bytes.to_vec()))
            }
            _ => None,
        }
    }
}

/// Failure while reading a framed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// Shorter than [`HEADER_LEN`] plus a minimal AEAD tag.
    #[error("packet too short")]
    Truncated,
    /// The embedded sequence failed replay protection.
    #[error("packet rejected by replay protection")]
    Replayed,
    /// AEAD authentication failed.
    #[error("packet failed to authenticate")]
    AuthenticationFailed,
    /// The decrypted body didn't parse as any known packet kind.
    #[error("packet body malformed")]
    Malformed,
}

/// Writes `packet` framed and AEAD-encrypted under `key`, using `sequence`
/// as the nonce (and, per connection, it must never repeat).
#[must_use]
pub fn write(crypto: &impl Crypto, key: &SymmetricKey, sequence: u64, packet: &Packet) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.push(packet.tag());
    header.extend_from_slice(&sequence.to_le_bytes());
    header.resize(HEADER_LEN, 0);

    let mut body = Vec::new();
    packet.encode_body(&mut body);
    crypto
        .aead_encrypt(key, sequence, &header, &mut body)
        .expect("encryption under a freshly generated key cannot fail");

    let mut out = header;
    out.extend_from_slice(&body);
    out
}

/// Reads and authenticates a framed packet, rejecting stale or duplicate
/// sequences and updating `replay` on success.
///
/// # Errors
/// Returns [`ReadError`] if the packet is too short, replayed, fails to
/// authenticate, or doesn't parse as a known packet kind.
pub fn read(
    crypto: &impl Crypto,
    key: &SymmetricKey,
    bytes: &[u8],
    replay: &mut ReplayBuffer,
) -> Result<Packet, ReadError> {
    if bytes.len() < HEADER_LEN + crate::crypto::AEAD_TAG_LEN {
        return Err(ReadError::Truncated);
    }
    let tag = bytes[0];
    let sequence = u64::from_le_bytes(bytes[1..9].try_into().expect("fixed width"));

    if !replay.check(sequence) {
        return Err(ReadError::Replayed);
    }

    let header = &bytes[..HEADER_LEN];
    let mut body = bytes[HEADER_LEN..].to_vec();
    crypto
        .aead_decrypt(key, sequence, header, &mut body)
        .map_err(|_| ReadError::AuthenticationFailed)?;

    let packet = Packet::decode_body(tag, &body).ok_or(ReadError::Malformed)?;
    replay.update(sequence);
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCrypto;

    #[test]
    fn keepalive_round_trips() {
        let mut crypto = DefaultCrypto;
        let key = crypto.generate_symmetric_key();
        let mut replay = ReplayBuffer::new();

        let bytes = write(&crypto, &key, 0, &Packet::Keepalive);
        assert_eq!(Packet::Keepalive, read(&crypto, &key, &bytes, &mut replay).unwrap());
    }

    #[test]
    fn payload_round_trips() {
        let mut crypto = DefaultCrypto;
        let key = crypto.generate_symmetric_key();
        let mut replay = ReplayBuffer::new();

        let packet = Packet::Payload(vec![1, 2, 3, 4]);
        let bytes = write(&crypto, &key, 5, &packet);
        assert_eq!(packet, read(&crypto, &key, &bytes, &mut replay).unwrap());
    }

    #[test]
    fn rejects_replayed_sequence() {
        let mut crypto = DefaultCrypto;
        let key = crypto.generate_symmetric_key();
        let mut replay = ReplayBuffer::new();

        let bytes = write(&crypto, &key, 9, &Packet::Keepalive);
        read(&crypto, &key, &bytes, &mut replay).unwrap();
        assert_eq!(
            Err(ReadError::Replayed),
            read(&crypto, &key, &bytes, &mut replay)
        );
    }

    #[test]
    fn rejects_empty_payload() {
        let mut crypto = DefaultCrypto;
        let key = crypto.generate_symmetric_key();
        let mut replay = ReplayBuffer::new();

        let bytes = write(&crypto, &key, 0, &Packet::Payload(Vec::new()));
        assert_eq!(Err(ReadError::Malformed), read(&crypto, &key, &bytes, &mut replay));
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut crypto = DefaultCrypto;
        let key = crypto.generate_symmetric_key();
        let mut replay = ReplayBuffer::new();

        let bytes = write(&crypto, &key, 0, &Packet::Payload(vec![0u8; MAX_PAYLOAD_BODY_LEN + 1]));
        assert_eq!(Err(ReadError::Malformed), read(&crypto, &key, &bytes, &mut replay));
    }

    #[test]
    fn rejects_wrong_key() {
        let mut crypto = DefaultCrypto;
        let key = crypto.generate_symmetric_key();
        let wrong_key = crypto.generate_symmetric_key();
        let mut replay = ReplayBuffer::new();

        let bytes = write(&crypto, &key, 0, &Packet::Keepalive);
        assert_eq!(
            Err(ReadError::AuthenticationFailed),
            read(&crypto, &wrong_key, &bytes, &mut replay)
        );
    }
}
