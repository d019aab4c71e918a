//! Connect token generation and parsing. See [`generate`],
//! [`client_read_rest`], and [`server_decrypt_connect_token`].

use thiserror::Error;

use crate::{
    crypto::{Crypto, PublicKey, SecretKey, SymmetricKey, SIGNATURE_LEN},
    endpoint::Endpoint,
};

/// ASCII version string stamped into both the preamble and the packet.
pub const VERSION: &[u8; 10] = b"CUTE 1.00\0";

/// Length of the private preamble sent only over HTTPS.
pub const PREAMBLE_LEN: usize = 10 + 8 + 8 + 32 + 32;
/// Length of the public (authenticated-but-clear) section of the packet.
pub const PUBLIC_SECTION_LEN: usize = 568;
/// Length of the secret section before AEAD framing.
const SECRET_PLAINTEXT_LEN: usize = 8 + 32 + 32 + 256;
/// Length of the connect-token packet that travels over UDP.
pub const PACKET_LEN: usize = 1024;
/// Length of the full issuer-side blob (preamble + packet).
pub const BLOB_LEN: usize = PREAMBLE_LEN + PACKET_LEN;

const PUBLIC_HEADER_LEN: usize = 1 + 10 + 8 + 8 + 4 + 4;
const MAX_ENDPOINTS: usize = 32;
const AEAD_KEY_CONTEXT: &[u8] = b"cute_net/connect-token/secret-section-key/v1";

/// A connect token failed validation at some stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Blob shorter than required for its section.
    #[error("token blob too short")]
    Truncated,
    /// Version string didn't match [`VERSION`].
    #[error("token version mismatch")]
    WrongVersion,
    /// `application_id` didn't match the caller's.
    #[error("token application id mismatch")]
    WrongApplicationId,
    /// `expiration_timestamp <= now`.
    #[error("token has expired")]
    Expired,
    /// `address_count` was `0` or `> 32`.
    #[error("token endpoint count out of range")]
    BadEndpointCount,
    /// The 64-byte signature did not verify.
    #[error("token signature invalid")]
    SignatureInvalid,
    /// The AEAD-encrypted secret section failed to decrypt.
    #[error("token secret section invalid")]
    SecretSectionInvalid,
}

/// The parsed, decrypted contents of a connect token, as seen by a server.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedToken {
    /// Expiration timestamp (seconds since epoch).
    pub expiration_timestamp: u64,
    /// Seconds the server allows for the full handshake.
    pub handshake_timeout: u32,
    /// Candidate server endpoints.
    pub endpoints: Vec<Endpoint>,
    /// Client id assigned by the issuing service.
    pub client_id: u64,
    /// Client-to-server session key.
    pub client_to_server_key: SymmetricKey,
    /// Server-to-client session key.
    pub server_to_client_key: SymmetricKey,
    /// Opaque user data, passed through unexamined.
    pub user_data: [u8; 256],
    /// The token's signature, used as the token-cache dedup key.
    pub signature: [u8; SIGNATURE_LEN],
}

/// The client-side view of a connect token: the decoded preamble plus the
/// still-encrypted 1024-byte packet to forward to candidate servers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectToken {
    /// Client-to-server session key.
    pub client_to_server_key: SymmetricKey,
    /// Server-to-client session key.
    pub server_to_client_key: SymmetricKey,
    /// Token creation timestamp.
    pub creation_timestamp: u64,
    /// Candidate server endpoints, parsed from the packet's public section.
    pub endpoints: Vec<Endpoint>,
    /// Seconds the server allows for the full handshake.
    pub handshake_timeout: u32,
    /// Expiration timestamp (seconds since epoch).
    pub expiration_timestamp: u64,
    /// The raw 1024-byte packet, unmodified, ready to retransmit verbatim.
    pub packet: [u8; PACKET_LEN],
}

fn secret_section_aead_key(crypto: &impl Crypto, shared_secret_sign_key: &SecretKey) -> SymmetricKey {
    crypto.keyed_hash(AEAD_KEY_CONTEXT, shared_secret_sign_key)
}

fn encode_public_section(
    application_id: u64,
    expiration_timestamp: u64,
    handshake_timeout: u32,
    endpoints: &[Endpoint],
) -> Result<[u8; PUBLIC_SECTION_LEN], TokenError> {
    if endpoints.is_empty() || endpoints.len() > MAX_ENDPOINTS {
        return Err(TokenError::BadEndpointCount);
    }

    let mut body = Vec::with_capacity(PUBLIC_HEADER_LEN);
    body.push(0); // CONNECT_TOKEN packet type tag
    body.extend_from_slice(VERSION);
    body.extend_from_slice(&application_id.to_le_bytes());
    body.extend_from_slice(&expiration_timestamp.to_le_bytes());
    body.extend_from_slice(&handshake_timeout.to_le_bytes());
    #[expect(clippy::cast_possible_truncation, reason = "checked above, <= 32")]
    body.extend_from_slice(&(endpoints.len() as u32).to_le_bytes());
    for endpoint in endpoints {
        endpoint.encode(&mut body);
    }
    if body.len() > PUBLIC_SECTION_LEN {
        return Err(TokenError::BadEndpointCount);
    }
    body.resize(PUBLIC_SECTION_LEN, 0);

    let mut out = [0u8; PUBLIC_SECTION_LEN];
    out.copy_from_slice(&body);
    Ok(out)
}

struct PublicSection {
    application_id: u64,
    expiration_timestamp: u64,
    handshake_timeout: u32,
    endpoints: Vec<Endpoint>,
}

fn decode_public_section(section: &[u8]) -> Result<PublicSection, TokenError> {
    if section.len() < PUBLIC_HEADER_LEN {
        return Err(TokenError::Truncated);
    }
    if &section[1..11] != VERSION.as_slice() {
        return Err(TokenError::WrongVersion);
    }
    let application_id = u64::from_le_bytes(section[11..19].try_into().unwrap());
    let expiration_timestamp = u64::from_le_bytes(section[19..27].try_into().unwrap());
    let handshake_timeout = u32::from_le_bytes(section[27..31].try_into().unwrap());
    let address_count = u32::from_le_bytes(section[31..35].try_into().unwrap());

    if address_count == 0 || address_count > MAX_ENDPOINTS as u32 {
        return Err(TokenError::BadEndpointCount);
    }

    let mut endpoints = Vec::with_capacity(address_count as usize);
    let mut cursor = PUBLIC_HEADER_LEN;
    for _ in 0..address_count {
        let (endpoint, consumed) =
            Endpoint::decode(&section[cursor..]).ok_or(TokenError::Truncated)?;
        endpoints.push(endpoint);
        cursor += consumed;
    }

    Ok(PublicSection {
        application_id,
        expiration_timestamp,
        handshake_timeout,
        endpoints,
    })
}

/// Builds a 1114-byte issuer-side connect token blob.
///
/// # Errors
/// Fails if `endpoints` is empty or longer than 32, or doesn't fit the
/// public section's byte budget.
#[expect(clippy::too_many_arguments, reason = "mirrors the wire fields 1:1")]
pub fn generate(
    crypto: &impl Crypto,
    application_id: u64,
    now: u64,
    client_to_server_key: SymmetricKey,
    server_to_client_key: SymmetricKey,
    expiration_timestamp: u64,
    handshake_timeout: u32,
    endpoints: &[Endpoint],
    client_id: u64,
    user_data: [u8; 256],
    shared_secret_sign_key: &SecretKey,
) -> Result<[u8; BLOB_LEN], TokenError> {
    let public_section = encode_public_section(
        application_id,
        expiration_timestamp,
        handshake_timeout,
        endpoints,
    )?;

    let mut secret_plaintext = Vec::with_capacity(SECRET_PLAINTEXT_LEN);
    secret_plaintext.extend_from_slice(&client_id.to_le_bytes());
    secret_plaintext.extend_from_slice(&client_to_server_key);
    secret_plaintext.extend_from_slice(&server_to_client_key);
    secret_plaintext.extend_from_slice(&user_data);

    let aead_key = secret_section_aead_key(crypto, shared_secret_sign_key);
    crypto
        .aead_encrypt(&aead_key, 0, &public_section, &mut secret_plaintext)
        .map_err(|_| TokenError::SecretSectionInvalid)?;
    let secret_ciphertext = secret_plaintext;

    let mut signed_region = Vec::with_capacity(PUBLIC_SECTION_LEN + secret_ciphertext.len());
    signed_region.extend_from_slice(&public_section);
    signed_region.extend_from_slice(&secret_ciphertext);
    let signature = crypto.sign_create(shared_secret_sign_key, &signed_region);

    let mut packet = [0u8; PACKET_LEN];
    let mut offset = 0;
    packet[offset..offset + public_section.len()].copy_from_slice(&public_section);
    offset += public_section.len();
    packet[offset..offset + secret_ciphertext.len()].copy_from_slice(&secret_ciphertext);
    offset += secret_ciphertext.len();
    packet[offset..offset + signature.len()].copy_from_slice(&signature);
    // remainder stays zero-padded

    let mut blob = [0u8; BLOB_LEN];
    let mut preamble = Vec::with_capacity(PREAMBLE_LEN);
    preamble.extend_from_slice(VERSION);
    preamble.extend_from_slice(&application_id.to_le_bytes());
    preamble.extend_from_slice(&now.to_le_bytes());
    preamble.extend_from_slice(&client_to_server_key);
    preamble.extend_from_slice(&server_to_client_key);
    blob[..PREAMBLE_LEN].copy_from_slice(&preamble);
    blob[PREAMBLE_LEN..].copy_from_slice(&packet);

    Ok(blob)
}

/// Parses the private preamble on the client side, returning the session
/// keys and a copy of the 1024-byte packet to forward to candidate servers.
///
/// # Errors
/// Fails if the version string or application id don't match, or the token
/// has already expired.
pub fn client_read_rest(
    blob: &[u8; BLOB_LEN],
    application_id: u64,
    now: u64,
) -> Result<ConnectToken, TokenError> {
    if &blob[0..10] != VERSION.as_slice() {
        return Err(TokenError::WrongVersion);
    }
    let preamble_app_id = u64::from_le_bytes(blob[10..18].try_into().unwrap());
    if preamble_app_id != application_id {
        return Err(TokenError::WrongApplicationId);
    }
    let creation_timestamp = u64::from_le_bytes(blob[18..26].try_into().unwrap());
    let mut client_to_server_key = [0u8; 32];
    client_to_server_key.copy_from_slice(&blob[26..58]);
    let mut server_to_client_key = [0u8; 32];
    server_to_client_key.copy_from_slice(&blob[58..90]);

    let mut packet = [0u8; PACKET_LEN];
    packet.copy_from_slice(&blob[PREAMBLE_LEN..]);

    let public = decode_public_section(&packet[..PUBLIC_SECTION_LEN])?;
    if public.application_id != application_id {
        return Err(TokenError::WrongApplicationId);
    }
    if public.expiration_timestamp <= now {
        return Err(TokenError::Expired);
    }

    Ok(ConnectToken {
        client_to_server_key,
        server_to_client_key,
        creation_timestamp,
        endpoints: public.endpoints,
        handshake_timeout: public.handshake_timeout,
        expiration_timestamp: public.expiration_timestamp,
        packet,
    })
}

/// Parses and authenticates a connect-token packet on the server side.
///
/// # Errors
/// Fails if the version, application id, signature, or AEAD tag don't
/// check out, or the token has already expired.
pub fn server_decrypt_connect_token(
    crypto: &impl Crypto,
    packet: &[u8; PACKET_LEN],
    public_key: &PublicKey,
    secret_key: &SecretKey,
    application_id: u64,
    now: u64,
) -> Result<DecryptedToken, TokenError> {
    let public = decode_public_section(&packet[..PUBLIC_SECTION_LEN])?;
    if public.application_id != application_id {
        return Err(TokenError::WrongApplicationId);
    }
    if public.expiration_timestamp <= now {
        return Err(TokenError::Expired);
    }

    let secret_ciphertext_len = SECRET_PLAINTEXT_LEN + crate::crypto::AEAD_TAG_LEN;
    let secret_start = PUBLIC_SECTION_LEN;
    let secret_end = secret_start + secret_ciphertext_len;
    let signature_start = secret_end;
    let signature_end = signature_start + SIGNATURE_LEN;

    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&packet[signature_start..signature_end]);

    crypto
        .sign_verify(public_key, &signature, &packet[..signature_start])
        .map_err(|_| TokenError::SignatureInvalid)?;

    let aead_key = secret_section_aead_key(crypto, secret_key);
    let mut secret_plaintext = packet[secret_start..secret_end].to_vec();
    crypto
        .aead_decrypt(&aead_key, 0, &packet[..PUBLIC_SECTION_LEN], &mut secret_plaintext)
        .map_err(|_| TokenError::SecretSectionInvalid)?;

    let client_id = u64::from_le_bytes(secret_plaintext[0..8].try_into().unwrap());
    let mut client_to_server_key = [0u8; 32];
    client_to_server_key.copy_from_slice(&secret_plaintext[8..40]);
    let mut server_to_client_key = [0u8; 32];
    server_to_client_key.copy_from_slice(&secret_plaintext[40..72]);
    let mut user_data = [0u8; 256];
    user_data.copy_from_slice(&secret_plaintext[72..328]);

    Ok(DecryptedToken {
        expiration_timestamp: public.expiration_timestamp,
        handshake_timeout: public.handshake_timeout,
        endpoints: public.endpoints,
        client_id,
        client_to_server_key,
        server_to_client_key,
        user_data,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCrypto;

    fn sample_endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::V6 {
                groups: [0, 0, 0, 0, 0, 0, 0, 1],
                port: 5000,
            },
            Endpoint::V4 {
                octets: [127, 0, 0, 1],
                port: 5001,
            },
        ]
    }

    #[test]
    fn round_trips_through_client_and_server() {
        let mut crypto = DefaultCrypto;
        let (pk, sk) = crypto.sign_keygen();
        let c2s = crypto.generate_symmetric_key();
        let s2c = crypto.generate_symmetric_key();

        let blob = generate(
            &crypto,
            42,
            1_000,
            c2s,
            s2c,
            2_000,
            15,
            &sample_endpoints(),
            7,
            [9u8; 256],
            &sk,
        )
        .unwrap();

        let client_view = client_read_rest(&blob, 42, 1_500).unwrap();
        assert_eq!(sample_endpoints(), client_view.endpoints);
        assert_eq!(c2s, client_view.client_to_server_key);

        let decrypted =
            server_decrypt_connect_token(&crypto, &client_view.packet, &pk, &sk, 42, 1_500)
                .unwrap();
        assert_eq!(7, decrypted.client_id);
        assert_eq!(c2s, decrypted.client_to_server_key);
        assert_eq!(s2c, decrypted.server_to_client_key);
        assert_eq!([9u8; 256], decrypted.user_data);
    }

    #[test]
    fn rejects_expired_token() {
        let mut crypto = DefaultCrypto;
        let (pk, sk) = crypto.sign_keygen();
        let blob = generate(
            &crypto,
            1,
            0,
            [0; 32],
            [0; 32],
            1,
            15,
            &sample_endpoints(),
            1,
            [0; 256],
            &sk,
        )
        .unwrap();

        assert_eq!(Err(TokenError::Expired), client_read_rest(&blob, 1, 5));

        let mut packet = [0u8; PACKET_LEN];
        packet.copy_from_slice(&blob[PREAMBLE_LEN..]);
        assert_eq!(
            Err(TokenError::Expired),
            server_decrypt_connect_token(&crypto, &packet, &pk, &sk, 1, 5)
        );
    }

    #[test]
    fn rejects_forged_signature() {
        let mut crypto = DefaultCrypto;
        let (pk, sk) = crypto.sign_keygen();
        let (_, other_sk) = crypto.sign_keygen();
        let blob = generate(
            &crypto,
            1,
            0,
            [0; 32],
            [0; 32],
            1000,
            15,
            &sample_endpoints(),
            1,
            [0; 256],
            &other_sk,
        )
        .unwrap();
        let mut packet = [0u8; PACKET_LEN];
        packet.copy_from_slice(&blob[PREAMBLE_LEN..]);
        assert_eq!(
            Err(TokenError::SignatureInvalid),
            server_decrypt_connect_token(&crypto, &packet, &pk, &sk, 1, 0)
        );
    }
}
