//! Cryptographic collaborators: AEAD, signatures, and randomness, modeled as
//! a trait rather than a concrete library binding so a caller can swap in
//! their own backend (or a deterministic one for tests) without touching
//! the protocol layer. See the design note on dynamic dispatch: this plays
//! the same role the send-function trait plays for the transport.

use blake2::{
    digest::{Mac, Update},
    Blake2sMac256,
};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Symmetric key size, in bytes.
pub const KEY_LEN: usize = 32;
/// Signature size, in bytes.
pub const SIGNATURE_LEN: usize = 64;
/// Public key size, in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Secret (signing) key size, in bytes.
pub const SECRET_KEY_LEN: usize = 64;
/// AEAD authentication tag size, in bytes.
pub const AEAD_TAG_LEN: usize = 16;

/// Opaque 32-byte symmetric key, shared between a client and a server for
/// one connection.
pub type SymmetricKey = [u8; KEY_LEN];
/// Opaque 64-byte detached signature.
pub type Signature = [u8; SIGNATURE_LEN];
/// Opaque 32-byte signature-verification key.
pub type PublicKey = [u8; PUBLIC_KEY_LEN];
/// Opaque 64-byte signature-creation key.
///
/// `ed25519-dalek` keypairs are a 32-byte seed plus a 32-byte verifying key;
/// the two are concatenated to fill this opaque 64-byte slot without leaking
/// the backend's own representation into the protocol layer.
pub type SecretKey = [u8; SECRET_KEY_LEN];

/// A cryptographic operation failed: a signature didn't verify, or an AEAD
/// payload failed to decrypt/authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cryptographic verification failed")]
pub struct CryptoError;

/// AEAD, signature, and randomness primitives required by the protocol
/// layer.
pub trait Crypto {
    /// Fills `buf` with cryptographically random bytes.
    fn random_bytes(&mut self, buf: &mut [u8]);

    /// Generates a fresh symmetric session key.
    fn generate_symmetric_key(&mut self) -> SymmetricKey {
        let mut key = [0u8; KEY_LEN];
        self.random_bytes(&mut key);
        key
    }

    /// Generates a fresh signature keypair.
    fn sign_keygen(&mut self) -> (PublicKey, SecretKey);

    /// Signs `data` with `sk`, producing a 64-byte detached signature.
    fn sign_create(&self, sk: &SecretKey, data: &[u8]) -> Signature;

    /// Verifies a detached signature against `pk`.
    ///
    /// # Errors
    /// Returns [`CryptoError`] if the signature doesn't verify.
    fn sign_verify(&self, pk: &PublicKey, signature: &Signature, data: &[u8]) -> Result<(), CryptoError>;

    /// Encrypts `data` in place under `key`, using `nonce` (the protocol
    /// layer's monotonic per-connection sequence) and `ad` as associated
    /// data, appending the authentication tag.
    ///
    /// # Errors
    /// Returns [`CryptoError`] if the underlying cipher rejects the input.
    fn aead_encrypt(
        &self,
        key: &SymmetricKey,
        nonce: u64,
        ad: &[u8],
        data: &mut Vec<u8>,
    ) -> Result<(), CryptoError>;

    /// Decrypts and authenticates `data` in place, stripping the trailing
    /// tag on success.
    ///
    /// # Errors
    /// Returns [`CryptoError`] if authentication fails.
    fn aead_decrypt(
        &self,
        key: &SymmetricKey,
        nonce: u64,
        ad: &[u8],
        data: &mut Vec<u8>,
    ) -> Result<(), CryptoError>;

    /// Derives a fixed-size keyed hash of `data` under `key`.
    ///
    /// Used to derive single-purpose subkeys (e.g. the connect token's
    /// secret-section AEAD key) from a longer-lived key, rather than reusing
    /// that key directly for a second purpose.
    fn keyed_hash(&self, key: &[u8], data: &[u8]) -> [u8; 32];
}

fn nonce_from_u64(nonce: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[..8].copy_from_slice(&nonce.to_le_bytes());
    Nonce::clone_from_slice(&bytes)
}

/// Default [`Crypto`] implementation: ChaCha20-Poly1305 for AEAD,
/// Ed25519 for signatures, the OS RNG for randomness.
///
/// Uses the standard 12-byte ChaCha20-Poly1305 nonce plus a 16-byte tag
/// (28 bytes of overhead per encrypted payload). The crypto primitives are
/// an external, swappable collaborator behind the [`Crypto`] trait, so this
/// is simply a coherent, real AEAD scheme rather than a fixed wire
/// requirement other backends must match byte-for-byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCrypto;

impl Crypto for DefaultCrypto {
    fn random_bytes(&mut self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    fn sign_keygen(&mut self) -> (PublicKey, SecretKey) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let mut sk = [0u8; SECRET_KEY_LEN];
        sk[..32].copy_from_slice(&signing_key.to_bytes());
        sk[32..].copy_from_slice(verifying_key.as_bytes());
        (verifying_key.to_bytes(), sk)
    }

    fn sign_create(&self, sk: &SecretKey, data: &[u8]) -> Signature {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&sk[..32]);
        let signing_key = SigningKey::from_bytes(&seed);
        signing_key.sign(data).to_bytes()
    }

    fn sign_verify(
        &self,
        pk: &PublicKey,
        signature: &Signature,
        data: &[u8],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(pk).map_err(|_| CryptoError)?;
        let signature = ed25519_dalek::Signature::from_bytes(signature);
        verifying_key
            .verify(data, &signature)
            .map_err(|_| CryptoError)
    }

    fn aead_encrypt(
        &self,
        key: &SymmetricKey,
        nonce: u64,
        ad: &[u8],
        data: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .encrypt_in_place(&nonce_from_u64(nonce), ad, data)
            .map_err(|_| CryptoError)
    }

    fn aead_decrypt(
        &self,
        key: &SymmetricKey,
        nonce: u64,
        ad: &[u8],
        data: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt_in_place(&nonce_from_u64(nonce), ad, data)
            .map_err(|_| CryptoError)
    }

    fn keyed_hash(&self, key: &[u8], data: &[u8]) -> [u8; 32] {
        let mut mac = <Blake2sMac256 as Mac>::new_from_slice(key)
            .expect("blake2s accepts any key length");
        Mac::update(&mut mac, data);
        mac.finalize().into_bytes().into()
    }
}
