//! Error types for the protocol layer.
//!
//! Internal code propagates the specific [`thiserror`]-derived enums below
//! with `?`; [`NetError`] is the flattened, allocation-free form handed
//! across the public API boundary, carrying a stable code plus a static
//! diagnostic string rather than an arbitrary error tree the caller would
//! have to downcast.

use std::fmt;

use crate::{crypto::CryptoError, packet::ReadError, token::TokenError};
use cute_net_transport::transport::{ReceiveError, SendError};

/// Stable error code for [`NetError`], safe to match on across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetErrorCode {
    /// A connect token failed validation.
    InvalidToken,
    /// AEAD authentication or signature verification failed.
    CryptoFailure,
    /// A packet was malformed or failed replay protection.
    InvalidPacket,
    /// The reliable send queue or fragment budget was exhausted.
    TransportFull,
    /// The requested operation doesn't apply in the current state.
    InvalidState,
}

/// Boundary error type: a stable code plus a short diagnostic.
///
/// Per the "never throw" design note, every externally visible operation
/// returns this instead of an arbitrary error tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetError {
    /// Stable, matchable error code.
    pub code: NetErrorCode,
    /// Human-readable diagnostic; not part of the stability contract.
    pub details: &'static str,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.details)
    }
}

impl std::error::Error for NetError {}

impl From<TokenError> for NetError {
    fn from(err: TokenError) -> Self {
        let details = match err {
            TokenError::Truncated => "token blob too short",
            TokenError::WrongVersion => "token version string mismatch",
            TokenError::WrongApplicationId => "token application id mismatch",
            TokenError::Expired => "token expiration has passed",
            TokenError::BadEndpointCount => "token endpoint count out of range (1..=32)",
            TokenError::SignatureInvalid => "token signature did not verify",
            TokenError::SecretSectionInvalid => "token secret section failed to decrypt",
        };
        Self {
            code: NetErrorCode::InvalidToken,
            details,
        }
    }
}

impl From<CryptoError> for NetError {
    fn from(_: CryptoError) -> Self {
        Self {
            code: NetErrorCode::CryptoFailure,
            details: "AEAD or signature verification failed",
        }
    }
}

impl From<SendError> for NetError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::QueueFull(_) => Self {
                code: NetErrorCode::TransportFull,
                details: "reliable send queue is full",
            },
            SendError::TooBig(_) => Self {
                code: NetErrorCode::TransportFull,
                details: "message exceeds max_size_single_send",
            },
        }
    }
}

impl From<ReceiveError> for NetError {
    fn from(_: ReceiveError) -> Self {
        Self {
            code: NetErrorCode::InvalidPacket,
            details: "malformed transport fragment",
        }
    }
}

impl From<ReadError> for NetError {
    fn from(err: ReadError) -> Self {
        let details = match err {
            ReadError::Truncated => "packet too short",
            ReadError::Replayed => "packet rejected by replay protection",
            ReadError::AuthenticationFailed => "packet failed to authenticate",
            ReadError::Malformed => "packet body malformed",
        };
        Self {
            code: NetErrorCode::InvalidPacket,
            details,
        }
    }
}

impl From<crate::server::SendToSlotError> for NetError {
    fn from(err: crate::server::SendToSlotError) -> Self {
        match err {
            crate::server::SendToSlotError::NotConnected => Self {
                code: NetErrorCode::InvalidState,
                details: "slot not connected",
            },
            crate::server::SendToSlotError::Transport(inner) => inner.into(),
        }
    }
}

impl From<crate::client::SendError> for NetError {
    fn from(err: crate::client::SendError) -> Self {
        match err {
            crate::client::SendError::NotConnected => Self {
                code: NetErrorCode::InvalidState,
                details: "client not connected",
            },
            crate::client::SendError::Transport(inner) => inner.into(),
        }
    }
}
