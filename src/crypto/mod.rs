// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Cryptographic primitives for balance envelopes.
//!
//! - `cipher` - AES-256-GCM over the balance plaintext
//! - `wrap` - ECIES (secp256k1 + HKDF-SHA256 + AES-256-GCM) key wrapping
//!
//! Both layers share the packed ciphertext layout from [`crate::codec`].

pub mod cipher;
pub mod wrap;

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

pub use wrap::{open_user_index, seal_user_index, unwrap_key, wrap_key};

/// Length of a symmetric balance key (AES-256).
pub const KEY_LEN: usize = 32;

/// Version of a user's symmetric key. Incremented on rotation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct KeyId(pub u32);

impl KeyId {
    pub fn next(self) -> Self {
        KeyId(self.0.saturating_add(1))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", self.0)
    }
}

/// Per-user 256-bit balance key.
///
/// `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    id: KeyId,
    bytes: [u8; KEY_LEN],
}

impl SymmetricKey {
    /// Generate a fresh random key with the given version.
    pub fn generate(id: KeyId) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { id, bytes }
    }

    pub fn from_bytes(id: KeyId, bytes: [u8; KEY_LEN]) -> Self {
        Self { id, bytes }
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// A new random key with the next version number.
    pub fn rotated(&self) -> Self {
        Self::generate(self.id.next())
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("id", &self.id)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// Errors from the cipher and key-wrapping layers.
///
/// Messages never contain key material or plaintext.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// AEAD tag did not verify (tampered ciphertext, wrong key or corrupted nonce).
    #[error("authentication failure: ciphertext does not verify under this key")]
    AuthenticationFailure,

    /// The wrapped blob could not be opened by this recipient.
    #[error("unwrap failure: {0}")]
    UnwrapFailure(&'static str),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CryptoError {
    /// Machine-readable kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            CryptoError::AuthenticationFailure => "authentication_failure",
            CryptoError::UnwrapFailure(_) => "unwrap_failure",
            CryptoError::InvalidKey(_) => "invalid_key",
            CryptoError::Codec(e) => e.error_code(),
        }
    }
}
