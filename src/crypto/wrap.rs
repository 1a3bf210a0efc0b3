// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! ECIES key wrapping over secp256k1.
//!
//! ## Algorithm
//!
//! ```text
//! seal(payload, recipient_pub, purpose):
//!   1. eph_sk, eph_pub = fresh secp256k1 keypair
//!   2. shared          = ECDH(eph_sk, recipient_pub).x
//!   3. wrapping_key    = HKDF-SHA256(ikm = shared,
//!                                    salt = eph_pub ‖ recipient_pub,
//!                                    info = purpose label)
//!   4. return eph_pub (65 bytes, uncompressed) ‖ AES-256-GCM(wrapping_key, payload)
//! ```
//!
//! The recipient re-derives `shared` from `eph_pub` and its own secret key.
//! A blob sealed for one purpose never opens under another.

use alloy::primitives::B256;
use hkdf::Hkdf;
use k256::{ecdh::diffie_hellman, elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::Sha256;

use super::{cipher, CryptoError, KeyId, SymmetricKey, KEY_LEN};
use crate::codec::{CodecError, CIPHERTEXT_HEADER_LEN};

/// Uncompressed SEC1 public key length.
pub const EPHEMERAL_KEY_LEN: usize = 65;

/// Minimum length of any sealed blob (empty payload).
pub const SEALED_HEADER_LEN: usize = EPHEMERAL_KEY_LEN + CIPHERTEXT_HEADER_LEN;

/// `key_id (u32 BE) ‖ key bytes`.
pub const WRAPPED_PAYLOAD_LEN: usize = 4 + KEY_LEN;

/// Total length of a wrapped symmetric key.
pub const WRAPPED_KEY_LEN: usize = SEALED_HEADER_LEN + WRAPPED_PAYLOAD_LEN;

/// Domain separation for sealed payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    SymmetricKey,
    UserIndex,
}

impl Purpose {
    fn label(self) -> &'static [u8] {
        match self {
            Purpose::SymmetricKey => b"confidential-erc20/symmetric-key/v1",
            Purpose::UserIndex => b"confidential-erc20/user-index/v1",
        }
    }
}

fn derive_wrapping_key(
    shared_x: &[u8],
    ephemeral_pub: &[u8],
    recipient_pub: &[u8],
    purpose: Purpose,
) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut salt = Vec::with_capacity(ephemeral_pub.len() + recipient_pub.len());
    salt.extend_from_slice(ephemeral_pub);
    salt.extend_from_slice(recipient_pub);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_x);
    let mut okm = [0u8; KEY_LEN];
    hkdf.expand(purpose.label(), &mut okm)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF expansion failed: {e}")))?;
    Ok(okm)
}

/// Encrypt `payload` so that only the holder of `recipient`'s secret key can read it.
pub fn seal(payload: &[u8], recipient: &PublicKey, purpose: Purpose) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = SecretKey::random(&mut OsRng);
    let ephemeral_pub = ephemeral.public_key().to_encoded_point(false);
    let recipient_pub = recipient.to_encoded_point(false);

    let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
    let wrapping_key = derive_wrapping_key(
        shared.raw_secret_bytes().as_slice(),
        ephemeral_pub.as_bytes(),
        recipient_pub.as_bytes(),
        purpose,
    )?;

    let sealed = cipher::encrypt_packed(payload, &wrapping_key)?;

    let mut out = Vec::with_capacity(EPHEMERAL_KEY_LEN + sealed.len());
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`seal`].
///
/// Any failure to re-derive the wrapping key or verify the payload is an
/// `UnwrapFailure`; only a blob shorter than the fixed header is reported
/// as a codec error.
pub fn open(blob: &[u8], recipient: &SecretKey, purpose: Purpose) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < SEALED_HEADER_LEN {
        return Err(CodecError::TruncatedEnvelope {
            expected: SEALED_HEADER_LEN,
            actual: blob.len(),
        }
        .into());
    }

    let (ephemeral_bytes, sealed) = blob.split_at(EPHEMERAL_KEY_LEN);
    let ephemeral_pub = PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|_| CryptoError::UnwrapFailure("invalid ephemeral public key"))?;
    let recipient_pub = recipient.public_key().to_encoded_point(false);

    let shared = diffie_hellman(recipient.to_nonzero_scalar(), ephemeral_pub.as_affine());
    let wrapping_key = derive_wrapping_key(
        shared.raw_secret_bytes().as_slice(),
        ephemeral_bytes,
        recipient_pub.as_bytes(),
        purpose,
    )?;

    cipher::decrypt_packed(sealed, &wrapping_key).map_err(|e| match e {
        CryptoError::AuthenticationFailure => {
            CryptoError::UnwrapFailure("blob was not sealed for this recipient")
        }
        other => other,
    })
}

/// Wrap a balance key for one recipient.
pub fn wrap_key(key: &SymmetricKey, recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    let mut payload = [0u8; WRAPPED_PAYLOAD_LEN];
    payload[..4].copy_from_slice(&key.id().0.to_be_bytes());
    payload[4..].copy_from_slice(key.as_bytes());
    seal(&payload, recipient, Purpose::SymmetricKey)
}

/// Recover a balance key wrapped with [`wrap_key`].
pub fn unwrap_key(blob: &[u8], recipient: &SecretKey) -> Result<SymmetricKey, CryptoError> {
    let payload = open(blob, recipient, Purpose::SymmetricKey)?;
    if payload.len() != WRAPPED_PAYLOAD_LEN {
        return Err(CryptoError::UnwrapFailure("unexpected key payload length"));
    }

    let mut id = [0u8; 4];
    id.copy_from_slice(&payload[..4]);
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&payload[4..]);

    Ok(SymmetricKey::from_bytes(KeyId(u32::from_be_bytes(id)), bytes))
}

/// Seal a user index for the server's identity.
pub fn seal_user_index(index: &B256, server: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    seal(index.as_slice(), server, Purpose::UserIndex)
}

/// Open an encrypted user index with the server's secret key.
pub fn open_user_index(blob: &[u8], server: &SecretKey) -> Result<B256, CryptoError> {
    let payload = open(blob, server, Purpose::UserIndex)?;
    if payload.len() != 32 {
        return Err(CryptoError::UnwrapFailure("unexpected user index length"));
    }
    Ok(B256::from_slice(&payload))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn keypair() -> (SecretKey, PublicKey) {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        (secret, public)
    }

    #[test]
    fn wrapped_key_layout() {
        let (_, public) = keypair();
        let key = SymmetricKey::generate(KeyId(7));
        let blob = wrap_key(&key, &public).unwrap();

        assert_eq!(blob.len(), WRAPPED_KEY_LEN);
        assert_eq!(blob[0], 0x04, "ephemeral key is uncompressed SEC1");
    }

    #[test]
    fn wrapping_twice_uses_fresh_ephemeral_keys() {
        let (secret, public) = keypair();
        let key = SymmetricKey::generate(KeyId(0));

        let a = wrap_key(&key, &public).unwrap();
        let b = wrap_key(&key, &public).unwrap();
        assert_ne!(a[..EPHEMERAL_KEY_LEN], b[..EPHEMERAL_KEY_LEN]);
        assert_eq!(unwrap_key(&a, &secret).unwrap(), key);
        assert_eq!(unwrap_key(&b, &secret).unwrap(), key);
    }

    #[test]
    fn wrong_recipient_fails_to_unwrap() {
        let (_, public) = keypair();
        let (other_secret, _) = keypair();
        let blob = wrap_key(&SymmetricKey::generate(KeyId(0)), &public).unwrap();

        assert!(matches!(
            unwrap_key(&blob, &other_secret),
            Err(CryptoError::UnwrapFailure(_))
        ));
    }

    #[test]
    fn tampered_ephemeral_key_fails_to_unwrap() {
        let (secret, public) = keypair();
        let mut blob = wrap_key(&SymmetricKey::generate(KeyId(0)), &public).unwrap();
        blob[10] ^= 0x01;

        assert!(matches!(
            unwrap_key(&blob, &secret),
            Err(CryptoError::UnwrapFailure(_))
        ));
    }

    #[test]
    fn truncated_blob_is_reported() {
        let (secret, _) = keypair();
        assert_eq!(
            unwrap_key(&[0x04; 40], &secret),
            Err(CryptoError::Codec(CodecError::TruncatedEnvelope {
                expected: SEALED_HEADER_LEN,
                actual: 40
            }))
        );
    }

    #[test]
    fn purposes_do_not_cross() {
        let (secret, public) = keypair();
        let index = B256::repeat_byte(0x11);
        let sealed_index = seal_user_index(&index, &public).unwrap();

        assert_eq!(open_user_index(&sealed_index, &secret).unwrap(), index);
        assert!(matches!(
            unwrap_key(&sealed_index, &secret),
            Err(CryptoError::UnwrapFailure(_))
        ));
    }

    #[test]
    fn wrong_payload_shape_is_unwrap_failure() {
        let (secret, public) = keypair();
        let blob = seal(&[0u8; 20], &public, Purpose::SymmetricKey).unwrap();
        assert_eq!(
            unwrap_key(&blob, &secret),
            Err(CryptoError::UnwrapFailure("unexpected key payload length"))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn unwrap_inverts_wrap(
            seed in any::<[u8; 32]>(),
            key_bytes in any::<[u8; 32]>(),
            key_id in any::<u32>(),
        ) {
            // Seeds outside the curve order are not valid secret keys.
            let secret = match SecretKey::from_slice(&seed) {
                Ok(secret) => secret,
                Err(_) => return Ok(()),
            };
            let key = SymmetricKey::from_bytes(KeyId(key_id), key_bytes);

            let blob = wrap_key(&key, &secret.public_key()).unwrap();
            prop_assert_eq!(unwrap_key(&blob, &secret).unwrap(), key);
        }
    }
}
