// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! AES-256-GCM with a 128-bit nonce.
//!
//! The 16-byte nonce matches the IV width the contract's existing balance
//! blobs were produced with, so the packed layout stays byte-compatible.
//! A fresh random nonce is drawn for every call; the functions hold no state.

use aes_gcm::aead::{consts::U16, generic_array::GenericArray, AeadInPlace, KeyInit};
use aes_gcm::{aes::Aes256, AesGcm};
use rand::{rngs::OsRng, RngCore};

use super::{CryptoError, KEY_LEN};
use crate::codec::{pack_ciphertext, unpack_ciphertext, CiphertextParts, NONCE_LEN, TAG_LEN};

/// AES-256-GCM, 128-bit nonce, 128-bit tag.
type Aes256Gcm128 = AesGcm<Aes256, U16>;

fn cipher_for(key: &[u8; KEY_LEN]) -> Result<Aes256Gcm128, CryptoError> {
    Aes256Gcm128::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encrypt `plaintext` under `key`, returning nonce, tag and ciphertext separately.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<CiphertextParts, CryptoError> {
    let cipher = cipher_for(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buffer)
        .map_err(|_| CryptoError::InvalidKey("encryption failed".to_string()))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(CiphertextParts {
        nonce,
        tag: tag_bytes,
        ciphertext: buffer,
    })
}

/// Decrypt and verify. Fails with `AuthenticationFailure` on any mismatch.
pub fn decrypt(parts: &CiphertextParts, key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key)?;

    let mut buffer = parts.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&parts.nonce),
            b"",
            &mut buffer,
            GenericArray::from_slice(&parts.tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailure)?;

    Ok(buffer)
}

/// [`encrypt`] followed by [`pack_ciphertext`].
pub fn encrypt_packed(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
    let parts = encrypt(plaintext, key)?;
    Ok(pack_ciphertext(&parts.nonce, &parts.tag, &parts.ciphertext))
}

/// [`unpack_ciphertext`] followed by [`decrypt`].
pub fn decrypt_packed(packed: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
    let parts = unpack_ciphertext(packed)?;
    decrypt(&parts, key)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::codec::{CodecError, CIPHERTEXT_HEADER_LEN};
    use rand::RngCore;

    fn random_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn round_trip_including_empty() {
        let key = random_key();
        for payload in [&b""[..], &b"0"[..], &b"150000000000000000000"[..]] {
            let packed = encrypt_packed(payload, &key).unwrap();
            assert_eq!(packed.len(), CIPHERTEXT_HEADER_LEN + payload.len());
            assert_eq!(decrypt_packed(&packed, &key).unwrap(), payload.to_vec());
        }
    }

    #[test]
    fn wrong_key_is_authentication_failure() {
        let packed = encrypt_packed(b"100", &random_key()).unwrap();
        assert_eq!(
            decrypt_packed(&packed, &random_key()),
            Err(CryptoError::AuthenticationFailure)
        );
    }

    #[test]
    fn corrupted_nonce_is_authentication_failure() {
        let key = random_key();
        let mut packed = encrypt_packed(b"100", &key).unwrap();
        packed[0] ^= 0x80;
        assert_eq!(
            decrypt_packed(&packed, &key),
            Err(CryptoError::AuthenticationFailure)
        );
    }

    #[test]
    fn truncated_input_is_codec_error() {
        let key = random_key();
        assert_eq!(
            decrypt_packed(&[0u8; 10], &key),
            Err(CryptoError::Codec(CodecError::TruncatedEnvelope {
                expected: CIPHERTEXT_HEADER_LEN,
                actual: 10
            }))
        );
    }

    #[test]
    fn nonces_are_not_reused() {
        let key = random_key();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let parts = encrypt(b"1", &key).unwrap();
            assert!(seen.insert(parts.nonce), "nonce repeated");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn aead_round_trips(key in any::<[u8; 32]>(), payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            let packed = encrypt_packed(&payload, &key).unwrap();
            prop_assert_eq!(decrypt_packed(&packed, &key).unwrap(), payload);
        }

        #[test]
        fn any_bit_flip_in_tag_or_ciphertext_is_rejected(
            key in any::<[u8; 32]>(),
            payload in proptest::collection::vec(any::<u8>(), 1..64),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut packed = encrypt_packed(&payload, &key).unwrap();
            // Flip somewhere in tag ‖ ciphertext.
            let span = packed.len() - NONCE_LEN;
            let offset = NONCE_LEN + position.index(span);
            packed[offset] ^= 1 << bit;
            prop_assert_eq!(decrypt_packed(&packed, &key), Err(CryptoError::AuthenticationFailure));
        }
    }
}
