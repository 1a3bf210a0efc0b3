// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Balance Codec
//!
//! Byte-level formats shared by the server, the contract and any client that
//! wants to read an encrypted balance.
//!
//! ## Ciphertext Layout
//!
//! ```text
//! offset  0..16   nonce       (AES-GCM IV, 128 bits, random per encryption)
//! offset 16..32   auth tag    (128 bits)
//! offset 32..     ciphertext  (same length as the plaintext)
//! ```
//!
//! ## Packed Deposit Data
//!
//! `DepositRequested.packedData` is `abi.encodePacked(user, amount, timestamp, block.number)`:
//!
//! ```text
//! offset  0..20   requester address
//! offset 20..52   amount      (uint256, big-endian)
//! offset 52..84   timestamp   (uint256, big-endian)
//! offset 84..116  block number (uint256, big-endian)
//! ```
//!
//! The request identifier is `keccak256(packedData)`.

use alloy::primitives::{keccak256, Address, B256, U256};

/// Size of the AES-GCM nonce field.
pub const NONCE_LEN: usize = 16;

/// Size of the AES-GCM authentication tag field.
pub const TAG_LEN: usize = 16;

/// Minimum length of a packed ciphertext (empty plaintext).
pub const CIPHERTEXT_HEADER_LEN: usize = NONCE_LEN + TAG_LEN;

/// Exact length of `DepositRequested.packedData`.
pub const PACKED_DEPOSIT_LEN: usize = 20 + 32 + 32 + 32;

/// Wire-format errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated envelope: expected at least {expected} bytes, got {actual}")]
    TruncatedEnvelope { expected: usize, actual: usize },

    #[error("malformed balance plaintext")]
    MalformedBalance,

    #[error("malformed packed data: expected {expected} bytes, got {actual}")]
    MalformedPackedData { expected: usize, actual: usize },
}

impl CodecError {
    /// Machine-readable kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            CodecError::TruncatedEnvelope { .. } => "truncated_envelope",
            CodecError::MalformedBalance => "malformed_balance",
            CodecError::MalformedPackedData { .. } => "malformed_packed_data",
        }
    }
}

/// The three fields of an AEAD output, split out of their packed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextParts {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

/// Render a balance as the plaintext consumed by the cipher (decimal, UTF-8).
pub fn encode_balance(balance: U256) -> Vec<u8> {
    balance.to_string().into_bytes()
}

/// Parse a decrypted balance plaintext.
///
/// Only ASCII decimal digits are accepted; anything else (signs, whitespace,
/// hex prefixes, values above `U256::MAX`) is `MalformedBalance`.
pub fn decode_balance(bytes: &[u8]) -> Result<U256, CodecError> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::MalformedBalance);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::MalformedBalance)?;
    U256::from_str_radix(text, 10).map_err(|_| CodecError::MalformedBalance)
}

/// Concatenate `nonce ‖ tag ‖ ciphertext`.
pub fn pack_ciphertext(nonce: &[u8; NONCE_LEN], tag: &[u8; TAG_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CIPHERTEXT_HEADER_LEN + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    out
}

/// Split a packed ciphertext back into its fields.
pub fn unpack_ciphertext(bytes: &[u8]) -> Result<CiphertextParts, CodecError> {
    if bytes.len() < CIPHERTEXT_HEADER_LEN {
        return Err(CodecError::TruncatedEnvelope {
            expected: CIPHERTEXT_HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[..NONCE_LEN]);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&bytes[NONCE_LEN..CIPHERTEXT_HEADER_LEN]);

    Ok(CiphertextParts {
        nonce,
        tag,
        ciphertext: bytes[CIPHERTEXT_HEADER_LEN..].to_vec(),
    })
}

/// Decoded `DepositRequested.packedData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedDeposit {
    pub requester: Address,
    pub amount: U256,
    pub timestamp: U256,
    pub block_number: U256,
}

impl PackedDeposit {
    /// Decode the fixed 116-byte layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != PACKED_DEPOSIT_LEN {
            return Err(CodecError::MalformedPackedData {
                expected: PACKED_DEPOSIT_LEN,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            requester: Address::from_slice(&bytes[..20]),
            amount: U256::from_be_slice(&bytes[20..52]),
            timestamp: U256::from_be_slice(&bytes[52..84]),
            block_number: U256::from_be_slice(&bytes[84..116]),
        })
    }

    /// Encode to the same layout the contract produces with `abi.encodePacked`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKED_DEPOSIT_LEN);
        out.extend_from_slice(self.requester.as_slice());
        out.extend_from_slice(&self.amount.to_be_bytes::<32>());
        out.extend_from_slice(&self.timestamp.to_be_bytes::<32>());
        out.extend_from_slice(&self.block_number.to_be_bytes::<32>());
        out
    }
}

/// Request identifier for a packed deposit: `keccak256(packedData)`.
pub fn deposit_request_id(packed: &[u8]) -> B256 {
    keccak256(packed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn balance_is_plain_decimal() {
        assert_eq!(encode_balance(U256::from(150u64)), b"150".to_vec());
        assert_eq!(encode_balance(U256::ZERO), b"0".to_vec());
    }

    #[test]
    fn decode_balance_rejects_non_decimal() {
        let cases: [&[u8]; 7] = [b"", b"-1", b"+5", b" 5", b"0x10", b"12a", b"1.5"];
        for bad in cases {
            assert_eq!(decode_balance(bad), Err(CodecError::MalformedBalance), "{bad:?}");
        }
    }

    #[test]
    fn decode_balance_rejects_values_above_u256() {
        let too_big = format!("{}0", U256::MAX);
        assert_eq!(
            decode_balance(too_big.as_bytes()),
            Err(CodecError::MalformedBalance)
        );
        assert_eq!(
            decode_balance(U256::MAX.to_string().as_bytes()),
            Ok(U256::MAX)
        );
    }

    #[test]
    fn decode_balance_accepts_leading_zeros() {
        assert_eq!(decode_balance(b"000042"), Ok(U256::from(42u64)));
    }

    #[test]
    fn unpack_rejects_short_input() {
        let err = unpack_ciphertext(&[0u8; 31]).unwrap_err();
        assert_eq!(
            err,
            CodecError::TruncatedEnvelope {
                expected: 32,
                actual: 31
            }
        );
    }

    #[test]
    fn unpack_uses_fixed_offsets() {
        let nonce = [1u8; NONCE_LEN];
        let tag = [2u8; TAG_LEN];
        let packed = pack_ciphertext(&nonce, &tag, b"abc");

        assert_eq!(packed.len(), 35);
        assert_eq!(&packed[..16], &nonce);
        assert_eq!(&packed[16..32], &tag);
        assert_eq!(&packed[32..], b"abc");

        let parts = unpack_ciphertext(&packed).unwrap();
        assert_eq!(parts.nonce, nonce);
        assert_eq!(parts.tag, tag);
        assert_eq!(parts.ciphertext, b"abc".to_vec());

        // Header-only input is a valid (empty) ciphertext.
        assert!(unpack_ciphertext(&packed[..32]).unwrap().ciphertext.is_empty());
    }

    #[test]
    fn packed_deposit_layout() {
        let deposit = PackedDeposit {
            requester: Address::repeat_byte(0xab),
            amount: U256::from(100u64),
            timestamp: U256::from(1_700_000_000u64),
            block_number: U256::from(42u64),
        };
        let bytes = deposit.encode();

        assert_eq!(bytes.len(), PACKED_DEPOSIT_LEN);
        assert_eq!(&bytes[..20], &[0xab; 20]);
        assert_eq!(bytes[51], 100);
        assert_eq!(bytes[115], 42);
        assert_eq!(PackedDeposit::decode(&bytes).unwrap(), deposit);
        assert_eq!(deposit_request_id(&bytes), keccak256(&bytes));
    }

    #[test]
    fn packed_deposit_rejects_wrong_length() {
        assert_eq!(
            PackedDeposit::decode(&[0u8; 115]),
            Err(CodecError::MalformedPackedData {
                expected: 116,
                actual: 115
            })
        );
    }

    proptest! {
        #[test]
        fn balance_codec_round_trips(limbs in any::<[u64; 4]>()) {
            let value = U256::from_limbs(limbs);
            prop_assert_eq!(decode_balance(&encode_balance(value)), Ok(value));
        }
    }
}
