// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Client-side Decryption
//!
//! What a balance holder runs locally: unwrap their copy of the symmetric key,
//! decrypt `encryptedAmount`, decode the decimal balance. The private key is
//! only ever borrowed; nothing here performs I/O except [`read_balance`], which
//! reads the envelope from the ledger and decrypts it in-process.
//!
//! The same routine opens the server copy, which is how the orchestrator reads
//! the current balance before every write.
//!
//! Also included are the signatures a wallet produces for the server
//! (registration and withdrawal authorisation).

use alloy::primitives::{Address, B256, U256};
use k256::SecretKey;

use crate::blockchain::{Ledger, LedgerError, StoredEnvelope};
use crate::codec::decode_balance;
use crate::crypto::{cipher, unwrap_key, CryptoError, KeyId};
use crate::identity::{self, IdentityError, SIGNATURE_LEN};

/// Which wrapped copy of the key to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    User,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptedBalance {
    pub balance: U256,
    pub key_id: KeyId,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Unwrap, decrypt and decode one envelope.
pub fn decrypt_envelope(
    envelope: &StoredEnvelope,
    holder: Holder,
    secret: &SecretKey,
) -> Result<DecryptedBalance, CryptoError> {
    let wrapped = match holder {
        Holder::User => &envelope.wrapped_key_user,
        Holder::Server => &envelope.wrapped_key_server,
    };

    let key = unwrap_key(wrapped, secret)?;
    let plaintext = cipher::decrypt_packed(&envelope.encrypted_amount, key.as_bytes())?;
    let balance = decode_balance(&plaintext)?;

    Ok(DecryptedBalance {
        balance,
        key_id: key.id(),
    })
}

/// Fetch and decrypt the user's balance. `None` if no envelope exists yet.
pub async fn read_balance(
    ledger: &dyn Ledger,
    user_index: B256,
    secret: &SecretKey,
) -> Result<Option<DecryptedBalance>, ClientError> {
    let envelope = ledger.get_encrypted_balance(user_index).await?;
    if !envelope.exists {
        return Ok(None);
    }
    Ok(Some(decrypt_envelope(&envelope, Holder::User, secret)?))
}

/// Registration signature and the user index it yields.
pub fn register(secret: &SecretKey) -> Result<([u8; SIGNATURE_LEN], B256), IdentityError> {
    let address = identity::address_of(&secret.public_key());
    let signature =
        identity::sign_personal_message(secret, identity::registration_message(address).as_bytes())?;
    Ok((signature, identity::derive_user_index(&signature)))
}

/// Authorisation for `requestWithdrawal(amount, signature)`.
pub fn authorize_withdrawal(
    secret: &SecretKey,
    amount: U256,
) -> Result<[u8; SIGNATURE_LEN], IdentityError> {
    let address: Address = identity::address_of(&secret.public_key());
    let digest = identity::withdrawal_digest(address, amount);
    identity::sign_personal_message(secret, digest.as_slice())
}

/// Authorisation for the server-side balance decryption endpoint.
pub fn authorize_balance_access(
    secret: &SecretKey,
    issued_at: i64,
) -> Result<[u8; SIGNATURE_LEN], IdentityError> {
    let address = identity::address_of(&secret.public_key());
    identity::sign_personal_message(
        secret,
        identity::balance_access_message(address, issued_at).as_bytes(),
    )
}
