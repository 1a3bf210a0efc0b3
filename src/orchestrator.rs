// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Encryption Orchestrator
//!
//! Turns deposit and withdrawal requests into envelope writes.
//!
//! ## Flow (per request, under the requester's identity lock)
//!
//! 1. Validate the request: `keccak256(packedData) == requestId` for deposits,
//!    the EIP-191 withdrawal signature for withdrawals.
//! 2. Resolve the user's ledger slot from the encrypted user index.
//! 3. Read the current envelope and open it with the server copy of the key.
//!    The decrypted on-chain envelope is the only balance we trust.
//! 4. Pick the key for the new envelope (cached, recovered from the envelope,
//!    freshly generated, or a newer rotated one).
//! 5. Encrypt the new balance, wrap the key for the user and for the server,
//!    and re-open the server half before sending anything.
//! 6. Write the envelope, then mark the request Processed.
//!
//! Before computing anything, the ledger is asked whether the request's write
//! already landed, so an unconfirmed-but-mined write is never applied twice.
//! This covers retries as well as a crash between the write and the tracker
//! update.
//!
//! ## Ordering
//!
//! A request never overtakes an older Pending request of the same requester.
//! It is held as waiting instead, and held requests are resumed in chain order
//! as soon as the older one is Processed.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::Utc;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::blockchain::{
    DepositRequested, EnvelopeWrite, Ledger, LedgerError, LedgerEvent, LedgerEventKind,
    TxConfirmation, WithdrawalRequested,
};
use crate::client::{self, DecryptedBalance, Holder};
use crate::codec::{decode_balance, deposit_request_id, encode_balance, CodecError, PackedDeposit};
use crate::crypto::{
    cipher, open_user_index, seal_user_index, unwrap_key, wrap_key, CryptoError, KeyId,
    SymmetricKey,
};
use crate::identity::{self, IdentityError, ServerIdentity};
use crate::storage::{
    KeyStore, RequestRecord, RequestTracker, StorageError, Store, UserDirectory, UserRecord,
    WAITING_ERROR_CODE,
};

// =============================================================================
// Errors
// =============================================================================

/// What the tracker does with a request that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Close the request as Processed(Rejected).
    Reject,
    /// Keep it Pending; the retry sweep picks it up.
    Retry,
    /// Keep it Pending for an operator; never retried automatically.
    Investigate,
    /// Keep it Pending until the older request holding it back is Processed.
    Wait,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("unauthorized withdrawal: {0}")]
    UnauthorizedWithdrawal(IdentityError),

    #[error("invalid signature: {0}")]
    InvalidSignature(IdentityError),

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("balance overflow")]
    Overflow,

    #[error("user {0} has not registered an encryption key")]
    UnregisteredUser(Address),

    #[error("request {earlier:#x} of the same requester is still pending")]
    Waiting { earlier: B256 },

    #[error("cached key {key_id} differs from the key in the envelope")]
    KeyMismatch { key_id: KeyId },

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ProcessingError {
    /// Machine-readable kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProcessingError::Integrity(_) => "integrity_error",
            ProcessingError::UnauthorizedWithdrawal(_) => "unauthorized_withdrawal",
            ProcessingError::InvalidSignature(IdentityError::Expired { .. }) => "signature_expired",
            ProcessingError::InvalidSignature(_) => "invalid_signature",
            ProcessingError::InsufficientBalance => "insufficient_balance",
            ProcessingError::Overflow => "overflow",
            ProcessingError::UnregisteredUser(_) => "unregistered_user",
            ProcessingError::Waiting { .. } => WAITING_ERROR_CODE,
            ProcessingError::KeyMismatch { .. } => "key_mismatch",
            ProcessingError::Protocol(_) => "protocol_error",
            ProcessingError::Codec(e) => e.error_code(),
            ProcessingError::Crypto(e) => e.error_code(),
            ProcessingError::Ledger(e) if e.is_retriable() => "ledger_unavailable",
            ProcessingError::Ledger(LedgerError::Reverted { .. }) => "ledger_reverted",
            ProcessingError::Ledger(_) => "ledger_misconfigured",
            ProcessingError::Storage(_) => "storage_error",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            ProcessingError::Integrity(_)
            | ProcessingError::UnauthorizedWithdrawal(_)
            | ProcessingError::InvalidSignature(_)
            | ProcessingError::InsufficientBalance
            | ProcessingError::Overflow
            | ProcessingError::Codec(_)
            | ProcessingError::Crypto(CryptoError::Codec(_)) => Disposition::Reject,

            ProcessingError::UnregisteredUser(_) | ProcessingError::Storage(_) => {
                Disposition::Retry
            }
            ProcessingError::Ledger(e) if e.is_retriable() => Disposition::Retry,

            ProcessingError::Waiting { .. } => Disposition::Wait,

            ProcessingError::KeyMismatch { .. }
            | ProcessingError::Protocol(_)
            | ProcessingError::Crypto(_)
            | ProcessingError::Ledger(_) => Disposition::Investigate,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }
}

// =============================================================================
// Identity Locks
// =============================================================================

type LockMap = HashMap<Address, Arc<tokio::sync::Mutex<()>>>;

/// One async mutex per identity. Requests of one user run one at a time;
/// different users never contend. An entry lives only while someone holds or
/// waits for it.
#[derive(Default)]
pub struct IdentityLocks {
    locks: Mutex<LockMap>,
}

impl IdentityLocks {
    pub async fn acquire(&self, identity: Address) -> IdentityGuard<'_> {
        let lock = self.lock_map().entry(identity).or_default().clone();
        let guard = lock.lock_owned().await;
        IdentityGuard {
            locks: self,
            identity,
            guard: Some(guard),
        }
    }

    /// Identities currently locked or waited on.
    pub fn active(&self) -> usize {
        self.lock_map().len()
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, LockMap> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held identity lock. Dropping it releases the lock and forgets the entry
/// when nobody else is queued on it.
pub struct IdentityGuard<'a> {
    locks: &'a IdentityLocks,
    identity: Address,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Clones are only taken under the map lock, so a count of one means no waiters.
        let mut locks = self.locks.lock_map();
        if locks
            .get(&self.identity)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.identity);
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// How a request was closed by [`Orchestrator::handle_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied(TxConfirmation),
    /// An earlier, unconfirmed attempt had already landed on the ledger.
    Reconciled,
    AlreadyProcessed,
}

enum Written {
    Confirmed(TxConfirmation),
    AlreadyOnLedger,
}

/// Envelope state as seen by the server.
struct CurrentBalance {
    balance: U256,
    key: Option<SymmetricKey>,
}

pub struct Orchestrator {
    identity: ServerIdentity,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn Store>,
    tracker: RequestTracker,
    locks: IdentityLocks,
}

impl Orchestrator {
    pub fn new(identity: ServerIdentity, ledger: Arc<dyn Ledger>, store: Arc<dyn Store>) -> Self {
        let tracker = RequestTracker::new(store.clone());
        Self {
            identity,
            ledger,
            store,
            tracker,
            locks: IdentityLocks::default(),
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Identities with a request in flight or queued on the lock.
    pub fn locks_held(&self) -> usize {
        self.locks.active()
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    /// Register the public key behind a registration signature.
    ///
    /// Returns the user record; its `encrypted_index` is what the user submits
    /// on-chain via `authenticateUser`. Registering twice returns the first record.
    pub async fn register_user(
        &self,
        address: Address,
        signature: &[u8],
    ) -> Result<UserRecord, ProcessingError> {
        let public_key = identity::verify_registration(address, signature)
            .map_err(ProcessingError::InvalidSignature)?;

        let _guard = self.locks.acquire(address).await;

        if let Some(existing) = self.store.get_user(address)? {
            debug!(user = %address, "User already registered");
            return Ok(existing);
        }

        let user_index = identity::derive_user_index(signature);
        let encrypted_index = seal_user_index(&user_index, self.identity.public_key())?;

        let record = UserRecord {
            address,
            public_key: Bytes::copy_from_slice(public_key.to_encoded_point(false).as_bytes()),
            user_index,
            encrypted_index: encrypted_index.into(),
            registered_at: Utc::now(),
        };
        self.store.put_user(&record)?;

        info!(user = %address, "User registered");
        Ok(record)
    }

    pub fn user(&self, address: Address) -> Result<Option<UserRecord>, ProcessingError> {
        Ok(self.store.get_user(address)?)
    }

    fn registered_user(&self, address: Address) -> Result<UserRecord, ProcessingError> {
        self.store
            .get_user(address)?
            .ok_or(ProcessingError::UnregisteredUser(address))
    }

    /// Decrypt a user's balance server-side for a signed, fresh request.
    pub async fn decrypt_balance_for(
        &self,
        address: Address,
        issued_at: i64,
        signature: &[u8],
    ) -> Result<Option<DecryptedBalance>, ProcessingError> {
        identity::verify_balance_access(address, issued_at, Utc::now().timestamp(), signature)
            .map_err(ProcessingError::InvalidSignature)?;

        let user = self.registered_user(address)?;
        let envelope = self.ledger.get_encrypted_balance(user.user_index).await?;
        if !envelope.exists {
            return Ok(None);
        }
        Ok(Some(client::decrypt_envelope(
            &envelope,
            Holder::Server,
            self.identity.secret_key(),
        )?))
    }

    /// Schedule a new key for the user. The next write re-encrypts under it.
    pub async fn rotate_key(&self, address: Address) -> Result<KeyId, ProcessingError> {
        let _guard = self.locks.acquire(address).await;

        let user = self.registered_user(address)?;
        let current = self.current_balance(user.user_index).await?;
        if let Some(envelope_key) = current.key {
            // Rotate from whichever key is newer.
            let cached_id = self.store.get_key(address)?.map(|k| k.id());
            if cached_id.is_none_or(|id| id < envelope_key.id()) {
                self.store.put_key(address, &envelope_key)?;
            }
        }

        let next = self.store.rotate_key(address)?;
        info!(user = %address, key_id = %next.id(), "Balance key rotated");
        Ok(next.id())
    }

    pub fn request_status(&self, request_id: B256) -> Result<Option<RequestRecord>, ProcessingError> {
        Ok(self.tracker.get(request_id)?)
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Process one ledger event end to end, recording the outcome in the tracker.
    pub async fn handle_event(&self, event: &LedgerEvent) -> Result<ProcessOutcome, ProcessingError> {
        // Undecodable deposits share one lane; they are rejected before any balance work.
        let lane = event.requester().unwrap_or(Address::ZERO);
        let _guard = self.locks.acquire(lane).await;

        let result = self.run_request(event).await;
        let closed = match &result {
            Ok(ProcessOutcome::AlreadyProcessed) => false,
            Ok(_) => true,
            Err(err) => err.disposition() == Disposition::Reject,
        };
        if closed {
            if let Some(requester) = event.requester() {
                self.resume_waiting(requester).await;
            }
        }
        result
    }

    /// Process one request. The caller holds the requester's identity lock.
    async fn run_request(&self, event: &LedgerEvent) -> Result<ProcessOutcome, ProcessingError> {
        let request_id = event.request_id();
        let lane = event.requester().unwrap_or(Address::ZERO);

        let record = self.tracker.record_pending(event)?;
        if !record.is_pending() {
            debug!(request_id = %request_id, "Request already processed, skipping");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        if let Some(earlier) = self.earlier_pending(event)? {
            let err = ProcessingError::Waiting { earlier };
            self.record_error(request_id, &err);
            return Err(err);
        }

        let result = match &event.kind {
            LedgerEventKind::Deposit(deposit) => self.process_deposit(deposit).await,
            LedgerEventKind::Withdrawal(withdrawal) => self.process_withdrawal(withdrawal).await,
        };

        match result {
            Ok(Written::Confirmed(confirmation)) => {
                self.tracker.mark_applied(request_id, &confirmation)?;
                info!(
                    request_id = %request_id,
                    requester = %lane,
                    kind = ?event.request_kind(),
                    tx_hash = %confirmation.tx_hash,
                    block = confirmation.block_number,
                    "Request processed"
                );
                Ok(ProcessOutcome::Applied(confirmation))
            }
            Ok(Written::AlreadyOnLedger) => {
                self.tracker.mark_reconciled(request_id)?;
                info!(
                    request_id = %request_id,
                    requester = %lane,
                    "Request found on ledger, reconciled"
                );
                Ok(ProcessOutcome::Reconciled)
            }
            Err(err) => {
                self.record_error(request_id, &err);
                Err(err)
            }
        }
    }

    /// Oldest Pending request of the same requester emitted before `event`.
    fn earlier_pending(&self, event: &LedgerEvent) -> Result<Option<B256>, ProcessingError> {
        let Some(requester) = event.requester() else {
            return Ok(None);
        };
        let position = event.position();
        Ok(self
            .tracker
            .pending()?
            .into_iter()
            .find(|r| r.requester == Some(requester) && r.event.position() < position)
            .map(|r| r.request_id))
    }

    /// Run the requester's waiting requests in chain order until one stays Pending.
    async fn resume_waiting(&self, requester: Address) {
        let waiting: Vec<RequestRecord> = match self.tracker.pending() {
            Ok(records) => records
                .into_iter()
                .filter(|r| r.requester == Some(requester) && r.is_waiting())
                .collect(),
            Err(e) => {
                warn!(requester = %requester, error = %e, "Failed to list waiting requests");
                return;
            }
        };

        for record in waiting {
            debug!(request_id = %record.request_id, requester = %requester, "Resuming waiting request");
            match self.run_request(&record.event).await {
                Ok(_) => {}
                Err(err) if err.disposition() == Disposition::Reject => {}
                Err(_) => break,
            }
        }
    }

    fn record_error(&self, request_id: B256, err: &ProcessingError) {
        let code = err.error_code();
        let recorded = match err.disposition() {
            Disposition::Reject => {
                warn!(
                    request_id = %request_id,
                    error_code = code,
                    error = %err,
                    "Request rejected"
                );
                self.tracker.mark_rejected(request_id, code)
            }
            Disposition::Retry => {
                warn!(
                    request_id = %request_id,
                    error_code = code,
                    error = %err,
                    "Request failed, will retry"
                );
                self.tracker
                    .record_failure(request_id, code, err.to_string(), true)
            }
            Disposition::Investigate => {
                error!(
                    request_id = %request_id,
                    error_code = code,
                    error = %err,
                    "Request needs operator attention"
                );
                self.tracker
                    .record_failure(request_id, code, err.to_string(), false)
            }
            Disposition::Wait => {
                info!(request_id = %request_id, error = %err, "Request held behind an earlier one");
                match err {
                    ProcessingError::Waiting { earlier } => {
                        self.tracker.mark_waiting(request_id, *earlier)
                    }
                    _ => self
                        .tracker
                        .record_failure(request_id, code, err.to_string(), false),
                }
            }
        };

        if let Err(e) = recorded {
            error!(request_id = %request_id, error = %e, "Failed to record request failure");
        }
    }

    async fn process_deposit(&self, deposit: &DepositRequested) -> Result<Written, ProcessingError> {
        let computed = deposit_request_id(&deposit.packed_data);
        if computed != deposit.request_id {
            return Err(ProcessingError::Integrity(format!(
                "packed data hashes to {:#x}, event carries {:#x}",
                computed, deposit.request_id
            )));
        }
        let packed = PackedDeposit::decode(&deposit.packed_data)?;

        let user = self.registered_user(packed.requester)?;
        let user_index = self.resolve_user_index(&user, &deposit.encrypted_index).await?;

        if self.ledger.request_completed(deposit.request_id).await? {
            return Ok(Written::AlreadyOnLedger);
        }

        let current = self.current_balance(user_index).await?;
        let key = self.select_key(user.address, current.key)?;
        let new_balance = current
            .balance
            .checked_add(packed.amount)
            .ok_or(ProcessingError::Overflow)?;

        let write = self.seal_envelope(&user, user_index, deposit.request_id, new_balance, &key)?;
        let confirmation = self.ledger.store_deposit(write).await?;
        Ok(Written::Confirmed(confirmation))
    }

    async fn process_withdrawal(
        &self,
        withdrawal: &WithdrawalRequested,
    ) -> Result<Written, ProcessingError> {
        identity::verify_withdrawal(withdrawal.requester, withdrawal.amount, &withdrawal.signature)
            .map_err(ProcessingError::UnauthorizedWithdrawal)?;

        let user = self.registered_user(withdrawal.requester)?;
        let user_index = self.resolve_user_index(&user, &Bytes::new()).await?;

        if self.ledger.request_completed(withdrawal.request_id).await? {
            return Ok(Written::AlreadyOnLedger);
        }

        let current = self.current_balance(user_index).await?;
        if current.balance < withdrawal.amount {
            return Err(ProcessingError::InsufficientBalance);
        }
        let key = self.select_key(user.address, current.key)?;
        let new_balance = current.balance - withdrawal.amount;

        let write =
            self.seal_envelope(&user, user_index, withdrawal.request_id, new_balance, &key)?;
        let confirmation = self
            .ledger
            .process_withdrawal(write, withdrawal.requester, withdrawal.amount)
            .await?;
        Ok(Written::Confirmed(confirmation))
    }

    /// Open the encrypted user index (from the event, else from the ledger)
    /// and check it against the registration.
    async fn resolve_user_index(
        &self,
        user: &UserRecord,
        event_index: &Bytes,
    ) -> Result<B256, ProcessingError> {
        let sealed = if event_index.is_empty() {
            self.ledger.get_user_index(user.address).await?
        } else {
            event_index.clone()
        };

        // Not yet authenticated on-chain; the registration already fixes the slot.
        if sealed.is_empty() {
            return Ok(user.user_index);
        }

        let user_index = open_user_index(&sealed, self.identity.secret_key())?;
        if user_index != user.user_index {
            return Err(ProcessingError::Integrity(
                "on-chain user index does not match the registered one".to_string(),
            ));
        }
        Ok(user_index)
    }

    async fn current_balance(&self, user_index: B256) -> Result<CurrentBalance, ProcessingError> {
        let envelope = self.ledger.get_encrypted_balance(user_index).await?;
        if !envelope.exists {
            return Ok(CurrentBalance {
                balance: U256::ZERO,
                key: None,
            });
        }

        let key = unwrap_key(&envelope.wrapped_key_server, self.identity.secret_key())?;
        let plaintext = cipher::decrypt_packed(&envelope.encrypted_amount, key.as_bytes())?;
        Ok(CurrentBalance {
            balance: decode_balance(&plaintext)?,
            key: Some(key),
        })
    }

    fn select_key(
        &self,
        user: Address,
        envelope_key: Option<SymmetricKey>,
    ) -> Result<SymmetricKey, ProcessingError> {
        let cached = self.store.get_key(user)?;

        let key = match (cached, envelope_key) {
            (None, None) => {
                let key = SymmetricKey::generate(KeyId::default());
                self.store.put_key(user, &key)?;
                debug!(user = %user, key_id = %key.id(), "Generated balance key");
                key
            }
            (None, Some(from_envelope)) => {
                self.store.put_key(user, &from_envelope)?;
                from_envelope
            }
            (Some(cached), None) => cached,
            (Some(cached), Some(from_envelope)) => match cached.id().cmp(&from_envelope.id()) {
                // Rotated since the last write.
                Ordering::Greater => cached,
                Ordering::Less => {
                    self.store.put_key(user, &from_envelope)?;
                    from_envelope
                }
                Ordering::Equal if cached == from_envelope => cached,
                Ordering::Equal => {
                    return Err(ProcessingError::KeyMismatch {
                        key_id: cached.id(),
                    })
                }
            },
        };
        Ok(key)
    }

    fn seal_envelope(
        &self,
        user: &UserRecord,
        user_index: B256,
        request_id: B256,
        balance: U256,
        key: &SymmetricKey,
    ) -> Result<EnvelopeWrite, ProcessingError> {
        let user_public = user.public_key()?;

        let encrypted_amount = cipher::encrypt_packed(&encode_balance(balance), key.as_bytes())?;
        let wrapped_key_user = wrap_key(key, &user_public)?;
        let wrapped_key_server = wrap_key(key, self.identity.public_key())?;

        // The server half must reopen to the same balance before it goes on-chain.
        let reopened = unwrap_key(&wrapped_key_server, self.identity.secret_key())?;
        let check = decode_balance(&cipher::decrypt_packed(&encrypted_amount, reopened.as_bytes())?)?;
        if reopened != *key || check != balance {
            return Err(ProcessingError::Protocol(
                "server copy of the envelope does not reopen to the new balance",
            ));
        }

        Ok(EnvelopeWrite {
            request_id,
            user_index,
            encrypted_amount: encrypted_amount.into(),
            wrapped_key_user: wrapped_key_user.into(),
            wrapped_key_server: wrapped_key_server.into(),
        })
    }
}
