// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process ledger.
//!
//! Mirrors the contract's storage (envelopes, user indexes, completed requests)
//! and its event log. Tests drive it directly and inject transport failures.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;

use super::types::*;
use super::Ledger;
use crate::codec::PackedDeposit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payout {
    pub user: Address,
    pub amount: U256,
}

#[derive(Default)]
struct State {
    block: u64,
    next_log_index: u64,
    events: Vec<LedgerEvent>,
    user_indexes: HashMap<Address, Bytes>,
    envelopes: HashMap<B256, StoredEnvelope>,
    completed: HashSet<B256>,
    payouts: Vec<Payout>,
    writes: usize,
    fail_writes: usize,
    lose_confirmations: usize,
    unavailable: bool,
}

impl State {
    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable {
            return Err(LedgerError::Rpc("connection refused".to_string()));
        }
        Ok(())
    }

    fn push_event(&mut self, kind: LedgerEventKind) -> LedgerEvent {
        self.block += 1;
        let event = LedgerEvent {
            block_number: self.block,
            log_index: self.next_log_index,
            kind,
        };
        self.next_log_index += 1;
        self.events.push(event.clone());
        event
    }

    fn apply_write(&mut self, write: &EnvelopeWrite) -> Result<TxConfirmation, LedgerError> {
        self.check_available()?;
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(LedgerError::Rpc("nonce too low".to_string()));
        }
        if self.completed.contains(&write.request_id) {
            return Err(LedgerError::Reverted {
                tx_hash: keccak256(write.request_id),
            });
        }

        self.block += 1;
        self.writes += 1;
        self.completed.insert(write.request_id);
        self.envelopes.insert(
            write.user_index,
            StoredEnvelope {
                encrypted_amount: write.encrypted_amount.clone(),
                wrapped_key_user: write.wrapped_key_user.clone(),
                wrapped_key_server: write.wrapped_key_server.clone(),
                exists: true,
                last_updated: Some(self.block),
            },
        );

        let tx_hash = keccak256(write.request_id);
        if self.lose_confirmations > 0 {
            self.lose_confirmations -= 1;
            return Err(LedgerError::Unconfirmed {
                tx_hash,
                reason: "timed out waiting for receipt".to_string(),
            });
        }

        Ok(TxConfirmation {
            tx_hash,
            block_number: self.block,
        })
    }
}

/// Ledger held entirely in memory.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    // -------------------------------------------------------------------------
    // Contract-side actions
    // -------------------------------------------------------------------------

    /// `authenticateUser(encryptedIndex)` as sent by the user.
    pub fn authenticate_user(&self, user: Address, encrypted_index: impl Into<Bytes>) {
        let encrypted_index = encrypted_index.into();
        self.with_state(|s| {
            s.user_indexes.insert(user, encrypted_index);
        });
    }

    /// `deposit(amount, encryptedIndex)`: emits `DepositRequested` with well-formed data.
    pub fn request_deposit(
        &self,
        user: Address,
        amount: U256,
        encrypted_index: impl Into<Bytes>,
    ) -> LedgerEvent {
        let encrypted_index = encrypted_index.into();
        self.with_state(|s| {
            let packed = PackedDeposit {
                requester: user,
                amount,
                timestamp: U256::from(1_700_000_000u64 + s.block),
                block_number: U256::from(s.block + 1),
            }
            .encode();
            s.push_event(LedgerEventKind::Deposit(DepositRequested {
                request_id: keccak256(&packed),
                packed_data: packed.into(),
                encrypted_index,
            }))
        })
    }

    /// Emit an arbitrary deposit event, including ones whose id does not match.
    pub fn emit_deposit(&self, deposit: DepositRequested) -> LedgerEvent {
        self.with_state(|s| s.push_event(LedgerEventKind::Deposit(deposit)))
    }

    /// `requestWithdrawal(amount, signature)`.
    pub fn request_withdrawal(
        &self,
        user: Address,
        amount: U256,
        signature: impl Into<Bytes>,
    ) -> LedgerEvent {
        let signature = signature.into();
        self.with_state(|s| {
            let timestamp = U256::from(1_700_000_000u64 + s.block);
            let mut seed = Vec::with_capacity(20 + 32 + 32);
            seed.extend_from_slice(user.as_slice());
            seed.extend_from_slice(&amount.to_be_bytes::<32>());
            seed.extend_from_slice(&timestamp.to_be_bytes::<32>());
            s.push_event(LedgerEventKind::Withdrawal(WithdrawalRequested {
                request_id: keccak256(seed),
                requester: user,
                amount,
                signature,
                timestamp,
            }))
        })
    }

    // -------------------------------------------------------------------------
    // Failure injection
    // -------------------------------------------------------------------------

    /// The next `n` writes fail before reaching the chain.
    pub fn fail_next_writes(&self, n: usize) {
        self.with_state(|s| s.fail_writes = n);
    }

    /// The next `n` writes land but the caller never sees the receipt.
    pub fn lose_next_confirmations(&self, n: usize) {
        self.with_state(|s| s.lose_confirmations = n);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_state(|s| s.unavailable = unavailable);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn envelope(&self, user_index: B256) -> Option<StoredEnvelope> {
        self.with_state(|s| s.envelopes.get(&user_index).cloned())
    }

    /// Number of confirmed writes.
    pub fn write_count(&self) -> usize {
        self.with_state(|s| s.writes)
    }

    pub fn payouts(&self) -> Vec<Payout> {
        self.with_state(|s| s.payouts.clone())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn latest_block(&self) -> Result<u64, LedgerError> {
        self.with_state(|s| {
            s.check_available()?;
            Ok(s.block)
        })
    }

    async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.with_state(|s| {
            s.check_available()?;
            let mut events: Vec<LedgerEvent> = s
                .events
                .iter()
                .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
                .cloned()
                .collect();
            events.sort_by_key(LedgerEvent::position);
            Ok(events)
        })
    }

    async fn get_user_index(&self, user: Address) -> Result<Bytes, LedgerError> {
        self.with_state(|s| {
            s.check_available()?;
            Ok(s.user_indexes.get(&user).cloned().unwrap_or_default())
        })
    }

    async fn get_encrypted_balance(&self, user_index: B256) -> Result<StoredEnvelope, LedgerError> {
        self.with_state(|s| {
            s.check_available()?;
            Ok(s.envelopes.get(&user_index).cloned().unwrap_or_default())
        })
    }

    async fn request_completed(&self, request_id: B256) -> Result<bool, LedgerError> {
        self.with_state(|s| {
            s.check_available()?;
            Ok(s.completed.contains(&request_id))
        })
    }

    async fn store_deposit(&self, write: EnvelopeWrite) -> Result<TxConfirmation, LedgerError> {
        self.with_state(|s| s.apply_write(&write))
    }

    async fn process_withdrawal(
        &self,
        write: EnvelopeWrite,
        user: Address,
        amount: U256,
    ) -> Result<TxConfirmation, LedgerError> {
        self.with_state(|s| {
            let lost_before = s.lose_confirmations;
            let result = s.apply_write(&write);
            // A lost confirmation still means the transfer happened.
            let landed = result.is_ok() || s.lose_confirmations < lost_before;
            if landed {
                s.payouts.push(Payout { user, amount });
            }
            result
        })
    }
}
