// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ledger integration.
//!
//! This module provides:
//! - The [`Ledger`] trait the orchestrator and listener are written against
//! - [`AlloyLedger`], a JSON-RPC client for the deployed contract
//! - [`MemoryLedger`], an in-process ledger for tests and dry runs

pub mod client;
pub mod contract;
pub mod memory;
pub mod types;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

pub use client::AlloyLedger;
pub use memory::MemoryLedger;
pub use types::*;

/// Read and write access to the confidential token contract.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current chain head.
    async fn latest_block(&self) -> Result<u64, LedgerError>;

    /// Request events in `[from_block, to_block]`, ordered by block and log index.
    async fn fetch_events(&self, from_block: u64, to_block: u64)
        -> Result<Vec<LedgerEvent>, LedgerError>;

    /// `getUserIndexByAddress`; empty when the user never authenticated.
    async fn get_user_index(&self, user: Address) -> Result<Bytes, LedgerError>;

    /// `getEncryptedBalance`.
    async fn get_encrypted_balance(&self, user_index: B256) -> Result<StoredEnvelope, LedgerError>;

    /// Whether the contract already recorded a write for this request.
    async fn request_completed(&self, request_id: B256) -> Result<bool, LedgerError>;

    /// `storeDeposit`, awaited until mined.
    async fn store_deposit(&self, write: EnvelopeWrite) -> Result<TxConfirmation, LedgerError>;

    /// `processWithdrawal`, awaited until mined.
    async fn process_withdrawal(
        &self,
        write: EnvelopeWrite,
        user: Address,
        amount: U256,
    ) -> Result<TxConfirmation, LedgerError>;
}
