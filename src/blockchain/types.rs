// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ledger types shared by the contract client and the in-memory ledger.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::codec::PackedDeposit;

/// Network metadata used for logging and explorer links.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Network name for display
    pub name: String,
    /// Block explorer URL (no trailing slash)
    pub explorer_url: Option<String>,
}

impl NetworkConfig {
    /// Explorer link for a transaction, if an explorer is configured.
    pub fn tx_url(&self, tx_hash: &B256) -> Option<String> {
        self.explorer_url
            .as_ref()
            .map(|base| format!("{}/tx/{:#x}", base.trim_end_matches('/'), tx_hash))
    }
}

/// `DepositRequested(requestId, packedData, encryptedIndex)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequested {
    pub request_id: B256,
    pub packed_data: Bytes,
    /// Encrypted user index; empty when the user has not authenticated yet.
    pub encrypted_index: Bytes,
}

/// `WithdrawalRequested(requestId, user, amount, signature, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequested {
    pub request_id: B256,
    pub requester: Address,
    pub amount: U256,
    pub signature: Bytes,
    pub timestamp: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEventKind {
    Deposit(DepositRequested),
    Withdrawal(WithdrawalRequested),
}

/// A request event with its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub kind: LedgerEventKind,
}

impl LedgerEvent {
    pub fn request_id(&self) -> B256 {
        match &self.kind {
            LedgerEventKind::Deposit(d) => d.request_id,
            LedgerEventKind::Withdrawal(w) => w.request_id,
        }
    }

    /// Address whose balance this event mutates.
    ///
    /// Malformed deposit data yields `None`; such requests are rejected
    /// before any identity-scoped work happens.
    pub fn requester(&self) -> Option<Address> {
        match &self.kind {
            LedgerEventKind::Deposit(d) => PackedDeposit::decode(&d.packed_data)
                .ok()
                .map(|p| p.requester),
            LedgerEventKind::Withdrawal(w) => Some(w.requester),
        }
    }

    /// Requested amount, when it can be read without validation.
    pub fn amount(&self) -> Option<U256> {
        match &self.kind {
            LedgerEventKind::Deposit(d) => PackedDeposit::decode(&d.packed_data)
                .ok()
                .map(|p| p.amount),
            LedgerEventKind::Withdrawal(w) => Some(w.amount),
        }
    }

    pub fn request_kind(&self) -> RequestKind {
        match self.kind {
            LedgerEventKind::Deposit(_) => RequestKind::Deposit,
            LedgerEventKind::Withdrawal(_) => RequestKind::Withdrawal,
        }
    }

    /// Chain ordering key.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Deposit,
    Withdrawal,
}

/// Result of `getEncryptedBalance(userIndex)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredEnvelope {
    pub encrypted_amount: Bytes,
    pub wrapped_key_user: Bytes,
    pub wrapped_key_server: Bytes,
    pub exists: bool,
    /// Block of the last write, when the ledger reports it.
    pub last_updated: Option<u64>,
}

/// A complete envelope to be written for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeWrite {
    pub request_id: B256,
    pub user_index: B256,
    pub encrypted_amount: Bytes,
    pub wrapped_key_user: Bytes,
    pub wrapped_key_server: Bytes,
}

/// A mined ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfirmation {
    pub tx_hash: B256,
    pub block_number: u64,
}

/// Errors that can occur during ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: B256 },

    /// Sent but not confirmed in time. The write may still land.
    #[error("Transaction {tx_hash} not confirmed: {reason}")]
    Unconfirmed { tx_hash: B256, reason: String },
}

impl LedgerError {
    /// Transport failures are retried; reverts are not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, LedgerError::Rpc(_) | LedgerError::Unconfirmed { .. })
    }
}
