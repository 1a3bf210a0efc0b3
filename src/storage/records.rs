// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted record types.

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use k256::PublicKey;
use serde::{Deserialize, Serialize};

use super::{StorageError, StorageResult};
use crate::blockchain::{LedgerEvent, RequestKind, TxConfirmation};

// =============================================================================
// Users
// =============================================================================

/// A registered user and the key material needed to wrap for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub address: Address,
    /// SEC1 uncompressed public key recovered from the registration signature.
    pub public_key: Bytes,
    pub user_index: B256,
    /// User index sealed for the server, as handed to the user for `authenticateUser`.
    pub encrypted_index: Bytes,
    pub registered_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn public_key(&self) -> StorageResult<PublicKey> {
        PublicKey::from_sec1_bytes(&self.public_key)
            .map_err(|_| StorageError::Corrupt(format!("public key of user {}", self.address)))
    }
}

// =============================================================================
// Requests
// =============================================================================

/// How a processed request was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Applied { tx_hash: B256, block_number: u64 },
    /// The ledger already held the write when the request was retried.
    Reconciled,
    Rejected { error_code: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processed { resolution: Resolution },
}

impl RequestStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestStatus::Pending)
    }
}

/// `error_code` of a request held behind an earlier Pending request of the same requester.
pub const WAITING_ERROR_CODE: &str = "waiting_for_earlier_request";

/// Last failure seen while processing a still-pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error_code: String,
    pub message: String,
    pub retriable: bool,
    pub at: DateTime<Utc>,
}

/// Tracker entry for one deposit or withdrawal request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: B256,
    pub kind: RequestKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<U256>,
    /// The originating event, kept so the request can be replayed.
    pub event: LedgerEvent,
    pub status: RequestStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn new_pending(event: &LedgerEvent) -> Self {
        let now = Utc::now();
        Self {
            request_id: event.request_id(),
            kind: event.request_kind(),
            requester: event.requester(),
            amount: event.amount(),
            event: event.clone(),
            status: RequestStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status.is_pending()
    }

    /// Pending and held back until an earlier request of the same requester closes.
    pub fn is_waiting(&self) -> bool {
        self.is_pending()
            && self
                .last_error
                .as_ref()
                .is_some_and(|e| e.error_code == WAITING_ERROR_CODE)
    }

    /// Pending and last failed for a reason worth retrying automatically.
    pub fn is_retry_candidate(&self) -> bool {
        self.is_pending() && self.last_error.as_ref().is_some_and(|e| e.retriable)
    }

    pub(crate) fn applied(&mut self, confirmation: &TxConfirmation) {
        self.status = RequestStatus::Processed {
            resolution: Resolution::Applied {
                tx_hash: confirmation.tx_hash,
                block_number: confirmation.block_number,
            },
        };
        self.attempts += 1;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    pub(crate) fn reconciled(&mut self) {
        self.status = RequestStatus::Processed {
            resolution: Resolution::Reconciled,
        };
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    pub(crate) fn rejected(&mut self, error_code: &str) {
        self.status = RequestStatus::Processed {
            resolution: Resolution::Rejected {
                error_code: error_code.to_string(),
            },
        };
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    /// Not an attempt: nothing was computed or written.
    pub(crate) fn held(&mut self, failure: FailureRecord) {
        self.updated_at = failure.at;
        self.last_error = Some(failure);
    }

    pub(crate) fn failed(&mut self, failure: FailureRecord) {
        self.attempts += 1;
        self.updated_at = failure.at;
        self.last_error = Some(failure);
    }
}
