// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Durable server-side state, split by concern:
//!
//! - [`KeyStore`]: per-user symmetric balance keys
//! - [`UserDirectory`]: registered users and their recovered public keys
//! - [`RequestStore`]: deposit/withdrawal tracker entries
//! - [`CheckpointStore`]: last block scanned by the event listener
//!
//! Two backends implement all four: [`RedbStore`] under `DATA_DIR` for
//! production and [`MemoryStore`] for tests.
//!
//! ## Important Notes
//!
//! - Key bytes are stored as-is; `DATA_DIR` must live on an encrypted volume
//! - The on-chain envelope remains the source of truth for balances; nothing
//!   here stores a plaintext balance

pub mod database;
pub mod memory;
pub mod records;
pub mod tracker;

use alloy::primitives::{Address, B256};

use crate::crypto::{KeyId, SymmetricKey};

pub use database::RedbStore;
pub use memory::MemoryStore;
pub use records::{
    FailureRecord, RequestRecord, RequestStatus, Resolution, UserRecord, WAITING_ERROR_CODE,
};
pub use tracker::RequestTracker;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request {0} is already processed")]
    AlreadyProcessed(B256),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// Traits
// =============================================================================

pub trait KeyStore: Send + Sync {
    fn get_key(&self, user: Address) -> StorageResult<Option<SymmetricKey>>;

    fn put_key(&self, user: Address, key: &SymmetricKey) -> StorageResult<()>;

    /// Replace the user's key with a fresh one carrying the next key id.
    ///
    /// The envelope keeps the old key until the next write re-encrypts it.
    fn rotate_key(&self, user: Address) -> StorageResult<SymmetricKey> {
        let next = match self.get_key(user)? {
            Some(current) => current.rotated(),
            None => SymmetricKey::generate(KeyId::default()),
        };
        self.put_key(user, &next)?;
        Ok(next)
    }
}

pub trait UserDirectory: Send + Sync {
    fn get_user(&self, address: Address) -> StorageResult<Option<UserRecord>>;

    fn put_user(&self, record: &UserRecord) -> StorageResult<()>;
}

pub trait RequestStore: Send + Sync {
    fn get_request(&self, request_id: B256) -> StorageResult<Option<RequestRecord>>;

    fn put_request(&self, record: &RequestRecord) -> StorageResult<()>;

    /// Insert unless a record with the same id exists. Returns the stored record.
    fn insert_request_if_absent(&self, record: &RequestRecord) -> StorageResult<RequestRecord>;

    /// All records still in the Pending state.
    fn pending_requests(&self) -> StorageResult<Vec<RequestRecord>>;
}

pub trait CheckpointStore: Send + Sync {
    fn last_scanned_block(&self) -> StorageResult<Option<u64>>;

    fn set_last_scanned_block(&self, block: u64) -> StorageResult<()>;
}

/// Everything the orchestrator and listener persist.
pub trait Store: KeyStore + UserDirectory + RequestStore + CheckpointStore {}

impl<T> Store for T where T: KeyStore + UserDirectory + RequestStore + CheckpointStore {}
