// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded server database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `symmetric_keys`: lowercase address → `{ id, key }` (JSON)
//! - `users`: lowercase address → serialized UserRecord
//! - `requests`: request id (0x hex) → serialized RequestRecord
//! - `listener_state`: key → value (checkpoint state)

use std::path::Path;

use alloy::primitives::{Address, B256};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::*;
use crate::crypto::KEY_LEN;

// =============================================================================
// Table Definitions
// =============================================================================

const SYMMETRIC_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("symmetric_keys");

const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

const REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("requests");

/// Listener state: key → value bytes (e.g., "last_scanned_block" → u64 big-endian).
const LISTENER_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("listener_state");

const LAST_SCANNED_BLOCK: &str = "last_scanned_block";

fn address_key(address: Address) -> String {
    format!("{:#x}", address)
}

fn request_key(request_id: B256) -> String {
    format!("{:#x}", request_id)
}

/// On-disk form of a symmetric key.
#[derive(Serialize, Deserialize)]
struct StoredKey {
    id: KeyId,
    key: String,
}

impl StoredKey {
    fn from_key(key: &SymmetricKey) -> Self {
        Self {
            id: key.id(),
            key: alloy::hex::encode(key.as_bytes()),
        }
    }

    fn into_key(self, owner: Address) -> StorageResult<SymmetricKey> {
        let bytes = alloy::hex::decode(&self.key)
            .ok()
            .and_then(|b| <[u8; KEY_LEN]>::try_from(b.as_slice()).ok())
            .ok_or_else(|| StorageError::Corrupt(format!("symmetric key of {}", owner)))?;
        Ok(SymmetricKey::from_bytes(self.id, bytes))
    }
}

// =============================================================================
// RedbStore
// =============================================================================

/// Embedded ACID store for keys, users, requests and the listener checkpoint.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SYMMETRIC_KEYS)?;
            let _ = write_txn.open_table(USERS)?;
            let _ = write_txn.open_table(REQUESTS)?;
            let _ = write_txn.open_table(LISTENER_STATE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StorageResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StorageResult<()> {
        let json = serde_json::to_vec(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl KeyStore for RedbStore {
    fn get_key(&self, user: Address) -> StorageResult<Option<SymmetricKey>> {
        self.get_json::<StoredKey>(SYMMETRIC_KEYS, &address_key(user))?
            .map(|stored| stored.into_key(user))
            .transpose()
    }

    fn put_key(&self, user: Address, key: &SymmetricKey) -> StorageResult<()> {
        self.put_json(SYMMETRIC_KEYS, &address_key(user), &StoredKey::from_key(key))
    }
}

impl UserDirectory for RedbStore {
    fn get_user(&self, address: Address) -> StorageResult<Option<UserRecord>> {
        self.get_json(USERS, &address_key(address))
    }

    fn put_user(&self, record: &UserRecord) -> StorageResult<()> {
        self.put_json(USERS, &address_key(record.address), record)
    }
}

impl RequestStore for RedbStore {
    fn get_request(&self, request_id: B256) -> StorageResult<Option<RequestRecord>> {
        self.get_json(REQUESTS, &request_key(request_id))
    }

    fn put_request(&self, record: &RequestRecord) -> StorageResult<()> {
        self.put_json(REQUESTS, &request_key(record.request_id), record)
    }

    fn insert_request_if_absent(&self, record: &RequestRecord) -> StorageResult<RequestRecord> {
        let key = request_key(record.request_id);
        let write_txn = self.db.begin_write()?;
        let stored = {
            let mut table = write_txn.open_table(REQUESTS)?;

            // Read existing value and deserialize before mutating
            let existing_bytes = table.get(key.as_str())?.map(|v| v.value().to_vec());

            match existing_bytes {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => {
                    let json = serde_json::to_vec(record)?;
                    table.insert(key.as_str(), json.as_slice())?;
                    record.clone()
                }
            }
        };
        write_txn.commit()?;
        Ok(stored)
    }

    fn pending_requests(&self) -> StorageResult<Vec<RequestRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REQUESTS)?;

        let mut pending = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: RequestRecord = serde_json::from_slice(value.value())?;
            if record.is_pending() {
                pending.push(record);
            }
        }
        pending.sort_by_key(|r| r.event.position());
        Ok(pending)
    }
}

impl CheckpointStore for RedbStore {
    fn last_scanned_block(&self) -> StorageResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LISTENER_STATE)?;
        match table.get(LAST_SCANNED_BLOCK)? {
            Some(v) => {
                let bytes: [u8; 8] = v
                    .value()
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("listener checkpoint".to_string()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn set_last_scanned_block(&self, block: u64) -> StorageResult<()> {
        let bytes = block.to_be_bytes();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LISTENER_STATE)?;
            table.insert(LAST_SCANNED_BLOCK, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
