// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory store for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use alloy::primitives::{Address, B256};

use super::*;

#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<HashMap<Address, SymmetricKey>>,
    users: Mutex<HashMap<Address, UserRecord>>,
    requests: Mutex<HashMap<B256, RequestRecord>>,
    checkpoint: Mutex<Option<u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl KeyStore for MemoryStore {
    fn get_key(&self, user: Address) -> StorageResult<Option<SymmetricKey>> {
        Ok(lock(&self.keys).get(&user).cloned())
    }

    fn put_key(&self, user: Address, key: &SymmetricKey) -> StorageResult<()> {
        lock(&self.keys).insert(user, key.clone());
        Ok(())
    }
}

impl UserDirectory for MemoryStore {
    fn get_user(&self, address: Address) -> StorageResult<Option<UserRecord>> {
        Ok(lock(&self.users).get(&address).cloned())
    }

    fn put_user(&self, record: &UserRecord) -> StorageResult<()> {
        lock(&self.users).insert(record.address, record.clone());
        Ok(())
    }
}

impl RequestStore for MemoryStore {
    fn get_request(&self, request_id: B256) -> StorageResult<Option<RequestRecord>> {
        Ok(lock(&self.requests).get(&request_id).cloned())
    }

    fn put_request(&self, record: &RequestRecord) -> StorageResult<()> {
        lock(&self.requests).insert(record.request_id, record.clone());
        Ok(())
    }

    fn insert_request_if_absent(&self, record: &RequestRecord) -> StorageResult<RequestRecord> {
        let mut requests = lock(&self.requests);
        Ok(requests
            .entry(record.request_id)
            .or_insert_with(|| record.clone())
            .clone())
    }

    fn pending_requests(&self) -> StorageResult<Vec<RequestRecord>> {
        let mut pending: Vec<RequestRecord> = lock(&self.requests)
            .values()
            .filter(|r| r.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.event.position());
        Ok(pending)
    }
}

impl CheckpointStore for MemoryStore {
    fn last_scanned_block(&self) -> StorageResult<Option<u64>> {
        Ok(*lock(&self.checkpoint))
    }

    fn set_last_scanned_block(&self, block: u64) -> StorageResult<()> {
        *lock(&self.checkpoint) = Some(block);
        Ok(())
    }
}
