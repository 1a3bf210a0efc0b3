// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Request Tracker
//!
//! Per-request state machine over a [`RequestStore`]:
//!
//! ```text
//!            record_pending            mark_applied / mark_reconciled / mark_rejected
//!  (event) ─────────────────▶ Pending ─────────────────────────────────────────────▶ Processed
//!                               │  ▲
//!                               └──┘ record_failure (attempts += 1)
//!                                    mark_waiting   (attempts unchanged)
//! ```
//!
//! `Processed` is terminal. Every transition out of `Pending` fails with
//! [`StorageError::AlreadyProcessed`] when the request is already closed, so a
//! duplicate event can never apply a second balance mutation.
//!
//! Callers serialise transitions for one identity (see the orchestrator's
//! identity locks); the tracker itself does not lock.

use std::sync::Arc;

use alloy::primitives::B256;
use chrono::Utc;

use super::{
    FailureRecord, RequestRecord, StorageError, StorageResult, Store, WAITING_ERROR_CODE,
};
use crate::blockchain::{LedgerEvent, TxConfirmation};

#[derive(Clone)]
pub struct RequestTracker {
    store: Arc<dyn Store>,
}

impl RequestTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record the event as Pending. Idempotent: a known id returns the existing record.
    pub fn record_pending(&self, event: &LedgerEvent) -> StorageResult<RequestRecord> {
        self.store
            .insert_request_if_absent(&RequestRecord::new_pending(event))
    }

    pub fn get(&self, request_id: B256) -> StorageResult<Option<RequestRecord>> {
        self.store.get_request(request_id)
    }

    pub fn is_processed(&self, request_id: B256) -> StorageResult<bool> {
        Ok(self
            .store
            .get_request(request_id)?
            .is_some_and(|r| !r.is_pending()))
    }

    /// Every request not yet Processed, in chain order.
    pub fn pending(&self) -> StorageResult<Vec<RequestRecord>> {
        self.store.pending_requests()
    }

    /// Pending requests whose last failure is retriable, in chain order.
    pub fn retry_candidates(&self) -> StorageResult<Vec<RequestRecord>> {
        Ok(self
            .store
            .pending_requests()?
            .into_iter()
            .filter(RequestRecord::is_retry_candidate)
            .collect())
    }

    pub fn mark_applied(
        &self,
        request_id: B256,
        confirmation: &TxConfirmation,
    ) -> StorageResult<RequestRecord> {
        self.transition(request_id, |r| r.applied(confirmation))
    }

    pub fn mark_reconciled(&self, request_id: B256) -> StorageResult<RequestRecord> {
        self.transition(request_id, RequestRecord::reconciled)
    }

    pub fn mark_rejected(&self, request_id: B256, error_code: &str) -> StorageResult<RequestRecord> {
        self.transition(request_id, |r| r.rejected(error_code))
    }

    /// Keep the request Pending and remember why this attempt failed.
    pub fn record_failure(
        &self,
        request_id: B256,
        error_code: &str,
        message: String,
        retriable: bool,
    ) -> StorageResult<RequestRecord> {
        let failure = FailureRecord {
            error_code: error_code.to_string(),
            message,
            retriable,
            at: Utc::now(),
        };
        self.transition(request_id, |r| r.failed(failure))
    }

    /// Keep the request Pending behind `earlier`, an older Pending request of the same requester.
    pub fn mark_waiting(&self, request_id: B256, earlier: B256) -> StorageResult<RequestRecord> {
        let failure = FailureRecord {
            error_code: WAITING_ERROR_CODE.to_string(),
            message: format!("waiting for request {:#x}", earlier),
            retriable: false,
            at: Utc::now(),
        };
        self.transition(request_id, |r| r.held(failure))
    }

    fn transition(
        &self,
        request_id: B256,
        apply: impl FnOnce(&mut RequestRecord),
    ) -> StorageResult<RequestRecord> {
        let mut record = self
            .store
            .get_request(request_id)?
            .ok_or_else(|| StorageError::NotFound(format!("request {:#x}", request_id)))?;

        if !record.is_pending() {
            return Err(StorageError::AlreadyProcessed(request_id));
        }

        apply(&mut record);
        self.store.put_request(&record)?;
        Ok(record)
    }
}
