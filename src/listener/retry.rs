// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Retry Worker
//!
//! Background task that re-dispatches Pending requests whose last attempt
//! failed for a retriable reason (ledger unavailable, unregistered user,
//! storage hiccup).
//!
//! ## Strategy
//!
//! - The first sweep after startup re-dispatches every Pending request that
//!   has never been attempted: the listener may have checkpointed past them
//!   right before a crash.
//! - Every `interval` afterwards, retry candidates are re-dispatched once
//!   their backoff (`interval * 2^(attempts-1)`, capped) has elapsed.
//! - Requests that failed for a non-retriable reason stay Pending for an
//!   operator and are never picked up here.
//! - A request waiting behind an older one of the same requester is normally
//!   resumed by the orchestrator when the older one closes. If that never
//!   happened (crash in between), the sweep re-dispatches it once nothing
//!   older of that requester is Pending.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`, like the `EventListener`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Dispatcher;
use crate::storage::{RequestRecord, RequestTracker};

/// Default interval between retry sweeps.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Longest wait between two attempts of one request.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

pub struct RetryWorker {
    tracker: RequestTracker,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl RetryWorker {
    pub fn new(tracker: RequestTracker, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            tracker,
            dispatcher,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the retry loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Retry worker starting"
        );

        let mut recovering = true;
        loop {
            if shutdown.is_cancelled() {
                info!("Retry worker shutting down");
                return;
            }

            self.sweep(recovering, Utc::now()).await;
            recovering = false;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Retry worker shutting down");
                    return;
                }
            }
        }
    }

    /// Re-dispatch due requests. Returns how many were queued.
    pub async fn sweep(&self, recovering: bool, now: DateTime<Utc>) -> usize {
        let records = match self.tracker.pending() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Retry worker: failed to list pending requests");
                return 0;
            }
        };

        let due: Vec<RequestRecord> = records
            .iter()
            .filter(|r| {
                (recovering && r.attempts == 0) || self.is_due(r, now) || is_released(r, &records)
            })
            .cloned()
            .collect();

        if due.is_empty() {
            return 0;
        }

        info!(count = due.len(), recovering, "Retry worker: re-dispatching requests");

        let mut queued = 0;
        for record in due {
            match self.dispatcher.dispatch(record.event).await {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!(
                        request_id = %record.request_id,
                        error = %e,
                        "Retry worker: dispatch failed"
                    );
                    break;
                }
            }
        }
        queued
    }

    fn is_due(&self, record: &RequestRecord, now: DateTime<Utc>) -> bool {
        if !record.is_retry_candidate() {
            return false;
        }
        let Some(failure) = &record.last_error else {
            return false;
        };
        let wait = chrono::Duration::from_std(backoff(self.interval, record.attempts))
            .unwrap_or(chrono::Duration::MAX);
        failure
            .at
            .checked_add_signed(wait)
            .is_some_and(|retry_at| retry_at <= now)
    }
}

/// Waiting, with no older Pending request of the same requester left.
fn is_released(record: &RequestRecord, pending: &[RequestRecord]) -> bool {
    record.is_waiting()
        && !pending.iter().any(|other| {
            other.requester == record.requester && other.event.position() < record.event.position()
        })
}

/// Wait before attempt `attempts + 1`.
fn backoff(base: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, U256};
    use k256::SecretKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::blockchain::MemoryLedger;
    use crate::client;
    use crate::identity::{self, ServerIdentity};
    use crate::orchestrator::Orchestrator;
    use crate::storage::MemoryStore;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff(base, 1), Duration::from_secs(30));
        assert_eq!(backoff(base, 2), Duration::from_secs(60));
        assert_eq!(backoff(base, 3), Duration::from_secs(120));
        assert_eq!(backoff(base, 40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn retriable_failure_is_retried_after_backoff() {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            ServerIdentity::from_secret(SecretKey::random(&mut OsRng)),
            ledger.clone(),
            store.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            orchestrator.clone(),
            4,
            CancellationToken::new(),
        ));
        let worker = RetryWorker::new(orchestrator.tracker().clone(), dispatcher.clone());

        let secret = SecretKey::random(&mut OsRng);
        let address: Address = identity::address_of(&secret.public_key());
        let (signature, _) = client::register(&secret).unwrap();
        let record = orchestrator.register_user(address, &signature).await.unwrap();

        ledger.fail_next_writes(1);
        let event = ledger.request_deposit(address, U256::from(25u64), record.encrypted_index);
        assert!(orchestrator.handle_event(&event).await.is_err());

        // Backoff not elapsed yet.
        assert_eq!(worker.sweep(false, Utc::now()).await, 0);

        let later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(worker.sweep(false, later).await, 1);
        dispatcher.drain().await;

        let status = orchestrator.request_status(event.request_id()).unwrap().unwrap();
        assert!(!status.is_pending());
        assert_eq!(ledger.write_count(), 1);
    }

    #[tokio::test]
    async fn startup_sweep_recovers_undispatched_requests() {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            ServerIdentity::from_secret(SecretKey::random(&mut OsRng)),
            ledger.clone(),
            store.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            orchestrator.clone(),
            4,
            CancellationToken::new(),
        ));
        let worker = RetryWorker::new(orchestrator.tracker().clone(), dispatcher.clone());

        let secret = SecretKey::random(&mut OsRng);
        let address = identity::address_of(&secret.public_key());
        let (signature, _) = client::register(&secret).unwrap();
        let record = orchestrator.register_user(address, &signature).await.unwrap();

        // Recorded by the listener, never dispatched.
        let event = ledger.request_deposit(address, U256::from(9u64), record.encrypted_index);
        orchestrator.tracker().record_pending(&event).unwrap();

        assert_eq!(worker.sweep(false, Utc::now()).await, 0);
        assert_eq!(worker.sweep(true, Utc::now()).await, 1);
        dispatcher.drain().await;

        let balance = client::read_balance(ledger.as_ref(), record.user_index, &secret)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(balance.balance, U256::from(9u64));
    }

    #[tokio::test]
    async fn waiting_request_is_released_once_nothing_older_is_pending() {
        let ledger = Arc::new(MemoryLedger::new());
        let orchestrator = Arc::new(Orchestrator::new(
            ServerIdentity::from_secret(SecretKey::random(&mut OsRng)),
            ledger.clone(),
            Arc::new(MemoryStore::new()),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            orchestrator.clone(),
            4,
            CancellationToken::new(),
        ));
        let worker = RetryWorker::new(orchestrator.tracker().clone(), dispatcher.clone());
        let tracker = orchestrator.tracker();

        let secret = SecretKey::random(&mut OsRng);
        let address = identity::address_of(&secret.public_key());
        let (signature, _) = client::register(&secret).unwrap();
        let record = orchestrator.register_user(address, &signature).await.unwrap();

        let older = ledger.request_deposit(address, U256::from(1u64), record.encrypted_index.clone());
        let held = ledger.request_deposit(address, U256::from(4u64), record.encrypted_index);
        tracker.record_pending(&older).unwrap();
        tracker.record_pending(&held).unwrap();
        tracker
            .mark_waiting(held.request_id(), older.request_id())
            .unwrap();
        tracker
            .record_failure(older.request_id(), "key_mismatch", "operator".into(), false)
            .unwrap();

        // Still behind a pending request.
        assert_eq!(worker.sweep(false, Utc::now()).await, 0);

        // The older request was closed without resuming the one behind it.
        tracker.mark_rejected(older.request_id(), "integrity_error").unwrap();
        assert_eq!(worker.sweep(false, Utc::now()).await, 1);
        dispatcher.drain().await;

        assert!(!orchestrator
            .request_status(held.request_id())
            .unwrap()
            .unwrap()
            .is_pending());
        let balance = client::read_balance(ledger.as_ref(), record.user_index, &secret)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(balance.balance, U256::from(4u64));
    }
}
